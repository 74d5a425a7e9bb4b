//! HTTP API handlers for stratix-ingest
//!
//! REST for jobs and templates, SSE for progress and operations events.

pub mod events;
pub mod health;
pub mod imports;
pub mod progress;
pub mod templates;
pub mod tenant;

pub use events::event_stream;
pub use health::health_routes;
pub use imports::import_routes;
pub use templates::template_routes;
pub use tenant::TenantContext;
