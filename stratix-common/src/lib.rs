//! # Stratix Common Library
//!
//! Shared code for Stratix services including:
//! - Error type and result alias
//! - Configuration loading (TOML + environment, graceful defaults)
//! - Event types (StratixEvent, import progress snapshots) and EventBus
//! - Server-Sent Events helpers

pub mod config;
pub mod error;
pub mod events;
pub mod sse;

pub use error::{Error, Result};
