//! Utility modules for stratix-ingest

pub mod pool_monitor;

pub use pool_monitor::{begin_monitored, MonitoredTransaction};
