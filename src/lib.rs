pub mod account;
pub mod acme;
pub mod batch;
pub mod cert;
pub mod challenge;
pub mod config;
pub mod factory;
pub mod fs;
pub mod generator;
pub mod handler;
pub mod lock;
pub mod monitor;
pub mod store;
pub mod time;
pub mod timer;

#[cfg(test)]
mod testing;

pub use handler::{CertHandler, GenerateOutcome};
pub use monitor::{CertMonitor, EventKind, MonitorError, MonitorEvent};

pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
