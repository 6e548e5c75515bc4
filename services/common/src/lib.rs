//! SIP Sieve Common Library
//!
//! Configuration, errors, telemetry and metrics shared by the userspace
//! services.

pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

pub use config::Config;
pub use error::{Error, Result};

/// Service metadata
pub struct ServiceInfo {
    pub name: &'static str,
    pub version: &'static str,
}

impl ServiceInfo {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}
