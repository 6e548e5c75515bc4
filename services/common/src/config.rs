//! Configuration management for SIP Sieve services

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::env;
use std::net::Ipv4Addr;

/// Prefix for environment overrides, e.g. `SIPSIEVE__INTERFACE__NAME=eth1`
pub const ENV_PREFIX: &str = "SIPSIEVE";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Interface the classifier is attached to
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Object file and bpffs locations
    #[serde(default)]
    pub program: ProgramConfig,

    /// Address sets and classifier switches
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Counter reporting
    #[serde(default)]
    pub reporter: ReporterConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Telemetry configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_environment() -> String {
    "development".to_string()
}

/// Interface configuration
#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceConfig {
    /// Interface name
    #[serde(default = "default_interface_name")]
    pub name: String,

    /// Preferred XDP mode: `offload`, `driver` or `generic`
    #[serde(default = "default_xdp_mode")]
    pub xdp_mode: String,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: default_interface_name(),
            xdp_mode: default_xdp_mode(),
        }
    }
}

fn default_interface_name() -> String {
    "eth0".to_string()
}

fn default_xdp_mode() -> String {
    "driver".to_string()
}

/// Program configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProgramConfig {
    /// Compiled XDP object
    #[serde(default = "default_object_path")]
    pub object_path: String,

    /// bpffs directory for the shared maps
    #[serde(default = "default_pin_path")]
    pub pin_path: String,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            object_path: default_object_path(),
            pin_path: default_pin_path(),
        }
    }
}

fn default_object_path() -> String {
    "/usr/lib/sipsieve/xdp_sip".to_string()
}

fn default_pin_path() -> String {
    "/sys/fs/bpf/sipsieve".to_string()
}

/// Policy configuration
///
/// Lists hold dotted-quad IPv4 addresses. In the environment they are
/// comma separated: `SIPSIEVE__POLICY__BLOCKED=203.0.113.7,203.0.113.8`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PolicyConfig {
    /// Sources dropped before their payload is inspected
    #[serde(default)]
    pub blocked: Vec<String>,

    /// Sources allowed to send unsolicited OPTIONS
    #[serde(default)]
    pub allowed: Vec<String>,

    /// Require IPv4 protocol == UDP before reading the transport header
    #[serde(default)]
    pub strict_protocol: bool,

    /// Treat the lists above as the complete contents of the maps.
    ///
    /// Off by default: the agent then only removes addresses it inserted
    /// itself, and entries written by the control plane are left alone.
    #[serde(default)]
    pub authoritative: bool,
}

impl PolicyConfig {
    pub fn blocked_addrs(&self) -> Result<BTreeSet<Ipv4Addr>> {
        parse_addr_list("policy.blocked", &self.blocked)
    }

    pub fn allowed_addrs(&self) -> Result<BTreeSet<Ipv4Addr>> {
        parse_addr_list("policy.allowed", &self.allowed)
    }
}

/// Parse a list of IPv4 addresses, ignoring blanks and duplicates.
pub fn parse_addr_list(field: &str, entries: &[String]) -> Result<BTreeSet<Ipv4Addr>> {
    let mut addrs = BTreeSet::new();

    for entry in entries {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let addr = entry.parse::<Ipv4Addr>().map_err(|_| {
            Error::validation(format!("{}: '{}' is not an IPv4 address", field, entry))
        })?;
        addrs.insert(addr);
    }

    Ok(addrs)
}

/// Reporter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ReporterConfig {
    /// Seconds between counter reads
    #[serde(default = "default_report_interval")]
    pub interval_secs: u64,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_report_interval(),
        }
    }
}

fn default_report_interval() -> u64 {
    10
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port (health checks, metrics, counters)
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    9560
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from environment and files
    pub fn load(service_name: &str) -> std::result::Result<Self, config::ConfigError> {
        let environment =
            env::var("SIPSIEVE_ENV").unwrap_or_else(|_| "development".to_string());

        let config_builder = config::Config::builder()
            // Start with default values
            .set_default("service_name", service_name)?
            .set_default("environment", environment.clone())?
            // Load from config directory
            .add_source(
                config::File::with_name(&format!("config/{}", service_name)).required(false),
            )
            // Load environment-specific config
            .add_source(
                config::File::with_name(&format!("config/{}_{}", service_name, environment))
                    .required(false),
            )
            // Override with environment variables (prefix: SIPSIEVE__)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("policy.blocked")
                    .with_list_parse_key("policy.allowed"),
            );

        config_builder.build()?.try_deserialize()
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Get the HTTP server address
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(toml: &str) -> Config {
        config::Config::builder()
            .set_default("service_name", "agent")
            .unwrap()
            .add_source(config::File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = from_toml("");
        assert_eq!(config.environment, "development");
        assert_eq!(config.interface.name, "eth0");
        assert_eq!(config.interface.xdp_mode, "driver");
        assert_eq!(config.program.pin_path, "/sys/fs/bpf/sipsieve");
        assert_eq!(config.reporter.interval_secs, 10);
        assert_eq!(config.http_addr(), "0.0.0.0:9560");
        assert!(!config.policy.strict_protocol);
        assert!(config.policy.blocked.is_empty());
        assert!(!config.policy.authoritative);
        assert!(!config.is_production());
    }

    #[test]
    fn test_policy_section() {
        let config = from_toml(
            r#"
            [policy]
            blocked = ["203.0.113.7", " 203.0.113.8 ", "203.0.113.7"]
            allowed = ["198.51.100.1", ""]
            strict_protocol = true
            "#,
        );

        let blocked = config.policy.blocked_addrs().unwrap();
        assert_eq!(blocked.len(), 2);
        assert!(blocked.contains(&Ipv4Addr::new(203, 0, 113, 8)));

        let allowed = config.policy.allowed_addrs().unwrap();
        assert_eq!(allowed.into_iter().collect::<Vec<_>>(), vec![Ipv4Addr::new(198, 51, 100, 1)]);
        assert!(config.policy.strict_protocol);
    }

    #[test]
    fn test_invalid_address_rejected() {
        let entries = vec!["10.0.0.1".to_string(), "10.0.0.256".to_string()];
        let err = parse_addr_list("policy.blocked", &entries).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("10.0.0.256"));

        // IPv6 sources never reach the classifier's tables.
        let entries = vec!["2001:db8::1".to_string()];
        assert!(parse_addr_list("policy.allowed", &entries).is_err());
    }
}
