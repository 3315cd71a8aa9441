//! Configuration types for the DNS service
//!
//! The configuration tree mirrors the deployment model: a service holds
//! named server groups; a group holds the listeners that share one handler
//! pipeline and one upstream; each listener is described by an immutable
//! server descriptor.
//!
//! Every level has a `validate()` method; validation runs once after
//! loading, and the rest of the code assumes valid configuration.
//!
//! # Example
//!
//! ```
//! use dnsgate::config::{Config, Protocol, ServerConfig, ServerGroupConfig, UpstreamConfig};
//!
//! let config = Config::new().with_group(
//!     ServerGroupConfig::new(
//!         "default",
//!         UpstreamConfig::new("8.8.8.8:53".parse().unwrap())
//!             .with_fallback("8.8.4.4:53".parse().unwrap()),
//!     )
//!     .with_server(ServerConfig::new(
//!         "udp-main",
//!         Protocol::Udp,
//!         vec!["127.0.0.1:53".parse().unwrap()],
//!     )),
//! );
//!
//! config.validate().expect("valid config");
//! ```

pub mod loader;

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DnsError, DnsResult};

pub use loader::{load_config, load_config_str};

/// Default per-query upstream timeout in milliseconds
pub const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 2_000;

/// Default size of the cache for hosts that do not support ECS
pub const DEFAULT_CACHE_SIZE: u64 = 10_000;

/// Default size of the cache for hosts that support ECS
pub const DEFAULT_ECS_CACHE_SIZE: u64 = 10_000;

/// Default buffer size for reading incoming messages
///
/// Most DNS queries fit in the 512-byte minimum message size.
pub const DEFAULT_MSG_BUFFER_SIZE: usize = 512;

/// Transport protocol of a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Plain DNS over UDP
    #[serde(rename = "udp")]
    Udp,
    /// Plain DNS over TCP
    #[serde(rename = "tcp")]
    Tcp,
    /// DNS-over-TLS (RFC 7858)
    #[serde(rename = "tls")]
    Tls,
    /// DNS-over-HTTPS (RFC 8484) plus the JSON API
    #[serde(rename = "https")]
    Https,
    /// DNS-over-QUIC
    #[serde(rename = "quic")]
    Quic,
    /// DNSCrypt over UDP
    #[serde(rename = "dnscrypt-udp")]
    DnscryptUdp,
    /// DNSCrypt over TCP
    #[serde(rename = "dnscrypt-tcp")]
    DnscryptTcp,
}

impl Protocol {
    /// Check whether this protocol requires TLS material
    #[must_use]
    pub fn requires_tls(self) -> bool {
        matches!(self, Self::Tls | Self::Https | Self::Quic)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Tls => "tls",
            Self::Https => "https",
            Self::Quic => "quic",
            Self::DnscryptUdp => "dnscrypt-udp",
            Self::DnscryptTcp => "dnscrypt-tcp",
        };

        f.write_str(s)
    }
}

/// Healthcheck configuration for the primary upstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    /// Whether the healthcheck probe runs at all
    #[serde(default)]
    pub enabled: bool,

    /// Probe domain template
    ///
    /// A `${RANDOM}` placeholder is replaced with a fresh random token per
    /// probe so intermediate caches never absorb the probe query.
    #[serde(default)]
    pub domain_template: String,

    /// Interval between probes, in milliseconds
    #[serde(default = "default_healthcheck_interval_ms")]
    pub interval_ms: u64,

    /// Probe query timeout, in milliseconds
    #[serde(default = "default_healthcheck_timeout_ms")]
    pub timeout_ms: u64,

    /// Backoff duration, in milliseconds
    ///
    /// Once the primary goes down, traffic does not return to it until
    /// this much time has passed since the last failed probe.
    #[serde(default = "default_healthcheck_backoff_ms")]
    pub backoff_duration_ms: u64,
}

fn default_healthcheck_interval_ms() -> u64 {
    30_000
}

fn default_healthcheck_timeout_ms() -> u64 {
    1_000
}

fn default_healthcheck_backoff_ms() -> u64 {
    60_000
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            domain_template: String::new(),
            interval_ms: default_healthcheck_interval_ms(),
            timeout_ms: default_healthcheck_timeout_ms(),
            backoff_duration_ms: default_healthcheck_backoff_ms(),
        }
    }
}

impl HealthcheckConfig {
    /// Get the probe interval as a `Duration`
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Get the probe timeout as a `Duration`
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Get the backoff duration as a `Duration`
    #[must_use]
    pub fn backoff_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_duration_ms)
    }

    /// Validate the healthcheck configuration
    ///
    /// A disabled healthcheck is always valid; an enabled one requires a
    /// non-empty domain template and strictly positive durations.
    ///
    /// # Errors
    ///
    /// Returns `DnsError::ConfigError` naming the offending field.
    pub fn validate(&self) -> DnsResult<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.domain_template.is_empty() {
            return Err(DnsError::config_field(
                "no domain_template",
                "healthcheck.domain_template",
            ));
        }

        for (value, field) in [
            (self.interval_ms, "healthcheck.interval"),
            (self.timeout_ms, "healthcheck.timeout"),
            (self.backoff_duration_ms, "healthcheck.backoff_duration"),
        ] {
            if value == 0 {
                return Err(DnsError::config_field("must be positive", field));
            }
        }

        Ok(())
    }
}

/// Upstream configuration for a server group
///
/// The primary server takes all traffic while it is considered healthy;
/// the fallbacks are tried in declared order when the primary fails or is
/// marked down by the healthcheck.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// The primary upstream server
    pub server: SocketAddr,

    /// Ordered fallback servers
    #[serde(default)]
    pub fallback: Vec<SocketAddr>,

    /// Per-query timeout, in milliseconds
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,

    /// Optional healthcheck for the primary
    #[serde(default)]
    pub healthcheck: Option<HealthcheckConfig>,
}

fn default_upstream_timeout_ms() -> u64 {
    DEFAULT_UPSTREAM_TIMEOUT_MS
}

impl UpstreamConfig {
    /// Create an upstream configuration with the given primary
    #[must_use]
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            fallback: Vec::new(),
            timeout_ms: DEFAULT_UPSTREAM_TIMEOUT_MS,
            healthcheck: None,
        }
    }

    /// Add a fallback server
    #[must_use]
    pub fn with_fallback(mut self, addr: SocketAddr) -> Self {
        self.fallback.push(addr);
        self
    }

    /// Set the per-query timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the healthcheck configuration
    #[must_use]
    pub fn with_healthcheck(mut self, healthcheck: HealthcheckConfig) -> Self {
        self.healthcheck = Some(healthcheck);
        self
    }

    /// Get the per-query timeout as a `Duration`
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Validate the upstream configuration
    ///
    /// # Errors
    ///
    /// Returns `DnsError::ConfigError` when there is no fallback, the
    /// timeout is zero, or the healthcheck configuration is invalid.
    pub fn validate(&self) -> DnsResult<()> {
        if self.fallback.is_empty() {
            return Err(DnsError::config_field("no fallback", "upstream.fallback"));
        }

        if self.timeout_ms == 0 {
            return Err(DnsError::config_field("must be positive", "upstream.timeout"));
        }

        if let Some(hc) = &self.healthcheck {
            hc.validate()?;
        }

        Ok(())
    }
}

/// TLS material for a TLS, HTTPS, or QUIC listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsFilesConfig {
    /// Path to the PEM certificate chain
    pub certificate_path: PathBuf,

    /// Path to the PEM private key
    pub key_path: PathBuf,

    /// ALPN protocols to advertise
    ///
    /// Defaults per protocol when empty: DoH advertises `h2, http/1.1`
    /// with HTTP/2 first, DoT advertises `dot`.
    #[serde(default)]
    pub alpn: Vec<String>,
}

/// DNSCrypt key material
///
/// Recognized in the configuration surface; the runtime rejects DNSCrypt
/// listeners at service construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnscryptConfig {
    /// Path to the DNSCrypt resolver configuration
    pub config_path: PathBuf,
}

/// Immutable descriptor of one listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server name, unique within the service
    pub name: String,

    /// Transport protocol
    pub protocol: Protocol,

    /// Addresses to bind; one listener is created per address
    pub bind_addresses: Vec<SocketAddr>,

    /// TLS material, required for TLS-based protocols
    #[serde(default)]
    pub tls: Option<TlsFilesConfig>,

    /// DNSCrypt material
    #[serde(default)]
    pub dnscrypt: Option<DnscryptConfig>,
}

impl ServerConfig {
    /// Create a server descriptor
    #[must_use]
    pub fn new(name: impl Into<String>, protocol: Protocol, bind_addresses: Vec<SocketAddr>) -> Self {
        Self {
            name: name.into(),
            protocol,
            bind_addresses,
            tls: None,
            dnscrypt: None,
        }
    }

    /// Set the TLS material
    #[must_use]
    pub fn with_tls(mut self, tls: TlsFilesConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Validate the server descriptor
    ///
    /// # Errors
    ///
    /// Returns `DnsError::ConfigError` for a missing name, empty bind
    /// list, or missing TLS material on a TLS-based protocol.
    pub fn validate(&self) -> DnsResult<()> {
        if self.name.is_empty() {
            return Err(DnsError::config_field("no name", "server.name"));
        }

        if self.bind_addresses.is_empty() {
            return Err(DnsError::config_field(
                format!("server {}: no bind addresses", self.name),
                "server.bind_addresses",
            ));
        }

        if self.protocol.requires_tls() && self.tls.is_none() {
            return Err(DnsError::config_field(
                format!("server {}: {} requires tls material", self.name, self.protocol),
                "server.tls",
            ));
        }

        Ok(())
    }
}

/// A labeled set of listeners sharing one handler pipeline and one
/// upstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerGroupConfig {
    /// Group name
    pub name: String,

    /// The upstream the group forwards to
    pub upstream: UpstreamConfig,

    /// Listener descriptors
    pub servers: Vec<ServerConfig>,

    /// Device-ID wildcards of the form `*.<domain>`
    #[serde(default)]
    pub device_id_wildcards: Vec<String>,
}

impl ServerGroupConfig {
    /// Create a server group
    #[must_use]
    pub fn new(name: impl Into<String>, upstream: UpstreamConfig) -> Self {
        Self {
            name: name.into(),
            upstream,
            servers: Vec::new(),
            device_id_wildcards: Vec::new(),
        }
    }

    /// Add a listener descriptor
    #[must_use]
    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.servers.push(server);
        self
    }

    /// Add a device-ID wildcard
    #[must_use]
    pub fn with_device_id_wildcard(mut self, wildcard: impl Into<String>) -> Self {
        self.device_id_wildcards.push(wildcard.into());
        self
    }

    /// Validate the group
    ///
    /// # Errors
    ///
    /// Returns `DnsError::ConfigError` for an empty group, a bad wildcard,
    /// or an invalid member.
    pub fn validate(&self) -> DnsResult<()> {
        if self.name.is_empty() {
            return Err(DnsError::config_field("no name", "server_group.name"));
        }

        if self.servers.is_empty() {
            return Err(DnsError::config_field(
                format!("group {}: no servers", self.name),
                "server_group.servers",
            ));
        }

        for wildcard in &self.device_id_wildcards {
            if !wildcard.starts_with("*.") || wildcard.len() <= 2 {
                return Err(DnsError::config_field(
                    format!("bad wildcard {wildcard:?}, want \"*.<domain>\""),
                    "server_group.device_id_wildcards",
                ));
            }
        }

        self.upstream.validate()?;

        for server in &self.servers {
            server.validate()?;
        }

        Ok(())
    }
}

/// Sizes of the two response caches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries to hold for hosts that do not support ECS
    #[serde(default = "default_cache_size")]
    pub size: u64,

    /// Entries to hold for hosts that support ECS
    #[serde(default = "default_ecs_cache_size")]
    pub ecs_size: u64,
}

fn default_cache_size() -> u64 {
    DEFAULT_CACHE_SIZE
}

fn default_ecs_cache_size() -> u64 {
    DEFAULT_ECS_CACHE_SIZE
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_CACHE_SIZE,
            ecs_size: DEFAULT_ECS_CACHE_SIZE,
        }
    }
}

impl CacheConfig {
    /// Validate the cache configuration
    ///
    /// # Errors
    ///
    /// Returns `DnsError::ConfigError` when either size is zero.
    pub fn validate(&self) -> DnsResult<()> {
        if self.size == 0 {
            return Err(DnsError::config_field("must be positive", "cache.size"));
        }

        if self.ecs_size == 0 {
            return Err(DnsError::config_field("must be positive", "cache.ecs_size"));
        }

        Ok(())
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server groups
    #[serde(default)]
    pub server_groups: Vec<ServerGroupConfig>,

    /// Cache sizes
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    /// Create an empty configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server group
    #[must_use]
    pub fn with_group(mut self, group: ServerGroupConfig) -> Self {
        self.server_groups.push(group);
        self
    }

    /// Validate the whole configuration tree
    ///
    /// # Errors
    ///
    /// Returns the first `DnsError::ConfigError` found.
    pub fn validate(&self) -> DnsResult<()> {
        if self.server_groups.is_empty() {
            return Err(DnsError::config("no server groups"));
        }

        self.cache.validate()?;

        for group in &self.server_groups {
            group.validate()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_upstream() -> UpstreamConfig {
        UpstreamConfig::new("8.8.8.8:53".parse().unwrap())
            .with_fallback("8.8.4.4:53".parse().unwrap())
    }

    fn valid_group() -> ServerGroupConfig {
        ServerGroupConfig::new("default", valid_upstream()).with_server(ServerConfig::new(
            "udp-main",
            Protocol::Udp,
            vec!["127.0.0.1:0".parse().unwrap()],
        ))
    }

    // ========================================================================
    // Protocol Tests
    // ========================================================================

    #[test]
    fn test_protocol_serde_names() {
        let json = serde_json::to_string(&Protocol::DnscryptTcp).unwrap();
        assert_eq!(json, "\"dnscrypt-tcp\"");

        let proto: Protocol = serde_json::from_str("\"https\"").unwrap();
        assert_eq!(proto, Protocol::Https);
    }

    #[test]
    fn test_protocol_requires_tls() {
        assert!(Protocol::Tls.requires_tls());
        assert!(Protocol::Https.requires_tls());
        assert!(Protocol::Quic.requires_tls());
        assert!(!Protocol::Udp.requires_tls());
        assert!(!Protocol::DnscryptTcp.requires_tls());
    }

    // ========================================================================
    // Upstream Validation Tests
    // ========================================================================

    #[test]
    fn test_upstream_valid() {
        assert!(valid_upstream().validate().is_ok());
    }

    #[test]
    fn test_upstream_requires_fallback() {
        let upstream = UpstreamConfig::new("8.8.8.8:53".parse().unwrap());
        assert!(upstream.validate().is_err());
    }

    #[test]
    fn test_upstream_requires_positive_timeout() {
        let mut upstream = valid_upstream();
        upstream.timeout_ms = 0;
        assert!(upstream.validate().is_err());
    }

    // ========================================================================
    // Healthcheck Validation Tests
    // ========================================================================

    #[test]
    fn test_healthcheck_disabled_is_valid() {
        let hc = HealthcheckConfig::default();
        assert!(!hc.enabled);
        assert!(hc.validate().is_ok());
    }

    #[test]
    fn test_healthcheck_enabled_requires_template() {
        let hc = HealthcheckConfig {
            enabled: true,
            ..HealthcheckConfig::default()
        };
        assert!(hc.validate().is_err());
    }

    #[test]
    fn test_healthcheck_enabled_requires_positive_durations() {
        let mut hc = HealthcheckConfig {
            enabled: true,
            domain_template: "${RANDOM}-probe.example.com".into(),
            ..HealthcheckConfig::default()
        };
        assert!(hc.validate().is_ok());

        hc.backoff_duration_ms = 0;
        assert!(hc.validate().is_err());
    }

    // ========================================================================
    // Server and Group Validation Tests
    // ========================================================================

    #[test]
    fn test_server_requires_bind_address() {
        let server = ServerConfig::new("s", Protocol::Udp, vec![]);
        assert!(server.validate().is_err());
    }

    #[test]
    fn test_tls_server_requires_material() {
        let server = ServerConfig::new("dot", Protocol::Tls, vec!["127.0.0.1:853".parse().unwrap()]);
        assert!(server.validate().is_err());

        let server = server.with_tls(TlsFilesConfig {
            certificate_path: "/tmp/cert.pem".into(),
            key_path: "/tmp/key.pem".into(),
            alpn: vec![],
        });
        assert!(server.validate().is_ok());
    }

    #[test]
    fn test_group_wildcard_validation() {
        let group = valid_group().with_device_id_wildcard("*.d.example.com");
        assert!(group.validate().is_ok());

        let group = valid_group().with_device_id_wildcard("d.example.com");
        assert!(group.validate().is_err());

        let group = valid_group().with_device_id_wildcard("*.");
        assert!(group.validate().is_err());
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::new().with_group(valid_group());
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.server_groups.len(), 1);
        assert_eq!(parsed.server_groups[0].servers[0].name, "udp-main");
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_config_requires_groups() {
        assert!(Config::new().validate().is_err());
    }

    #[test]
    fn test_cache_config_positive_sizes() {
        let cache = CacheConfig { size: 0, ecs_size: 1 };
        assert!(cache.validate().is_err());

        assert!(CacheConfig::default().validate().is_ok());
    }
}
