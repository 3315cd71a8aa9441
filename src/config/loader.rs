//! Configuration loading
//!
//! Configuration is stored as JSON on disk and validated right after
//! parsing, so the rest of the service never sees an invalid tree.

use std::path::Path;

use tracing::{debug, info};

use super::Config;
use crate::error::{DnsError, DnsResult};

/// Load and validate configuration from a JSON file
///
/// # Errors
///
/// Returns `DnsError::ConfigError` if the file is missing, unreadable,
/// not valid JSON, or fails validation.
pub fn load_config(path: impl AsRef<Path>) -> DnsResult<Config> {
    let path = path.as_ref();

    debug!(path = %path.display(), "loading configuration");

    if !path.exists() {
        return Err(DnsError::config(format!(
            "configuration file not found: {}",
            path.display()
        )));
    }

    let contents = std::fs::read_to_string(path).map_err(|e| {
        DnsError::config(format!("reading {}: {e}", path.display()))
    })?;

    let config = load_config_str(&contents)?;

    info!(
        groups = config.server_groups.len(),
        servers = config
            .server_groups
            .iter()
            .map(|g| g.servers.len())
            .sum::<usize>(),
        "configuration loaded"
    );

    Ok(config)
}

/// Load and validate configuration from a JSON string
///
/// # Errors
///
/// Returns `DnsError::ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> DnsResult<Config> {
    let config: Config = serde_json::from_str(json)
        .map_err(|e| DnsError::config(format!("parsing configuration: {e}")))?;

    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "server_groups": [
            {
                "name": "default",
                "upstream": {
                    "server": "8.8.8.8:53",
                    "fallback": ["8.8.4.4:53", "1.1.1.1:53"],
                    "timeout_ms": 2000,
                    "healthcheck": {
                        "enabled": true,
                        "domain_template": "${RANDOM}-probe.example.com",
                        "interval_ms": 2000,
                        "timeout_ms": 1000,
                        "backoff_duration_ms": 30000
                    }
                },
                "servers": [
                    {
                        "name": "udp-main",
                        "protocol": "udp",
                        "bind_addresses": ["127.0.0.1:5300"]
                    },
                    {
                        "name": "tcp-main",
                        "protocol": "tcp",
                        "bind_addresses": ["127.0.0.1:5300"]
                    }
                ],
                "device_id_wildcards": ["*.d.example.com"]
            }
        ],
        "cache": { "size": 1000, "ecs_size": 500 }
    }"#;

    #[test]
    fn test_load_sample() {
        let config = load_config_str(SAMPLE).unwrap();

        assert_eq!(config.server_groups.len(), 1);
        let group = &config.server_groups[0];
        assert_eq!(group.upstream.fallback.len(), 2);
        assert!(group.upstream.healthcheck.as_ref().unwrap().enabled);
        assert_eq!(group.servers.len(), 2);
        assert_eq!(config.cache.ecs_size, 500);
    }

    #[test]
    fn test_load_invalid_json() {
        let err = load_config_str("{not json").unwrap_err();
        assert!(matches!(err, DnsError::ConfigError { .. }));
    }

    #[test]
    fn test_load_fails_validation() {
        // Parses fine but has no fallback.
        let json = r#"{
            "server_groups": [{
                "name": "g",
                "upstream": { "server": "8.8.8.8:53" },
                "servers": [{
                    "name": "s",
                    "protocol": "udp",
                    "bind_addresses": ["127.0.0.1:0"]
                }]
            }]
        }"#;

        let err = load_config_str(json).unwrap_err();
        assert!(err.to_string().contains("no fallback"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_config(Path::new("/nonexistent/dnsgate.json")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
