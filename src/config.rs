//! Configuration loading and validation.
//!
//! The configuration is a read-only snapshot: the tunnel engine never
//! mutates it, it only reads it each time the interface is (re)configured.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ConfigError, Result, ValidationError};

/// Main configuration for the dnsveil tunnel.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Custom upstream DNS servers, used before the ones discovered on the network.
    #[serde(default)]
    pub dns_servers: Vec<DnsServerEntry>,

    /// Alias IPv6 upstream servers inside the tunnel.
    #[serde(default = "default_true")]
    pub ipv6_support: bool,

    /// Ping the tunnel periodically and reconnect when it stops answering.
    #[serde(default)]
    pub watchdog: bool,

    /// Record every allowed/blocked query in the block log.
    #[serde(default = "default_true")]
    pub block_logging: bool,

    /// Where the block log is persisted between runs.
    #[serde(default = "default_block_log_path")]
    pub block_log_path: PathBuf,

    /// Inline blocking rules.
    /// Supports exact matches ("example.com") and wildcards ("*.example.com").
    #[serde(default)]
    pub blocklist: Vec<String>,

    /// Per-application routing policy.
    #[serde(default)]
    pub apps: AppSettings,

    /// Virtual interface settings.
    #[serde(default)]
    pub tunnel: TunnelSettings,

    /// Prometheus exporter settings.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// A user-configured upstream DNS server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsServerEntry {
    pub address: IpAddr,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Which side of the tunnel applications land on unless listed otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppMode {
    /// Everything goes through the tunnel; `not_on_vpn` apps are excluded.
    #[default]
    OnVpn,
    /// Nothing goes through the tunnel; `on_vpn` apps are explicitly included.
    NotOnVpn,
}

/// Per-application routing policy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppSettings {
    #[serde(default)]
    pub default_mode: AppMode,

    #[serde(default)]
    pub on_vpn: Vec<String>,

    #[serde(default)]
    pub not_on_vpn: Vec<String>,
}

/// Virtual interface settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelSettings {
    /// Interface name requested from the platform.
    #[serde(default = "default_tunnel_name")]
    pub name: String,

    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            name: default_tunnel_name(),
            mtu: default_mtu(),
        }
    }
}

/// Metrics exporter configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

const fn default_true() -> bool {
    true
}

fn default_block_log_path() -> PathBuf {
    PathBuf::from("block-log.toml")
}

fn default_tunnel_name() -> String {
    "dnsveil0".to_string()
}

const fn default_mtu() -> u16 {
    1500
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate().map_err(ConfigError::from)?;
        Ok(config)
    }

    /// Enabled custom DNS servers, in configuration order.
    pub fn enabled_dns_servers(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.dns_servers
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| entry.address)
    }

    fn validate(&self) -> std::result::Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for entry in &self.dns_servers {
            let address = entry.address;
            if address.is_unspecified() || address.is_multicast() {
                return Err(ValidationError::UnusableDnsServer { address });
            }
            if !seen.insert(address) {
                return Err(ValidationError::DuplicateDnsServer { address });
            }
        }

        for pattern in &self.blocklist {
            if pattern.is_empty() {
                return Err(ValidationError::EmptyBlocklistPattern);
            }
            let wildcard_ok = match pattern.strip_prefix("*.") {
                Some(suffix) => !suffix.is_empty() && !suffix.contains('*'),
                None => !pattern.contains('*'),
            };
            if !wildcard_ok {
                return Err(ValidationError::InvalidWildcardPattern {
                    pattern: pattern.clone(),
                });
            }
        }

        if self.tunnel.mtu < 576 {
            return Err(ValidationError::MtuTooSmall {
                mtu: self.tunnel.mtu,
            });
        }

        // IFNAMSIZ - 1
        if self.tunnel.name.is_empty() || self.tunnel.name.len() > 15 {
            return Err(ValidationError::InvalidInterfaceName {
                name: self.tunnel.name.clone(),
            });
        }

        let on_vpn: HashSet<&str> = self.apps.on_vpn.iter().map(String::as_str).collect();
        if let Some(app) = self
            .apps
            .not_on_vpn
            .iter()
            .find(|app| on_vpn.contains(app.as_str()))
        {
            return Err(ValidationError::ConflictingApplication { app: app.clone() });
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dns_servers: Vec::new(),
            ipv6_support: true,
            watchdog: false,
            block_logging: true,
            block_log_path: default_block_log_path(),
            blocklist: Vec::new(),
            apps: AppSettings::default(),
            tunnel: TunnelSettings::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn should_parse_valid_config() {
        let toml = r#"
            dns_servers = [
                { address = "1.1.1.1" },
                { address = "2606:4700:4700::1111", enabled = false },
            ]
            watchdog = true
            blocklist = ["example.com", "*.ads.com"]
        "#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.dns_servers.len(), 2);
        assert!(config.watchdog);
        assert_eq!(config.blocklist.len(), 2);
        assert_eq!(
            config.enabled_dns_servers().collect::<Vec<_>>(),
            vec![IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))]
        );
    }

    #[test]
    fn should_apply_default_values() {
        let config = Config::parse("").unwrap();
        assert!(config.dns_servers.is_empty());
        assert!(config.ipv6_support);
        assert!(!config.watchdog);
        assert!(config.block_logging);
        assert_eq!(config.block_log_path, PathBuf::from("block-log.toml"));
        assert_eq!(config.tunnel, TunnelSettings::default());
        assert_eq!(config.apps.default_mode, AppMode::OnVpn);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn should_parse_app_settings() {
        let toml = r#"
            [apps]
            default_mode = "not_on_vpn"
            on_vpn = ["org.example.browser"]
        "#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.apps.default_mode, AppMode::NotOnVpn);
        assert_eq!(config.apps.on_vpn, vec!["org.example.browser".to_string()]);
        assert!(config.apps.not_on_vpn.is_empty());
    }

    #[test]
    fn should_reject_invalid_dns_address() {
        let toml = r#"
            dns_servers = [{ address = "not-an-address" }]
        "#;

        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn should_reject_duplicate_dns_servers() {
        let toml = r#"
            dns_servers = [{ address = "::1" }, { address = "::1" }]
        "#;

        let err = Config::parse(toml).unwrap_err();
        assert!(err.to_string().contains(&Ipv6Addr::LOCALHOST.to_string()));
    }

    #[test]
    fn should_reject_unspecified_dns_server() {
        let toml = r#"
            dns_servers = [{ address = "0.0.0.0" }]
        "#;

        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn should_reject_empty_blocklist_pattern() {
        let toml = r#"
            blocklist = ["example.com", ""]
        "#;

        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn should_reject_bare_wildcard() {
        let toml = r#"
            blocklist = ["*."]
        "#;

        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn should_reject_wildcard_without_dot() {
        for pattern in ["*ads.com", "ads.*.com", "*.ads.*", "*"] {
            let config = Config {
                blocklist: vec![pattern.to_string()],
                ..Config::default()
            };

            assert!(
                matches!(
                    config.validate(),
                    Err(ValidationError::InvalidWildcardPattern { .. })
                ),
                "{pattern} accepted"
            );
        }
        assert!(Config::parse(r#"blocklist = ["*.ads.com", "ads.com"]"#).is_ok());
    }

    #[test]
    fn should_reject_small_mtu() {
        let toml = r#"
            [tunnel]
            mtu = 100
        "#;

        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn should_reject_long_interface_name() {
        let toml = r#"
            [tunnel]
            name = "a-very-long-interface-name"
        "#;

        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn should_reject_app_on_both_sides() {
        let toml = r#"
            [apps]
            on_vpn = ["org.example.app"]
            not_on_vpn = ["org.example.app"]
        "#;

        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn should_reject_unknown_field() {
        let toml = r#"
            unknown_field = "value"
        "#;

        assert!(Config::parse(toml).is_err());
    }
}
