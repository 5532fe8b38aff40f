//! Node configuration file.
//!
//! Read from `$CERTDHT_HOME/config.toml` (default `~/.certdht/config.toml`).
//! Every section is optional; a missing file yields the defaults.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::{bail, Context};
use certdht_dht::adversary::HandlerStrategy;
use certdht_dht::bootstrap::SeedNode;
use certdht_dht::DhtConfig;
use certdht_types::NodeId;
use serde::{Deserialize, Serialize};

/// Complete node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub bootstrap: BootstrapSection,
    #[serde(default)]
    pub dht: DhtConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub adversary: AdversaryConfig,
}

/// Identity and listen address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Name of the node's directory under `runtimes_dir`.
    #[serde(default = "default_name")]
    pub name: String,
    /// Bind address.
    #[serde(default = "default_iface")]
    pub iface: IpAddr,
    /// 0 = OS-assigned ephemeral port.
    #[serde(default)]
    pub port: u16,
    /// Overrides `dht.network` when set.
    #[serde(default)]
    pub network: Option<String>,
}

/// Key material locations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Parent of the per-node `mine/`, `private/` and `others/` directories.
    /// Empty = `$CERTDHT_HOME/runtimes`.
    #[serde(default)]
    pub runtimes_dir: String,
    /// Trusted CA certificate bundle (PEM). Empty = `$CERTDHT_HOME/ca.pem`.
    #[serde(default)]
    pub ca_certificate: String,
}

/// Seeds to join through. Only the first is contacted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapSection {
    #[serde(default)]
    pub seeds: Vec<SeedNode>,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Fault-injection mode for test deployments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdversaryConfig {
    /// "honest" (or empty), "poison", "insert", "sybil" or "eclipse".
    #[serde(default)]
    pub strategy: String,
    /// Hex id of the eclipse victim.
    #[serde(default)]
    pub victim: Option<String>,
}

fn default_name() -> String {
    "node".to_string()
}

fn default_iface() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            iface: default_iface(),
            port: 0,
            network: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl AdversaryConfig {
    pub fn strategy(&self) -> anyhow::Result<HandlerStrategy> {
        let strategy = match self.strategy.as_str() {
            "" | "honest" => HandlerStrategy::Honest,
            "poison" => HandlerStrategy::Poison,
            "insert" => HandlerStrategy::Insert,
            "sybil" => HandlerStrategy::Sybil,
            "eclipse" => {
                let victim = self
                    .victim
                    .as_deref()
                    .context("eclipse strategy needs a victim id")?;
                HandlerStrategy::Eclipse {
                    victim: NodeId::from_hex(victim)?,
                }
            }
            other => bail!("unknown adversary strategy {other:?}"),
        };
        Ok(strategy)
    }
}

impl NodeConfig {
    /// Load configuration from the default config file location.
    ///
    /// Falls back to defaults if file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::home_dir().join("config.toml");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("reading {}", config_path.display()))?;
            Self::parse(&content)
        } else {
            Ok(Self::default())
        }
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut config: NodeConfig = toml::from_str(content)?;
        if let Some(network) = config.node.network.take() {
            config.dht.network = network;
        }
        config.dht.validate()?;
        config.adversary.strategy()?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.node.iface, self.node.port)
    }

    pub fn runtimes_dir(&self) -> PathBuf {
        if self.security.runtimes_dir.is_empty() {
            Self::home_dir().join("runtimes")
        } else {
            PathBuf::from(&self.security.runtimes_dir)
        }
    }

    pub fn ca_certificate(&self) -> PathBuf {
        if self.security.ca_certificate.is_empty() {
            Self::home_dir().join("ca.pem")
        } else {
            PathBuf::from(&self.security.ca_certificate)
        }
    }

    /// `$CERTDHT_HOME`, else `~/.certdht`.
    fn home_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("CERTDHT_HOME") {
            return PathBuf::from(dir);
        }
        std::env::var("HOME")
            .map(|h| PathBuf::from(h).join(".certdht"))
            .unwrap_or_else(|_| PathBuf::from("/tmp/certdht"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.node.name, "node");
        assert_eq!(config.node.port, 0);
        assert_eq!(config.dht.ksize, 20);
        assert_eq!(config.log.level, "info");
        assert!(config.bootstrap.seeds.is_empty());
        assert_eq!(
            config.adversary.strategy().expect("strategy"),
            HandlerStrategy::Honest
        );
    }

    #[test]
    fn test_config_serialization() {
        let config = NodeConfig::default();
        let toml_str = toml::to_string(&config).expect("serialize");
        let _parsed: NodeConfig = toml::from_str(&toml_str).expect("parse");
    }

    #[test]
    fn test_parse_full_config() {
        let config = NodeConfig::parse(
            r#"
            [node]
            name = "runtime1"
            iface = "127.0.0.1"
            port = 5001
            network = "lab"

            [security]
            runtimes_dir = "/srv/certdht/runtimes"
            ca_certificate = "/srv/certdht/ca.pem"

            [[bootstrap.seeds]]
            addr = "127.0.0.1:5000"
            certificate = "-----BEGIN CERTIFICATE-----"

            [dht]
            ksize = 8
            transfer_batch_limit = 0

            [log]
            level = "debug"
            "#,
        )
        .expect("parse");

        assert_eq!(config.listen_addr(), "127.0.0.1:5001".parse().expect("addr"));
        assert_eq!(config.dht.network, "lab");
        assert_eq!(config.dht.ksize, 8);
        assert_eq!(config.dht.transfer_limit(), None);
        assert_eq!(config.bootstrap.seeds.len(), 1);
        assert_eq!(config.runtimes_dir(), PathBuf::from("/srv/certdht/runtimes"));
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_adversary_strategies() {
        let eclipse = AdversaryConfig {
            strategy: "eclipse".into(),
            victim: Some("AB".repeat(20)),
        };
        assert!(matches!(
            eclipse.strategy().expect("eclipse"),
            HandlerStrategy::Eclipse { .. }
        ));

        let missing_victim = AdversaryConfig {
            strategy: "eclipse".into(),
            victim: None,
        };
        assert!(missing_victim.strategy().is_err());

        let unknown = AdversaryConfig {
            strategy: "chaos".into(),
            victim: None,
        };
        assert!(unknown.strategy().is_err());
        assert!(NodeConfig::parse("[adversary]\nstrategy = \"chaos\"").is_err());
    }

    #[test]
    fn test_invalid_dht_section_rejected() {
        assert!(NodeConfig::parse("[dht]\nksize = 0").is_err());
    }
}
