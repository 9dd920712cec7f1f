//! Coordinator configuration, loaded from TOML.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt};

use crate::descriptor::{Network, ScriptType};
use crate::device::Hwi;
use crate::node::{Node, RpcConnector};
use crate::store::{FileStore, StoreError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to parse config {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rpc: RpcConfig,
    pub wallet: WalletConfig,
    pub hwi: HwiConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub host: String,
    /// Defaults to the network's standard RPC port.
    pub port: Option<u16>,
    pub user: String,
    pub password: Option<String>,
    /// Cookie auth wins over user/password when set.
    pub cookie_file: Option<PathBuf>,
    pub timeout_secs: u64,
    pub retries: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: None,
            user: String::new(),
            password: None,
            cookie_file: None,
            timeout_secs: 30,
            retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub datadir: PathBuf,
    pub network: Network,
    pub script_type: ScriptType,
    /// Addresses per chain exported to the node once a wallet reaches quorum.
    pub address_window: u32,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            datadir: default_datadir(),
            network: Network::Testnet,
            script_type: ScriptType::Native,
            address_window: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HwiConfig {
    pub path: PathBuf,
}

impl Default for HwiConfig {
    fn default() -> Self {
        Self { path: "hwi".into() }
    }
}

pub fn default_datadir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".multisig-coordinator")
}

impl Config {
    pub fn default_path() -> PathBuf {
        default_datadir().join("config.toml")
    }

    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Config::default()
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        fs::write(path, toml::to_string_pretty(self)?).map_err(io_err)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc.host.trim().is_empty() {
            return Err(ConfigError::Invalid("rpc.host must not be empty".into()));
        }
        if self.rpc.port == Some(0) {
            return Err(ConfigError::Invalid("rpc.port must not be 0".into()));
        }
        if self.rpc.timeout_secs == 0 {
            return Err(ConfigError::Invalid("rpc.timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn rpc_port(&self) -> u16 {
        self.rpc.port.unwrap_or(match self.wallet.network {
            Network::Mainnet => 8332,
            Network::Testnet => 18332,
            Network::Regtest => 18443,
        })
    }

    /// Connection descriptor for a new wallet's node-side watch-only wallet.
    pub fn node(&self, wallet_name: &str) -> Node {
        Node {
            host: self.rpc.host.clone(),
            port: self.rpc_port(),
            user: self.rpc.user.clone(),
            password: self.rpc.password.clone(),
            cookie_file: self.rpc.cookie_file.clone(),
            wallet_name: wallet_name.to_string(),
            network: self.wallet.network,
        }
    }

    pub fn connector(&self) -> RpcConnector {
        RpcConnector {
            timeout: Duration::from_secs(self.rpc.timeout_secs),
            retries: self.rpc.retries,
        }
    }

    pub fn store(&self) -> Result<FileStore, StoreError> {
        FileStore::open(&self.wallet.datadir)
    }

    pub fn hwi(&self) -> Hwi {
        Hwi::new(&self.hwi.path, self.wallet.network)
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the default level.
pub fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_means_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.rpc.timeout_secs, 30);
        assert_eq!(config.rpc.retries, 3);
        assert_eq!(config.wallet.address_window, 20);
        assert_eq!(config.wallet.network, Network::Testnet);
        assert_eq!(config.rpc_port(), 18332);
        assert!(config.wallet.datadir.ends_with(".multisig-coordinator"));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[rpc]
user = "bitcoin"
password = "python"
retries = 1

[wallet]
network = "regtest"
script_type = "wrapped"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.rpc.retries, 1);
        assert_eq!(config.rpc.timeout_secs, 30);
        assert_eq!(config.wallet.script_type, ScriptType::Wrapped);
        assert_eq!(config.hwi.path, PathBuf::from("hwi"));

        let node = config.node("w");
        assert_eq!(node.port, 18443);
        assert_eq!(node.wallet_name, "w");
        assert_eq!(node.network, Network::Regtest);
        assert_eq!(node.password.as_deref(), Some("python"));
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = Config::default();
        config.rpc.cookie_file = Some(dir.path().join(".cookie"));
        config.rpc.port = Some(38332);
        config.wallet.datadir = dir.path().to_path_buf();
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn rejects_bad_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        fs::write(&path, "[rpc]\nuser = \"u\"\ntimeout_secs = 0\n").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Invalid(_))));

        fs::write(&path, "[wallet]\nnetwork = \"signet\"\n").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    }
}
