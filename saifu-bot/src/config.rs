//! Bot configuration management.
//!
//! Configuration lives at `~/.saifu/config.json`. Every field has a
//! default, so a missing or partial file still yields a runnable config;
//! [`BotConfig::validate`] reports what a given file would actually do.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bitcoin::Network;
use serde::{Deserialize, Serialize};
use tracing::debug;

use saifu::keys::DerivationParams;
use saifu::node::RetryPolicy;

use crate::error::{ConfigError, ConfigResult};
use crate::util::{config_dir, default_data_dir};

/// Top-level bot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Bitcoin node connection.
    pub node: NodeConfig,
    /// Wallet engine parameters.
    pub wallet: WalletConfig,
    /// Service-level settings.
    pub service: ServiceConfig,
    /// Which platforms to bring up.
    pub platforms: PlatformsConfig,
}

/// Bitcoin node connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Base URL of the node's HTTP interface.
    pub url: String,
    /// Per-request deadline in seconds.
    pub timeout_secs: u64,
    /// Read attempts before giving up, including the first.
    pub read_attempts: u32,
    /// Delay before the first read retry, in milliseconds.
    pub backoff_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8332".to_string(),
            timeout_secs: 10,
            read_attempts: 3,
            backoff_ms: 500,
        }
    }
}

/// Wallet engine parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Network name: `bitcoin`, `testnet`, `signet` or `regtest`.
    pub network: String,
    /// BIP-44 purpose field.
    pub purpose: u32,
    /// BIP-44 coin type field.
    pub coin_type: u32,
    /// Fee rate in satoshis per estimated byte.
    pub fee_rate_sats_per_byte: u64,
    /// Smallest amount a user may transfer.
    pub min_output_sats: u64,
    /// Change below this folds into the fee.
    pub dust_limit_sats: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            network: "bitcoin".to_string(),
            purpose: 44,
            coin_type: 0,
            fee_rate_sats_per_byte: 2,
            min_output_sats: 1000,
            dust_limit_sats: 546,
        }
    }
}

/// Service-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// User id whose outputs are treated as service funds, never as
    /// customer deposits.
    pub bot_user: String,
    /// Directory for persisted records; defaults to `~/.saifu/data`.
    pub data_dir: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { bot_user: "cli:saifu".to_string(), data_dir: None }
    }
}

/// Per-platform enable flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformsConfig {
    /// Local terminal session.
    pub cli: PlatformToggle,
    /// Telegram bot.
    pub telegram: PlatformToggle,
    /// Discord bot.
    pub discord: PlatformToggle,
    /// Twitter/X mentions.
    pub twitter: PlatformToggle,
}

impl Default for PlatformsConfig {
    fn default() -> Self {
        Self {
            cli: PlatformToggle { enabled: true },
            telegram: PlatformToggle::default(),
            discord: PlatformToggle::default(),
            twitter: PlatformToggle::default(),
        }
    }
}

/// Enable flag for one platform.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformToggle {
    /// Whether the platform should be brought up.
    pub enabled: bool,
}

/// Severity of a configuration finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueLevel {
    /// Works, but probably not what was intended.
    Warning,
    /// The service will refuse to start.
    Error,
}

/// One finding from [`BotConfig::validate`].
#[derive(Debug, Clone, Serialize)]
pub struct ConfigIssue {
    /// Severity.
    pub level: IssueLevel,
    /// Dotted path of the offending field.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl ConfigIssue {
    fn error(field: &str, message: impl Into<String>) -> Self {
        Self { level: IssueLevel::Error, field: field.to_string(), message: message.into() }
    }

    fn warning(field: &str, message: impl Into<String>) -> Self {
        Self { level: IssueLevel::Warning, field: field.to_string(), message: message.into() }
    }
}

impl BotConfig {
    /// The configured network.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the network name is unknown.
    pub fn network(&self) -> ConfigResult<Network> {
        self.wallet
            .network
            .parse()
            .map_err(|_| ConfigError::invalid(format!("unknown network: {}", self.wallet.network)))
    }

    /// Key derivation parameters for the wallet engine.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the network name is unknown.
    pub fn derivation_params(&self) -> ConfigResult<DerivationParams> {
        Ok(DerivationParams {
            network: self.network()?,
            purpose: self.wallet.purpose,
            coin_type: self.wallet.coin_type,
        })
    }

    /// Node read retry policy.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.node.read_attempts,
            timeout: Duration::from_secs(self.node.timeout_secs),
            backoff: Duration::from_millis(self.node.backoff_ms),
        }
    }

    /// Directory for persisted records.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.service.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    /// Checks the configuration and reports findings.
    #[must_use]
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.network().is_err() {
            issues.push(ConfigIssue::error(
                "wallet.network",
                format!("unknown network: {}", self.wallet.network),
            ));
        }
        if !self.node.url.starts_with("http://") && !self.node.url.starts_with("https://") {
            issues.push(ConfigIssue::error("node.url", "must start with http:// or https://"));
        }
        if !self.service.bot_user.contains(':') {
            issues.push(ConfigIssue::error(
                "service.bot_user",
                "must be a platform-scoped id like cli:saifu",
            ));
        }
        if self.wallet.min_output_sats <= self.wallet.dust_limit_sats {
            issues.push(ConfigIssue::error(
                "wallet.min_output_sats",
                "must exceed the dust limit or every transfer is rejected",
            ));
        }
        if self.wallet.fee_rate_sats_per_byte == 0 {
            issues.push(ConfigIssue::warning(
                "wallet.fee_rate_sats_per_byte",
                "zero-fee transactions are unlikely to relay",
            ));
        }
        if self.node.read_attempts == 0 {
            issues.push(ConfigIssue::warning("node.read_attempts", "reads will never be tried"));
        }
        for (name, toggle) in [
            ("telegram", &self.platforms.telegram),
            ("discord", &self.platforms.discord),
            ("twitter", &self.platforms.twitter),
        ] {
            if toggle.enabled {
                issues.push(ConfigIssue::warning(
                    &format!("platforms.{name}"),
                    "enabled but no adapter is built in yet",
                ));
            }
        }

        issues
    }

    /// Whether the config is free of error-level findings.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.validate().iter().any(|issue| issue.level == IssueLevel::Error)
    }
}

/// Path of the config file (`~/.saifu/config.json`).
#[must_use]
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Loads the config from the default path.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] if the file is unreadable and
/// [`ConfigError::Parse`] if it is not valid JSON.
pub async fn load_config() -> ConfigResult<BotConfig> {
    load_config_from(&config_path()).await
}

/// Loads the config from an explicit path.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] if the file is unreadable and
/// [`ConfigError::Parse`] if it is not valid JSON.
pub async fn load_config_from(path: &Path) -> ConfigResult<BotConfig> {
    let raw = tokio::fs::read_to_string(path).await?;
    let config = serde_json::from_str(&raw)?;
    debug!(path = %path.display(), "config loaded");
    Ok(config)
}

/// Writes the config to the default path, creating `~/.saifu` if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] if the directory or file cannot be written.
pub async fn save_config(config: &BotConfig) -> ConfigResult<()> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(config)?;
    tokio::fs::write(&path, raw).await?;
    debug!(path = %path.display(), "config saved");
    Ok(())
}

/// Writes a default config to the default path.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] if the directory or file cannot be written.
pub async fn init_config() -> ConfigResult<()> {
    save_config(&BotConfig::default()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BotConfig::default();
        assert!(config.is_valid());
        assert_eq!(config.network().unwrap(), Network::Bitcoin);
        assert_eq!(config.retry_policy().attempts, 3);
        assert!(config.platforms.cli.enabled);
        assert!(!config.platforms.telegram.enabled);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: BotConfig =
            serde_json::from_str(r#"{"wallet":{"network":"regtest"}}"#).unwrap();
        assert_eq!(config.network().unwrap(), Network::Regtest);
        // Untouched sections keep their defaults.
        assert_eq!(config.node.url, "http://127.0.0.1:8332");
        assert_eq!(config.wallet.purpose, 44);
    }

    #[test]
    fn test_validation_catches_bad_settings() {
        let mut config = BotConfig::default();
        config.wallet.network = "moonnet".to_string();
        config.node.url = "127.0.0.1:8332".to_string();
        config.service.bot_user = "saifu".to_string();
        config.wallet.min_output_sats = 100;

        let issues = config.validate();
        assert!(!config.is_valid());
        let fields: Vec<&str> = issues.iter().map(|issue| issue.field.as_str()).collect();
        assert!(fields.contains(&"wallet.network"));
        assert!(fields.contains(&"node.url"));
        assert!(fields.contains(&"service.bot_user"));
        assert!(fields.contains(&"wallet.min_output_sats"));
    }

    #[test]
    fn test_enabled_stub_platform_warns() {
        let mut config = BotConfig::default();
        config.platforms.telegram.enabled = true;
        let issues = config.validate();
        assert!(config.is_valid());
        assert!(issues
            .iter()
            .any(|issue| issue.field == "platforms.telegram"
                && issue.level == IssueLevel::Warning));
    }

    #[test]
    fn test_derivation_params_follow_config() {
        let mut config = BotConfig::default();
        config.wallet.network = "testnet".to_string();
        config.wallet.coin_type = 1;
        let params = config.derivation_params().unwrap();
        assert_eq!(params.network, Network::Testnet);
        assert_eq!(params.purpose, 44);
        assert_eq!(params.coin_type, 1);
    }
}
