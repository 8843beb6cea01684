//! Service configuration.
//!
//! Config is stored at `~/.config/tpm/config.toml`. Every field has a
//! default, so an empty or missing file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

const CONFIG_DIR: &str = "tpm";
const CONFIG_FILE: &str = "config.toml";
const DATABASE_FILE: &str = "pool.db";

/// Tenant pool service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// SQLite database shared by all replicas.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Delay between reconciler scans of one registration.
    #[serde(default = "default_scan_delay_secs")]
    pub scan_delay_secs: u64,

    /// Upper bound on one registration scan.
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,

    /// Reservation window when the registration does not set one.
    #[serde(default = "default_reserve_expiry_secs")]
    pub reserve_expiry_secs: u64,

    #[serde(default = "default_edge_provision_timeout_secs")]
    pub edge_provision_timeout_secs: u64,

    #[serde(default = "default_edge_deletion_timeout_secs")]
    pub edge_deletion_timeout_secs: u64,

    /// Bound on each provisioning or identity call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    #[serde(default = "default_true")]
    pub enable_scanner: bool,

    /// Single replica: keep scan locks in memory instead of the database.
    #[serde(default)]
    pub disable_scale_out: bool,

    /// Namespace tag attached to every provisioned edge.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_app_chart_version")]
    pub app_chart_version: String,

    #[serde(default = "default_provisioner_url")]
    pub provisioner_url: String,

    #[serde(default)]
    pub provisioner_token: Option<String>,

    #[serde(default = "default_account_url")]
    pub account_url: String,

    #[serde(default = "default_audit_timeout_secs")]
    pub audit_timeout_secs: u64,

    #[serde(default)]
    pub pool_stats: PoolStatsConfig,
}

/// Tuning for dynamic pool sizing from recent reservation demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Weight of the newest sample in the moving average.
    #[serde(default = "default_stats_weight")]
    pub weight: f64,

    /// Multiplier from average demand per sample to pool level.
    #[serde(default = "default_stats_time_factor")]
    pub time_factor: f64,

    /// Scans between samples.
    #[serde(default = "default_stats_sampling_interval")]
    pub sampling_interval: u32,

    /// Samples a lower level must persist before the pool shrinks.
    #[serde(default = "default_stats_downsize_delay")]
    pub downsize_delay: u32,

    /// Largest single shrink step.
    #[serde(default = "default_stats_downsize_limit")]
    pub downsize_limit: u32,
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(CONFIG_DIR)
        .join(DATABASE_FILE)
}

fn default_scan_delay_secs() -> u64 {
    60
}

fn default_scan_timeout_secs() -> u64 {
    300
}

fn default_reserve_expiry_secs() -> u64 {
    30 * 60
}

fn default_edge_provision_timeout_secs() -> u64 {
    30 * 60
}

fn default_edge_deletion_timeout_secs() -> u64 {
    10 * 60
}

fn default_call_timeout_secs() -> u64 {
    60
}

fn default_lock_ttl_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_namespace() -> String {
    "test".to_string()
}

fn default_app_chart_version() -> String {
    "0.24.0".to_string()
}

fn default_provisioner_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_account_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_audit_timeout_secs() -> u64 {
    5
}

fn default_stats_weight() -> f64 {
    0.4
}

fn default_stats_time_factor() -> f64 {
    5.0
}

fn default_stats_sampling_interval() -> u32 {
    1
}

fn default_stats_downsize_delay() -> u32 {
    3
}

fn default_stats_downsize_limit() -> u32 {
    2
}

impl Default for PoolStatsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            weight: default_stats_weight(),
            time_factor: default_stats_time_factor(),
            sampling_interval: default_stats_sampling_interval(),
            downsize_delay: default_stats_downsize_delay(),
            downsize_limit: default_stats_downsize_limit(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            scan_delay_secs: default_scan_delay_secs(),
            scan_timeout_secs: default_scan_timeout_secs(),
            reserve_expiry_secs: default_reserve_expiry_secs(),
            edge_provision_timeout_secs: default_edge_provision_timeout_secs(),
            edge_deletion_timeout_secs: default_edge_deletion_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            enable_scanner: true,
            disable_scale_out: false,
            namespace: default_namespace(),
            app_chart_version: default_app_chart_version(),
            provisioner_url: default_provisioner_url(),
            provisioner_token: None,
            account_url: default_account_url(),
            audit_timeout_secs: default_audit_timeout_secs(),
            pool_stats: PoolStatsConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Load config from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).context("Failed to read config file")?;

        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save config to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(path, content).context("Failed to write config file")
    }

    /// Set a field by its TOML key, e.g. `scan_delay_secs` or `pool_stats.enabled`.
    ///
    /// The value is read as a TOML literal when possible and as a plain
    /// string otherwise.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut doc = toml::Value::try_from(&*self).context("Failed to serialize config")?;

        let mut parts = key.split('.').peekable();
        let mut table = doc
            .as_table_mut()
            .context("Config is not a table")?;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                if !table.contains_key(part) && part != "provisioner_token" {
                    bail!("Unknown config key: {}", key);
                }
                table.insert(part.to_string(), parse_literal(value));
                break;
            }
            table = table
                .get_mut(part)
                .and_then(toml::Value::as_table_mut)
                .with_context(|| format!("Unknown config section: {}", part))?;
        }

        *self = doc
            .try_into()
            .with_context(|| format!("Invalid value for {}: {}", key, value))?;
        Ok(())
    }

    pub fn provisioner_token_secret(&self) -> Option<SecretString> {
        self.provisioner_token.clone().map(SecretString::from)
    }

    pub fn scan_delay(&self) -> Duration {
        Duration::from_secs(self.scan_delay_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn reserve_expiry(&self) -> Duration {
        Duration::from_secs(self.reserve_expiry_secs)
    }

    pub fn edge_provision_timeout(&self) -> Duration {
        Duration::from_secs(self.edge_provision_timeout_secs)
    }

    pub fn edge_deletion_timeout(&self) -> Duration {
        Duration::from_secs(self.edge_deletion_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn audit_timeout(&self) -> Duration {
        Duration::from_secs(self.audit_timeout_secs)
    }

    /// Get the config file path.
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Could not determine config directory")?;

        Ok(config_dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }
}

fn parse_literal(value: &str) -> toml::Value {
    if let Ok(v) = value.parse::<i64>() {
        return toml::Value::Integer(v);
    }
    if let Ok(v) = value.parse::<f64>() {
        return toml::Value::Float(v);
    }
    if let Ok(v) = value.parse::<bool>() {
        return toml::Value::Boolean(v);
    }
    toml::Value::String(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.scan_delay(), Duration::from_secs(60));
        assert_eq!(config.reserve_expiry(), Duration::from_secs(1800));
        assert_eq!(config.edge_provision_timeout(), Duration::from_secs(1800));
        assert_eq!(config.edge_deletion_timeout(), Duration::from_secs(600));
        assert!(config.enable_scanner);
        assert!(!config.pool_stats.enabled);
        assert_eq!(config.app_chart_version, "0.24.0");
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let parsed: PoolConfig = toml::from_str("scan_delay_secs = 5").unwrap();
        assert_eq!(parsed.scan_delay_secs, 5);
        assert_eq!(parsed.lock_ttl_secs, 30);
        assert_eq!(parsed.pool_stats, PoolStatsConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = PoolConfig::default();
        config.namespace = "staging".to_string();
        config.save_to(&path).unwrap();

        let loaded = PoolConfig::load_from(&path).unwrap();
        assert_eq!(loaded.namespace, "staging");
        assert_eq!(loaded.database_path, config.database_path);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = PoolConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded.scan_delay_secs, 60);
    }

    #[test]
    fn test_set_by_key() {
        let mut config = PoolConfig::default();
        config.set("scan_delay_secs", "5").unwrap();
        config.set("pool_stats.enabled", "true").unwrap();
        config.set("pool_stats.weight", "0.5").unwrap();
        config.set("namespace", "prod").unwrap();
        config.set("provisioner_token", "tok").unwrap();

        assert_eq!(config.scan_delay_secs, 5);
        assert!(config.pool_stats.enabled);
        assert_eq!(config.pool_stats.weight, 0.5);
        assert_eq!(config.namespace, "prod");
        assert!(config.provisioner_token_secret().is_some());

        assert!(config.set("no_such_key", "1").is_err());
        assert!(config.set("scan_delay_secs", "soon").is_err());
    }
}
