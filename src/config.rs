//! Configuration loader and validator for the catalog→channel connector.
//!
//! The YAML file is the operator surface: app settings plus the account
//! roster (endpoint, inclusion predicate, export mapping). Predicates and
//! mappings are validated here, at save time, so a config that loads is one
//! the scheduler can run without configuration surprises.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::db::AccountSpec;
use crate::domain::{Predicate, PredicateError};
use crate::mapping::{ExportMapping, MappingError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("Invalid domain for account `{account}`: {source}")]
    Domain {
        account: String,
        source: PredicateError,
    },
    #[error("Invalid mapping for account `{account}`: {source}")]
    Mapping {
        account: String,
        source: MappingError,
    },
    #[error("Duplicate account host: {0}")]
    DuplicateHost(String),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub accounts: Vec<AccountConfig>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    /// Row bound applied to every work query in a scheduling pass.
    pub row_limit: i64,
}

/// One account on the channel platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountConfig {
    pub name: String,
    pub host: String,
    pub api_key: String,
    pub domain: Predicate,
    pub mapping: ExportMapping,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn account_specs(&self) -> Vec<AccountSpec> {
        self.accounts
            .iter()
            .map(|a| AccountSpec {
                name: a.name.clone(),
                host: a.host.clone(),
                api_key: a.api_key.clone(),
                domain: a.domain.clone(),
                mapping: a.mapping.clone(),
            })
            .collect()
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.row_limit <= 0 {
        return Err(ConfigError::Invalid("app.row_limit must be > 0"));
    }
    if cfg.accounts.is_empty() {
        return Err(ConfigError::Invalid("at least one account is required"));
    }

    let mut hosts = std::collections::HashSet::new();
    for account in &cfg.accounts {
        if account.name.trim().is_empty() {
            return Err(ConfigError::Invalid("accounts[].name must be non-empty"));
        }
        if account.host.trim().is_empty() {
            return Err(ConfigError::Invalid("accounts[].host must be non-empty"));
        }
        if account.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid("accounts[].api_key must be non-empty"));
        }
        // There can be at most one account per host.
        if !hosts.insert(account.host.trim()) {
            return Err(ConfigError::DuplicateHost(account.host.clone()));
        }
        account
            .domain
            .validate()
            .map_err(|source| ConfigError::Domain {
                account: account.name.clone(),
                source,
            })?;
        account
            .mapping
            .validate()
            .map_err(|source| ConfigError::Mapping {
                account: account.name.clone(),
                source,
            })?;
    }
    Ok(())
}

/// Complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 60000
  row_limit: 500

accounts:
  - name: "Main account"
    host: "https://demo.channelplatform.example/api/"
    api_key: "YOUR_API_KEY"
    domain:
      all:
        - { field: category_trail, op: contains, value: "Shoes" }
        - { not: { field: sku, op: eq, value: "INTERNAL" } }
    mapping:
      - { source: name, target: "Name" }
      - { source: sku, target: "MerchantProductNo" }
      - { source: category_trail, target: "CategoryTrail" }
      - { source: family_display_name, target: "Brand" }
"#
}
