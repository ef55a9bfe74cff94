//! Layered application configuration.
//!
//! Sources, lowest precedence first:
//! 1. built-in defaults
//! 2. a TOML file (`--config`, else `$MORAX_CONFIG`, else `morax.toml`; a
//!    missing file is skipped)
//! 3. `MORAX_`-prefixed environment variables, `__` separating nested keys
//!    (`MORAX_CONSUMER__REFERENCE__TIMEOUT=500`)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

pub const CONFIG_ENV: &str = "MORAX_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "morax.toml";
const ENV_PREFIX: &str = "MORAX_";

pub const DEFAULT_PROVIDER_PORT: u16 = 8888;
pub const DEFAULT_CHECK_PORT: u16 = 8889;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub provider: ProviderConfig,
    pub check: CheckConfig,
    pub registry: RegistryConfig,
    pub consumer: ConsumerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    /// Address to advertise. Empty means the first non-loopback IPv4 address.
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub port: u16,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PROVIDER_PORT,
        }
    }
}

/// Health check listener and the check definition sent to the registry.
/// Durations are registry duration strings such as `"5s"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    pub port: u16,
    pub timeout: String,
    pub interval: String,
    pub deregister_after: String,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_CHECK_PORT,
            timeout: "5s".into(),
            interval: "5s".into(),
            deregister_after: "30s".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub address: String,
    /// Upper bound for one blocking instance query.
    pub wait_secs: u64,
    /// Pause before re-watching after a failed or empty query.
    pub watch_retry_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8500".into(),
            wait_secs: 30,
            watch_retry_secs: 5,
        }
    }
}

impl RegistryConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    pub fn watch_retry(&self) -> Duration {
        Duration::from_secs(self.watch_retry_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub reference: ReferenceConfig,
}

/// Call settings at one level. Empty or zero values defer to the level below.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub load_balance: String,
    /// Milliseconds per attempt.
    pub timeout: u64,
    pub retries: u32,
}

/// Global call settings plus per-provider overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    #[serde(flatten)]
    pub call: CallConfig,
    pub providers: HashMap<String, ProviderReference>,
}

/// Provider-level call settings plus per-method overrides keyed by the
/// lower-cased method name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderReference {
    #[serde(flatten)]
    pub call: CallConfig,
    pub methods: HashMap<String, CallConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
    pub verbose: bool,
}

impl AppConfig {
    /// Load configuration from defaults, the config file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        Self::figment(&path)
            .extract()
            .with_context(|| format!("invalid configuration (file: {})", path.display()))
    }

    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }
}
