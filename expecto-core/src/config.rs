//! # Configuration Module
//!
//! Loads `expecto.toml`: the global [`AsyncConfig`] used by every DSL call,
//! per-client targets with optional async overrides, and free-form values
//! that tests read through typed accessors.
//!
//! ## Loading flow
//!
//! ```text
//! +-------------------+     +-------------------+     +-------------------+
//! | EXPECTO_CONFIG    | --> | Path resolution   | --> | expecto.toml      |
//! | (optional)        |     | or default ./     |     |                   |
//! +-------------------+     +-------------------+     +-------------------+
//!                                                              |
//!                                                              v
//! +-------------------+     +-------------------+     +-------------------+
//! | Environment vars  | --> | EXPECTO_* prefix  | --> | Config struct     |
//! | EXPECTO_KEY=value |     | EXPECTO_<CLIENT>_ |     | async / clients / |
//! +-------------------+     +-------------------+     | data              |
//!                                                     +-------------------+
//! ```
//!
//! ## Layout
//!
//! ```toml
//! [async]
//! enabled = true
//! timeout = "10s"
//! interval = "200ms"
//! jitter = 0.2
//!
//! [async.backoff]
//! enabled = true
//! factor = 1.5
//! max_interval = "1s"
//!
//! [clients.orders_api]
//! address = "http://localhost:8080"
//! timeout = "5s"
//!
//! [clients.orders_api.async]
//! timeout = "3s"
//! ```
//!
//! `EXPECTO_CONFIG` is reserved for the config file path. Any other
//! `EXPECTO_<KEY>=value` variable lands in [`Config::data`] as `<key>`, and
//! `EXPECTO_<CLIENT>_ADDRESS` overrides the address of client `<client>`.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{collections::HashMap, io::Read, path::Path, time::Duration};
use toml::Value as TomlValue;
use tracing::*;

use crate::{Error, Result};

/// Environment variable name for specifying the config file path.
const EXPECTO_CONFIG_ENV: &str = "EXPECTO_CONFIG";
/// Environment variable holding the log filter, never a config value.
const EXPECTO_LOG_ENV: &str = "EXPECTO_LOG";
const ENV_PREFIX: &str = "EXPECTO";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_JITTER: f64 = 0.2;

static CONFIG: Lazy<Config> = Lazy::new(|| {
    let _ = dotenv::dotenv();
    Config::load().unwrap_or_else(|e| {
        error!("{e}");
        Config::default()
    })
});

/// Get the process-wide configuration, loading it on first use.
pub fn get_config() -> &'static Config {
    &CONFIG
}

/// Polling behaviour of asynchronous DSL calls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub backoff: BackoffConfig,
    /// Proportional jitter applied to every emitted delay. May exceed 1.
    pub jitter: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub enabled: bool,
    pub factor: f64,
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
}

impl Default for AsyncConfig {
    fn default() -> Self {
        AsyncConfig {
            enabled: true,
            timeout: DEFAULT_TIMEOUT,
            interval: DEFAULT_INTERVAL,
            backoff: BackoffConfig::default(),
            jitter: DEFAULT_JITTER,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            enabled: true,
            factor: DEFAULT_BACKOFF_FACTOR,
            max_interval: DEFAULT_MAX_INTERVAL,
        }
    }
}

impl AsyncConfig {
    /// Replace a zero timeout by the default one.
    pub fn with_defaults(mut self) -> AsyncConfig {
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        self
    }

    /// Default substitution plus clamping of out-of-range values.
    pub fn normalized(self) -> AsyncConfig {
        let mut cfg = self.with_defaults();
        if cfg.interval.is_zero() {
            cfg.interval = DEFAULT_INTERVAL;
        }
        if cfg.backoff.max_interval.is_zero() {
            cfg.backoff.max_interval = cfg.interval.max(DEFAULT_MAX_INTERVAL);
        }
        if !(cfg.backoff.factor >= 1.0) {
            cfg.backoff.factor = 1.0;
        }
        if !(cfg.jitter >= 0.0) {
            cfg.jitter = 0.0;
        }
        cfg
    }

    fn apply(mut self, o: &AsyncOverride) -> AsyncConfig {
        if let Some(enabled) = o.enabled {
            self.enabled = enabled;
        }
        if let Some(timeout) = o.timeout {
            self.timeout = timeout;
        }
        if let Some(interval) = o.interval {
            self.interval = interval;
        }
        if let Some(jitter) = o.jitter {
            self.jitter = jitter;
        }
        if let Some(b) = &o.backoff {
            if let Some(enabled) = b.enabled {
                self.backoff.enabled = enabled;
            }
            if let Some(factor) = b.factor {
                self.backoff.factor = factor;
            }
            if let Some(max_interval) = b.max_interval {
                self.backoff.max_interval = max_interval;
            }
        }
        self
    }
}

/// Partial `[clients.<name>.async]` table. Unset fields fall back to the
/// global `[async]` values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AsyncOverride {
    pub enabled: Option<bool>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,
    pub jitter: Option<f64>,
    pub backoff: Option<BackoffOverride>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackoffOverride {
    pub enabled: Option<bool>,
    pub factor: Option<f64>,
    #[serde(default, with = "humantime_serde")]
    pub max_interval: Option<Duration>,
}

/// Target of one transport client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub name: String,
    pub address: String,
    /// Per-request timeout of the transport itself.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default, rename = "async")]
    pub async_override: AsyncOverride,
    /// Effective polling config, filled in by [`Config::client`].
    #[serde(skip)]
    pub async_config: AsyncConfig,
}

/// expecto's configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default, rename = "async")]
    pub async_config: AsyncConfig,
    #[serde(default)]
    pub clients: IndexMap<String, ClientConfig>,
    /// Keys and values specified by user.
    #[serde(flatten)]
    pub data: HashMap<String, TomlValue>,
}

impl Config {
    /// Load configuration from path. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Config> {
        let Ok(mut file) = std::fs::File::open(path) else {
            debug!("{path:?} not found, using default configuration");
            return Ok(Config::default());
        };

        let mut buf = String::new();
        file.read_to_string(&mut buf)
            .map_err(|e| Error::LoadError(e.to_string()))?;

        let mut cfg = Config::from_toml(&buf)?;
        debug!("{path:?} was successfully loaded: {cfg:#?}");

        cfg.load_env();
        Ok(cfg)
    }

    /// Parse configuration from a TOML document without touching the environment.
    pub fn from_toml(s: &str) -> Result<Config> {
        let mut cfg: Config = toml::from_str(s).map_err(|e| {
            Error::LoadError(format!(
                "failed to deserialize expecto.toml into expecto::Config: {e}"
            ))
        })?;
        for (name, client) in cfg.clients.iter_mut() {
            client.name = name.clone();
        }
        Ok(cfg)
    }

    /// Load configuration.
    ///
    /// 1. If `EXPECTO_CONFIG` is set, load from that path
    /// 2. Otherwise, load from `expecto.toml` in the current directory
    pub fn load() -> Result<Config> {
        match std::env::var(EXPECTO_CONFIG_ENV) {
            Ok(path) => {
                if !looks_like_path(&path) {
                    return Err(Error::LoadError(format!(
                        "{EXPECTO_CONFIG_ENV} should be a path to a config file, not a config value. \
                         Got: {path:?}. Use EXPECTO_<KEY>=value for config values instead."
                    )));
                }

                let path = Path::new(&path);
                if !path.exists() {
                    return Err(Error::LoadError(format!(
                        "Config file specified by {EXPECTO_CONFIG_ENV} not found: {path:?}"
                    )));
                }

                debug!("Loading config from {EXPECTO_CONFIG_ENV}={path:?}");
                Config::load_from(path)
            }
            Err(_) => Config::load_from(Path::new("expecto.toml")),
        }
    }

    /// Merge `EXPECTO_*` environment variables into the configuration.
    fn load_env(&mut self) {
        let global_prefix = format!("{ENV_PREFIX}_");
        let client_prefixes: Vec<_> = self
            .clients
            .keys()
            .map(|name| format!("{ENV_PREFIX}_{}_", name.to_uppercase()))
            .collect();

        for (k, v) in std::env::vars() {
            if k == EXPECTO_CONFIG_ENV || k == EXPECTO_LOG_ENV {
                continue;
            }
            if let Some(pos) = client_prefixes.iter().position(|p| k.starts_with(p)) {
                let field = k[client_prefixes[pos].len()..].to_lowercase();
                if let Some((_, client)) = self.clients.get_index_mut(pos) {
                    match field.as_str() {
                        "address" => client.address = v,
                        "timeout" => match humantime::parse_duration(&v) {
                            Ok(d) => client.timeout = Some(d),
                            Err(e) => warn!("ignoring {k}={v:?}: {e}"),
                        },
                        _ => debug!("ignoring unknown client variable {k}"),
                    }
                }
                continue;
            }
            if let Some(key) = k.strip_prefix(&global_prefix) {
                self.data
                    .insert(key.to_lowercase(), TomlValue::String(v));
            }
        }

        debug!("configuration loaded from env: {self:#?}");
    }

    /// Client `name` with its async config resolved against the global one.
    pub fn client(&self, name: &str) -> Result<ClientConfig> {
        let client = self
            .clients
            .get(name)
            .ok_or_else(|| Error::ValueNotFound(format!("clients.{name}")))?;
        let mut resolved = client.clone();
        resolved.async_config = self
            .async_config
            .apply(&client.async_override)
            .normalized();
        Ok(resolved)
    }

    pub fn get(&self, key: impl AsRef<str>) -> Result<&TomlValue> {
        let key = key.as_ref();
        self.data
            .get(key)
            .ok_or_else(|| Error::ValueNotFound(key.to_string()))
    }

    pub fn get_str(&self, key: impl AsRef<str>) -> Result<&str> {
        let key = key.as_ref();
        self.get(key)?
            .as_str()
            .ok_or_else(|| Error::ValueNotFound(key.to_string()))
    }

    pub fn get_int(&self, key: impl AsRef<str>) -> Result<i64> {
        match self.get(key.as_ref())? {
            TomlValue::Integer(i) => Ok(*i),
            v => parse_str(v, key.as_ref()),
        }
    }

    pub fn get_float(&self, key: impl AsRef<str>) -> Result<f64> {
        match self.get(key.as_ref())? {
            TomlValue::Float(f) => Ok(*f),
            TomlValue::Integer(i) => Ok(*i as f64),
            v => parse_str(v, key.as_ref()),
        }
    }

    pub fn get_bool(&self, key: impl AsRef<str>) -> Result<bool> {
        match self.get(key.as_ref())? {
            TomlValue::Boolean(b) => Ok(*b),
            v => parse_str(v, key.as_ref()),
        }
    }

    /// Parse a humantime duration such as `"250ms"` or `"1m 30s"`.
    pub fn get_duration(&self, key: impl AsRef<str>) -> Result<Duration> {
        humantime::parse_duration(self.get_str(key)?)
            .map_err(|e| Error::ValueError(eyre::Error::from(e)))
    }

    pub fn get_array<T: DeserializeOwned>(&self, key: impl AsRef<str>) -> Result<Vec<T>> {
        serde_json::from_str(self.get_str(key)?)
            .map_err(|e| Error::ValueError(eyre::Error::from(e)))
    }

    pub fn get_object<T: DeserializeOwned>(&self, key: impl AsRef<str>) -> Result<T> {
        serde_json::from_str(self.get_str(key)?)
            .map_err(|e| Error::ValueError(eyre::Error::from(e)))
    }
}

fn parse_str<T>(v: &TomlValue, key: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    v.as_str()
        .ok_or_else(|| Error::ValueNotFound(key.to_string()))?
        .parse()
        .map_err(|e| Error::ValueError(eyre::Error::from(e)))
}

fn looks_like_path(v: &str) -> bool {
    Path::new(v).extension().is_some_and(|ext| ext == "toml")
        || v.contains(std::path::MAIN_SEPARATOR)
        || v.contains('/')
}
