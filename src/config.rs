use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context as _, bail};
use serde::Deserialize;

use crate::{coordinator::CoordinatorOptions, store::MAX_STORED_MESSAGES};

pub const PROJECT_CONFIG_FILE: &str = "wsinspect.toml";
const HOME_CONFIG_DIR: &str = ".wsinspect";
const HOME_CONFIG_FILE: &str = "config.toml";
const DEFAULT_DB_FILE: &str = "messages.db";
const DEFAULT_OBSERVER_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub interceptor: InterceptorConfig,
    #[serde(default)]
    pub observer: ObserverConfig,
    pub logging: Option<LoggingConfig>,
}

/// Where a loaded [`Config`] came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Explicit(PathBuf),
    Project,
    Home(PathBuf),
    Defaults,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit(path) => write!(f, "--config {}", path.display()),
            Self::Project => write!(f, "project ./{PROJECT_CONFIG_FILE}"),
            Self::Home(path) => write!(f, "home {}", path.display()),
            Self::Defaults => f.write_str("built-in defaults"),
        }
    }
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    /// Loads `explicit` if given, otherwise the first of `./wsinspect.toml`
    /// and `$HOME/.wsinspect/config.toml` that exists, otherwise defaults.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_with_source(explicit).map(|(config, _)| config)
    }

    pub fn load_with_source(explicit: Option<&Path>) -> anyhow::Result<(Self, ConfigSource)> {
        let source = discover(explicit);
        let config = match &source {
            ConfigSource::Explicit(path) | ConfigSource::Home(path) => Self::from_path(path),
            ConfigSource::Project => Self::from_path(PROJECT_CONFIG_FILE),
            ConfigSource::Defaults => Ok(Self::default()),
        }
        .with_context(|| format!("load config from {source}"))?;
        Ok((config, source))
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            max_messages: self.store.max_messages,
            observer_channel_capacity: self.observer.channel_capacity,
            ..CoordinatorOptions::default()
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.store.max_messages == 0 {
            bail!("`store.max_messages` must be at least 1");
        }
        if self.observer.channel_capacity == 0 {
            bail!("`observer.channel_capacity` must be at least 1");
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s).context("parse config TOML")?;
        config.validate()?;
        Ok(config)
    }
}

fn discover(explicit: Option<&Path>) -> ConfigSource {
    if let Some(path) = explicit {
        return ConfigSource::Explicit(path.to_path_buf());
    }
    if Path::new(PROJECT_CONFIG_FILE).is_file() {
        return ConfigSource::Project;
    }
    if let Some(path) = home_dir().map(|home| home.join(HOME_CONFIG_DIR).join(HOME_CONFIG_FILE))
        && path.is_file()
    {
        return ConfigSource::Home(path);
    }
    ConfigSource::Defaults
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
        }
    }
}

fn default_max_messages() -> usize {
    MAX_STORED_MESSAGES
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    /// Database file to open: the configured path with `~` expanded, or
    /// `$HOME/.wsinspect/messages.db`.
    pub fn resolved_path(&self) -> anyhow::Result<PathBuf> {
        match &self.path {
            Some(path) => expand_tilde_path(path),
            None => home_dir()
                .map(|home| home.join(HOME_CONFIG_DIR).join(DEFAULT_DB_FILE))
                .ok_or_else(|| {
                    anyhow::anyhow!("HOME is not set; configure `[storage].path` explicitly")
                }),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterceptorConfig {
    pub listen_url_fragment: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObserverConfig {
    #[serde(default = "default_observer_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_observer_channel_capacity(),
        }
    }
}

fn default_observer_channel_capacity() -> usize {
    DEFAULT_OBSERVER_CHANNEL_CAPACITY
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}

fn expand_tilde_path(path: &Path) -> anyhow::Result<PathBuf> {
    let Ok(rest) = path.strip_prefix("~") else {
        return Ok(path.to_path_buf());
    };
    let home = home_dir()
        .ok_or_else(|| anyhow::anyhow!("cannot expand `{}`: HOME is not set", path.display()))?;
    Ok(home.join(rest))
}
