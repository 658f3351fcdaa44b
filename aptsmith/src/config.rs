use clap::{ValueEnum, builder::PossibleValue};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    fmt::Display,
    path::{Path, PathBuf},
    sync::OnceLock,
};
use strum::EnumIter;

/// Fallback host-side package cache when none is configured.
const DEFAULT_CACHE_DIR: &str = "/var/cache/apt/archives";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to access config file: `{0}`")]
    Io(#[from] std::io::Error),
    #[error("failed to decode JSON config: `{0}`")]
    Json(#[from] serde_json::Error),
    #[error("failed to decode RON config: `{0}`")]
    Ron(#[from] ron::error::SpannedError),
    #[error("failed to encode RON config: `{0}`")]
    RonSer(#[from] ron::Error),
    #[error("failed to decode TOML config: `{0}`")]
    Toml(#[from] toml::de::Error),
    #[error("failed to encode TOML config: `{0}`")]
    TomlSer(#[from] toml::ser::Error),
    #[error("failed to decode YAML config: `{0}`")]
    Yaml(#[from] serde_yaml::Error),
    #[error("undefined variable in config: `{0}`")]
    UndefinedVariable(String),
}

/// Settings controlling how APT is configured on the remote machine.
#[derive(Clone, Serialize, Deserialize, Default, Debug)]
pub struct ProvisionConfig {
    /// Packages to install, in order
    #[serde(default)]
    pub packages: Vec<String>,

    /// Source list lines to install under /etc/apt/sources.list.d
    #[serde(default)]
    pub sources: Vec<String>,

    /// Local paths of package trust keys to upload
    #[serde(default)]
    pub keys: Vec<String>,

    /// Host-side package cache directory
    #[serde(default)]
    pub cache_dir: String,
}

impl ProvisionConfig {
    /// Resolve variable references and fill in defaults. Called once before
    /// a provisioning run; the config is read-only afterwards.
    pub fn prepare(&mut self) -> Result<(), ConfigError> {
        for field in self
            .packages
            .iter_mut()
            .chain(self.sources.iter_mut())
            .chain(self.keys.iter_mut())
        {
            *field = interpolate(field)?;
        }
        self.cache_dir = interpolate(&self.cache_dir)?;

        if self.cache_dir.is_empty() {
            self.cache_dir = DEFAULT_CACHE_DIR.to_string();
        }
        Ok(())
    }
}

/// Expand `${NAME}` environment variable references in the given string.
fn interpolate(value: &str) -> Result<String, ConfigError> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").unwrap());

    let mut out = String::with_capacity(value.len());
    let mut last = 0;
    for captures in pattern.captures_iter(value) {
        let reference = captures.get(0).unwrap();
        let name = &captures[1];

        out.push_str(&value[last..reference.start()]);
        match std::env::var(name) {
            Ok(val) => out.push_str(&val),
            Err(_) => return Err(ConfigError::UndefinedVariable(name.to_string())),
        }
        last = reference.end();
    }
    out.push_str(&value[last..]);
    Ok(out)
}

/// Represents an aptsmith configuration file. This mainly helps sort out the
/// various supported config formats.
#[derive(Clone, Debug, EnumIter)]
pub enum ConfigPath {
    Json(PathBuf),
    Ron(PathBuf),
    Toml(PathBuf),
    Yaml(PathBuf),
}

impl Default for ConfigPath {
    fn default() -> Self {
        ConfigPath::Json(PathBuf::from("./aptsmith.json"))
    }
}

static VARIANTS: OnceLock<Vec<ConfigPath>> = OnceLock::new();

impl ValueEnum for ConfigPath {
    fn value_variants<'a>() -> &'a [Self] {
        VARIANTS.get_or_init(|| {
            vec![
                ConfigPath::Json(PathBuf::from("./aptsmith.json")),
                ConfigPath::Ron(PathBuf::from("./aptsmith.ron")),
                ConfigPath::Toml(PathBuf::from("./aptsmith.toml")),
                ConfigPath::Yaml(PathBuf::from("./aptsmith.yaml")),
            ]
        })
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        match *self {
            ConfigPath::Json(_) => Some(PossibleValue::new("json")),
            ConfigPath::Ron(_) => Some(PossibleValue::new("ron")),
            ConfigPath::Toml(_) => Some(PossibleValue::new("toml")),
            ConfigPath::Yaml(_) => Some(PossibleValue::new("yaml")),
        }
    }
}

impl ConfigPath {
    /// Check for an aptsmith configuration file in the given directory.
    pub fn from_dir(path: impl AsRef<Path>) -> Option<ConfigPath> {
        let path = path.as_ref();

        if path.join("aptsmith.json").exists() {
            Some(ConfigPath::Json(path.join("aptsmith.json")))
        } else if path.join("aptsmith.ron").exists() {
            Some(ConfigPath::Ron(path.join("aptsmith.ron")))
        } else if path.join("aptsmith.toml").exists() {
            Some(ConfigPath::Toml(path.join("aptsmith.toml")))
        } else if path.join("aptsmith.yaml").exists() {
            Some(ConfigPath::Yaml(path.join("aptsmith.yaml")))
        } else if path.join("aptsmith.yml").exists() {
            Some(ConfigPath::Yaml(path.join("aptsmith.yml")))
        } else {
            None
        }
    }

    /// Read the configuration file into a new [`ProvisionConfig`].
    pub fn load(&self) -> Result<ProvisionConfig, ConfigError> {
        Ok(match &self {
            Self::Json(path) => serde_json::from_slice(&std::fs::read(path)?)?,
            Self::Ron(path) => ron::de::from_bytes(&std::fs::read(path)?)?,
            Self::Toml(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
            Self::Yaml(path) => serde_yaml::from_slice(&std::fs::read(path)?)?,
        })
    }

    /// Write a [`ProvisionConfig`] to a configuration file.
    pub fn write(&self, config: &ProvisionConfig) -> Result<(), ConfigError> {
        match &self {
            Self::Json(path) => std::fs::write(path, serde_json::to_vec_pretty(config)?),
            Self::Ron(path) => std::fs::write(
                path,
                ron::ser::to_string_pretty(config, ron::ser::PrettyConfig::new())?.into_bytes(),
            ),
            Self::Toml(path) => std::fs::write(path, toml::to_string_pretty(config)?.into_bytes()),
            Self::Yaml(path) => std::fs::write(path, serde_yaml::to_string(config)?.into_bytes()),
        }?;
        Ok(())
    }
}

impl Display for ConfigPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let path = match self {
            ConfigPath::Json(path) => path,
            ConfigPath::Ron(path) => path,
            ConfigPath::Toml(path) => path,
            ConfigPath::Yaml(path) => path,
        }
        .to_string_lossy();
        path.fmt(f)
    }
}
