//! Configuration file loading.
//!
//! - `listen` - proxy listener address
//! - `upstream` - upstream client settings
//! - `rules` - modify rules with Rhai or selector based transforms

mod listen;
mod rules;
mod upstream;

pub use listen::ListenConfig;
pub use rules::{HtmlEdit, ModifyRuleConfig, TransformConfig};
pub use upstream::UpstreamConfig;

use crate::overrides::OverrideRule;
use crate::pipeline::Pipeline;
use crate::session::SessionOptions;
use anyhow::Context;
use serde::Deserialize;
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Storage-state key. Defaults to the config file name.
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub start_url: Option<String>,

    /// Incognito runs neither restore nor persist storage state.
    #[serde(default = "default_incognito")]
    pub incognito: bool,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub listen: ListenConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub overrides: Vec<OverrideRule>,

    #[serde(default)]
    pub modifies: Vec<ModifyRuleConfig>,
}

fn default_incognito() -> bool {
    true
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".auth")
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        Self::from_files(path, None::<&Path>)
    }

    /// Load `path`, filling anything it leaves unset from `global`.
    ///
    /// Maps merge recursively with `path` winning; lists are concatenated
    /// with the entries from `path` first.
    pub fn from_files<P, G>(path: P, global: Option<G>) -> Result<Self, anyhow::Error>
    where
        P: AsRef<Path>,
        G: AsRef<Path>,
    {
        let path = path.as_ref();
        let mut value = read_yaml(path)?;
        if let Some(global) = global {
            merge_defaults(&mut value, read_yaml(global.as_ref())?);
        }

        let mut config: Config = serde_yaml::from_value(value)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        if config.name.is_empty() {
            config.name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "default".to_string());
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.name.is_empty() || self.name.contains(['/', '\\']) {
            anyhow::bail!("Session name '{}' must be a plain file name", self.name);
        }

        if let Some(ref start_url) = self.start_url {
            Url::parse(start_url).with_context(|| format!("Invalid startUrl '{start_url}'"))?;
        }

        for (i, rule) in self.overrides.iter().enumerate() {
            rule.validate()
                .with_context(|| format!("Invalid override rule overrides[{i}]"))?;
        }

        for (i, rule) in self.modifies.iter().enumerate() {
            if rule.url_patterns.is_empty() {
                anyhow::bail!("modifies[{i}] has no urlPatterns");
            }
            rule.compile(i)
                .with_context(|| format!("Invalid modify rule modifies[{i}]"))?;
        }

        Ok(())
    }

    /// Pipeline carrying the declarative override and modify tables.
    pub fn pipeline(&self) -> Result<Pipeline, anyhow::Error> {
        let modifies = self
            .modifies
            .iter()
            .enumerate()
            .map(|(i, rule)| rule.compile(i))
            .collect::<crate::Result<Vec<_>>>()?;

        let mut pipeline = Pipeline::new();
        pipeline
            .overrides(self.overrides.iter().cloned())
            .modifies(modifies);
        Ok(pipeline)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            name: self.name.clone(),
            incognito: self.incognito,
            start_url: self.start_url.clone(),
            state_dir: self.state_dir.clone(),
        }
    }
}

fn read_yaml(path: &Path) -> Result<Value, anyhow::Error> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

fn merge_defaults(value: &mut Value, defaults: Value) {
    match (value, defaults) {
        (Value::Mapping(target), Value::Mapping(defaults)) => {
            for (key, default) in defaults {
                match target.get_mut(&key) {
                    Some(existing) => merge_defaults(existing, default),
                    None => {
                        target.insert(key, default);
                    }
                }
            }
        }
        (Value::Sequence(target), Value::Sequence(defaults)) => target.extend(defaults),
        (target @ Value::Null, default) => *target = default,
        _ => {}
    }
}
