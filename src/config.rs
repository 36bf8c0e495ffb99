use std::collections::BTreeSet;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::op::Entitlement;

/// Engine configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Every exec behaves as if it had `always: true`.
    pub no_cache: bool,
    /// Threads used to run the ready tasks of one pass.
    pub parallelism: Option<usize>,
    /// Upper bound on scheduler passes; reaching it ends the run early.
    pub max_passes: Option<usize>,
    /// Entitlements the host is willing to grant.
    pub allow: BTreeSet<Entitlement>,
    /// Name of the snapshot written by [`crate::Env::export_fs`].
    pub state_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            no_cache: false,
            parallelism: None,
            max_passes: None,
            allow: BTreeSet::new(),
            state_file: String::from("computed.json"),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Applies `SLUICE_NO_CACHE`, `SLUICE_PARALLELISM` and `SLUICE_MAX_PASSES`.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(
        mut self,
        var: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = var("SLUICE_NO_CACHE") {
            self.no_cache = match value.as_str() {
                "1" | "true" => true,
                "0" | "false" | "" => false,
                _ => {
                    return Err(ConfigError::Env {
                        key: "SLUICE_NO_CACHE",
                        value,
                    });
                }
            };
        }
        if let Some(value) = var("SLUICE_PARALLELISM") {
            self.parallelism = Some(parse_count("SLUICE_PARALLELISM", value)?);
        }
        if let Some(value) = var("SLUICE_MAX_PASSES") {
            self.max_passes = Some(parse_count("SLUICE_MAX_PASSES", value)?);
        }
        Ok(self)
    }
}

fn parse_count(key: &'static str, value: String) -> Result<usize, ConfigError> {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::Env { key, value }),
    }
}
