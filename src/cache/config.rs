//! Engine configuration.
//!
//! Controls the default evaluation mode for new queries. Loaded from
//! `depquery.toml` via [`crate::config::load`] or built in code.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// When a query runs its resolver for the first time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// Evaluate immediately when the query is registered.
    Eager,
    /// Evaluate on first read.
    #[default]
    Lazy,
}

impl UpdateMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eager => "eager",
            Self::Lazy => "lazy",
        }
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "eager" => Ok(Self::Eager),
            "lazy" => Ok(Self::Lazy),
            other => Err(format!("expected `eager` or `lazy`, got `{other}`")),
        }
    }
}

/// Defaults applied to every query registered on an engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub update: UpdateMode,
}

/// Engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub defaults: Defaults,
}

impl EngineConfig {
    /// Configuration whose queries evaluate at registration.
    pub fn eager() -> Self {
        Self::with_update(UpdateMode::Eager)
    }

    pub fn with_update(update: UpdateMode) -> Self {
        Self {
            defaults: Defaults { update },
        }
    }

    pub fn default_update(&self) -> UpdateMode {
        self.defaults.update
    }
}

impl From<&crate::config::Settings> for EngineConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        Self::with_update(settings.defaults.update)
    }
}
