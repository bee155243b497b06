//! Flat key/value configuration lookup.
//!
//! Configuration is a set of [`ConfigEntry`] values addressed by
//! `(section, key)`. It is loaded once from TOML and read-only afterwards:
//!
//! - each table becomes a section (nested tables use dotted names, `a.b`)
//! - top-level scalars live in the section `""`
//! - scalars are stored as their string form (`true`, `250`, `1.5`, ...)
//! - arrays of scalars are joined with single spaces
//!
//! No type coercion happens here; consumers parse the strings they need.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::error::{Fault, FaultKind};

/// Errors raised by the configuration layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The `(section, key)` pair is absent.
    #[error("no key '{key}' in section [{section}]")]
    KeyNotFound { section: String, key: String },

    /// The configuration source could not be read.
    #[error("cannot read {path}: {reason}")]
    Read { path: String, reason: String },

    /// The configuration source is not valid TOML.
    #[error("invalid configuration: {0}")]
    Parse(String),

    /// A value is present but malformed.
    #[error("invalid value '{value}' for [{section}] {key}: {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::KeyNotFound { .. } => FaultKind::ConfigKeyNotFound,
            Self::Read { .. } | Self::Parse(_) | Self::InvalidValue { .. } => FaultKind::Config,
        }
    }
}

impl From<ConfigError> for Fault {
    fn from(err: ConfigError) -> Self {
        Fault::new(err.kind(), err.to_string())
    }
}

/// One configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub section: String,
    pub key: String,
    pub value: String,
}

impl ConfigEntry {
    pub fn new(section: impl Into<String>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            section: section.into(),
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Read-only `(section, key) -> value` table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigLookup {
    entries: BTreeMap<(String, String), String>,
}

impl ConfigLookup {
    /// Builds a lookup from explicit entries. Later duplicates win.
    pub fn from_entries(entries: impl IntoIterator<Item = ConfigEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|e| ((e.section, e.key), e.value))
            .collect();
        Self { entries }
    }

    /// Parses TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let root: toml::Table = text
            .parse()
            .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))?;
        let mut entries = BTreeMap::new();
        flatten_table("", &root, &mut entries);
        Ok(Self { entries })
    }

    /// Reads and parses a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let lookup = Self::from_toml_str(&text)?;
        debug!(path = %path.display(), entries = lookup.len(), "Loaded configuration");
        Ok(lookup)
    }

    /// Returns the value stored under `(section, key)`.
    pub fn get(&self, section: &str, key: &str) -> Result<&str, ConfigError> {
        self.get_opt(section, key)
            .ok_or_else(|| ConfigError::KeyNotFound {
                section: section.to_string(),
                key: key.to_string(),
            })
    }

    /// Returns the value under `(section, key)`, if present.
    pub fn get_opt(&self, section: &str, key: &str) -> Option<&str> {
        self.entries
            .get(&(section.to_string(), key.to_string()))
            .map(String::as_str)
    }

    /// Returns true if any key exists in `section`.
    pub fn has_section(&self, section: &str) -> bool {
        self.entries.keys().any(|(s, _)| s == section)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over all entries in `(section, key)` order.
    pub fn entries(&self) -> impl Iterator<Item = ConfigEntry> + '_ {
        self.entries
            .iter()
            .map(|((section, key), value)| ConfigEntry::new(section, key, value))
    }
}

fn flatten_table(
    section: &str,
    table: &toml::Table,
    out: &mut BTreeMap<(String, String), String>,
) {
    for (key, value) in table {
        match value {
            toml::Value::Table(inner) => {
                let name = if section.is_empty() {
                    key.clone()
                } else {
                    format!("{section}.{key}")
                };
                flatten_table(&name, inner, out);
            }
            other => {
                if let Some(text) = scalar_string(other) {
                    out.insert((section.to_string(), key.clone()), text);
                }
            }
        }
    }
}

fn scalar_string(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Datetime(d) => Some(d.to_string()),
        toml::Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(scalar_string).collect();
            Some(parts.join(" "))
        }
        toml::Value::Table(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        title = "arich"

        [node]
        name = "HV_ARICH"
        channels = 92
        daemonize = false

        [helper]
        command = "/usr/bin/hvmon"
        args = ["--crate", "3"]

        [link.extra]
        gain = 1.5
    "#;

    #[test]
    fn test_get_returns_stored_value() {
        let cfg = ConfigLookup::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.get("node", "name").unwrap(), "HV_ARICH");
        assert_eq!(cfg.get("node", "channels").unwrap(), "92");
        assert_eq!(cfg.get("node", "daemonize").unwrap(), "false");
        assert_eq!(cfg.get("", "title").unwrap(), "arich");
        assert_eq!(cfg.get("helper", "args").unwrap(), "--crate 3");
        assert_eq!(cfg.get("link.extra", "gain").unwrap(), "1.5");
    }

    #[test]
    fn test_missing_key_is_key_not_found() {
        let cfg = ConfigLookup::from_toml_str(SAMPLE).unwrap();
        let err = cfg.get("node", "tick_ms").unwrap_err();
        assert_eq!(err.kind(), FaultKind::ConfigKeyNotFound);
        assert!(cfg.get("nosuch", "name").is_err());
    }

    #[test]
    fn test_from_entries() {
        let cfg = ConfigLookup::from_entries([
            ConfigEntry::new("hv", "vset", "1500"),
            ConfigEntry::new("hv", "vset", "1600"),
        ]);
        assert_eq!(cfg.get("hv", "vset").unwrap(), "1600");
        assert_eq!(cfg.len(), 1);
        assert!(cfg.has_section("hv"));
        assert!(!cfg.has_section("node"));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = ConfigLookup::from_toml_str("[node\nname=").unwrap_err();
        assert_eq!(err.kind(), FaultKind::Config);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let cfg = ConfigLookup::load(&path).unwrap();
        assert_eq!(cfg.get("helper", "command").unwrap(), "/usr/bin/hvmon");

        let missing = ConfigLookup::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}
