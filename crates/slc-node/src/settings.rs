//! Typed node settings parsed from a [`ConfigLookup`].
//!
//! ```toml
//! [node]
//! name = "HV_ARICH"
//! kind = "hv"              # hv | readout
//! channels = 48
//! tick_ms = 1000
//! tick_timeout_ms = 800    # must not exceed tick_ms
//! command_timeout_ms = 5000
//! daemonize = false
//! state_dir = "/var/lib/slc"
//!
//! [registry]
//! socket = "/tmp/slc.sock" # or mode = "local"
//!
//! [link]
//! endpoint = "hvcrate01:5000"   # or "simulated"
//! setpoint = 1500.0             # simulated links only
//!
//! [helper]
//! command = "/usr/bin/hvproxy"
//! args = ["--crate", "1"]
//! required = true
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use slc_core::{ConfigError, ConfigLookup, NodeName, RecordKind};

use crate::transport::Endpoint;

pub const DEFAULT_TICK: Duration = Duration::from_millis(1000);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_SETPOINT: f32 = 1000.0;

/// Where the node publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrySetting {
    /// In-process registry (single-process setups and tests)
    Local,
    /// `slcd` daemon socket
    Socket(PathBuf),
}

/// Where monitor readings come from.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkSetting {
    Simulated { setpoint: f32 },
    Endpoint(Endpoint),
}

/// Helper subprocess started next to the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperSpec {
    pub command: String,
    pub args: Vec<String>,
    /// A required helper's death stops the node
    pub required: bool,
}

impl HelperSpec {
    /// Short label for logs (the program's file name).
    pub fn label(&self) -> &str {
        self.command.rsplit('/').next().unwrap_or(&self.command)
    }
}

/// Everything a node needs from its configuration file.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSettings {
    pub name: NodeName,
    pub kind: RecordKind,
    pub channels: usize,
    pub tick: Duration,
    pub tick_timeout: Duration,
    pub command_timeout: Duration,
    pub daemonize: bool,
    pub state_dir: Option<PathBuf>,
    pub registry: RegistrySetting,
    pub link: LinkSetting,
    pub helper: Option<HelperSpec>,
}

impl NodeSettings {
    /// Builds settings for `name` with defaults everywhere else.
    pub fn new(name: NodeName, kind: RecordKind, channels: usize) -> Self {
        Self {
            name,
            kind,
            channels,
            tick: DEFAULT_TICK,
            tick_timeout: DEFAULT_TICK,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            daemonize: false,
            state_dir: None,
            registry: RegistrySetting::Local,
            link: LinkSetting::Simulated {
                setpoint: DEFAULT_SETPOINT,
            },
            helper: None,
        }
    }

    /// Parses and validates node settings.
    ///
    /// # Errors
    ///
    /// - `ConfigError::KeyNotFound` for a missing `[node] name` or `kind`
    /// - `ConfigError::InvalidValue` for malformed or inconsistent values
    pub fn from_lookup(cfg: &ConfigLookup) -> Result<Self, ConfigError> {
        let raw_name = cfg.get("node", "name")?;
        let name = NodeName::new(raw_name)
            .map_err(|e| invalid("node", "name", raw_name, e.to_string()))?;

        let raw_kind = cfg.get("node", "kind")?;
        let kind = parse_kind(raw_kind)?;

        let channels = parse_opt(cfg, "node", "channels")?.unwrap_or_else(|| kind.max_channels());
        if channels > kind.max_channels() {
            return Err(invalid(
                "node",
                "channels",
                &channels.to_string(),
                format!("{kind} nodes hold at most {}", kind.max_channels()),
            ));
        }

        let tick = millis(cfg, "tick_ms")?.unwrap_or(DEFAULT_TICK);
        if tick.is_zero() {
            return Err(invalid("node", "tick_ms", "0", "must be positive".to_string()));
        }
        let tick_timeout = millis(cfg, "tick_timeout_ms")?.unwrap_or(tick);
        if tick_timeout > tick || tick_timeout.is_zero() {
            return Err(invalid(
                "node",
                "tick_timeout_ms",
                &tick_timeout.as_millis().to_string(),
                "must be positive and at most tick_ms".to_string(),
            ));
        }
        let command_timeout = millis(cfg, "command_timeout_ms")?.unwrap_or(DEFAULT_COMMAND_TIMEOUT);

        let daemonize = parse_opt(cfg, "node", "daemonize")?.unwrap_or(false);
        let state_dir = cfg.get_opt("node", "state_dir").map(PathBuf::from);

        let registry = match (cfg.get_opt("registry", "mode"), cfg.get_opt("registry", "socket")) {
            (Some("local"), _) => RegistrySetting::Local,
            (Some(other), _) if other != "socket" => {
                return Err(invalid(
                    "registry",
                    "mode",
                    other,
                    "expected 'local' or 'socket'".to_string(),
                ))
            }
            (_, Some(path)) => RegistrySetting::Socket(PathBuf::from(path)),
            (_, None) => RegistrySetting::Socket(slc_protocol::socket_path()),
        };

        let link = match cfg.get_opt("link", "endpoint") {
            None | Some("simulated") => LinkSetting::Simulated {
                setpoint: parse_opt(cfg, "link", "setpoint")?.unwrap_or(DEFAULT_SETPOINT),
            },
            Some(descriptor) => LinkSetting::Endpoint(
                Endpoint::parse(descriptor)
                    .map_err(|e| invalid("link", "endpoint", descriptor, e.to_string()))?,
            ),
        };

        let helper = match cfg.get_opt("helper", "command") {
            None => None,
            Some(command) => Some(HelperSpec {
                command: command.to_string(),
                args: cfg
                    .get_opt("helper", "args")
                    .map(|a| a.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default(),
                required: parse_opt(cfg, "helper", "required")?.unwrap_or(false),
            }),
        };

        Ok(Self {
            name,
            kind,
            channels,
            tick,
            tick_timeout,
            command_timeout,
            daemonize,
            state_dir,
            registry,
            link,
            helper,
        })
    }

    /// Loads settings from a TOML file, optionally renaming the node.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Read` / `ConfigError::Parse` when the file is unusable
    /// - everything [`NodeSettings::from_lookup`] rejects
    /// - `ConfigError::InvalidValue` for a malformed `name_override`
    pub fn load(path: &Path, name_override: Option<&str>) -> Result<Self, ConfigError> {
        let mut settings = Self::from_lookup(&ConfigLookup::load(path)?)?;
        if let Some(raw) = name_override {
            settings.name =
                NodeName::new(raw).map_err(|e| invalid("node", "name", raw, e.to_string()))?;
        }
        Ok(settings)
    }
}

fn parse_kind(raw: &str) -> Result<RecordKind, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "hv" => Ok(RecordKind::Hv),
        "readout" => Ok(RecordKind::Readout),
        _ => Err(invalid(
            "node",
            "kind",
            raw,
            "expected 'hv' or 'readout'".to_string(),
        )),
    }
}

fn parse_opt<T: FromStr>(
    cfg: &ConfigLookup,
    section: &str,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    cfg.get_opt(section, key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| invalid(section, key, raw, e.to_string()))
        })
        .transpose()
}

fn millis(cfg: &ConfigLookup, key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_opt::<u64>(cfg, "node", key)?.map(Duration::from_millis))
}

fn invalid(section: &str, key: &str, value: &str, reason: String) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slc_core::{Fault, FaultKind};

    fn parse(text: &str) -> Result<NodeSettings, ConfigError> {
        NodeSettings::from_lookup(&ConfigLookup::from_toml_str(text).unwrap())
    }

    #[test]
    fn test_full_settings() {
        let settings = parse(
            r#"
            [node]
            name = "HV_ARICH"
            kind = "hv"
            channels = 48
            tick_ms = 500
            tick_timeout_ms = 400
            state_dir = "/var/lib/slc"

            [registry]
            socket = "/run/slc.sock"

            [link]
            endpoint = "hvcrate01:5000"

            [helper]
            command = "/usr/bin/hvproxy"
            args = ["--crate", "1"]
            required = true
            "#,
        )
        .unwrap();

        assert_eq!(settings.name.as_str(), "HV_ARICH");
        assert_eq!(settings.kind, RecordKind::Hv);
        assert_eq!(settings.channels, 48);
        assert_eq!(settings.tick, Duration::from_millis(500));
        assert_eq!(settings.tick_timeout, Duration::from_millis(400));
        assert_eq!(settings.command_timeout, DEFAULT_COMMAND_TIMEOUT);
        assert_eq!(settings.state_dir, Some(PathBuf::from("/var/lib/slc")));
        assert_eq!(
            settings.registry,
            RegistrySetting::Socket(PathBuf::from("/run/slc.sock"))
        );
        assert!(matches!(settings.link, LinkSetting::Endpoint(Endpoint::Tcp { port: 5000, .. })));

        let helper = settings.helper.unwrap();
        assert_eq!(helper.args, vec!["--crate", "1"]);
        assert!(helper.required);
        assert_eq!(helper.label(), "hvproxy");
    }

    #[test]
    fn test_defaults() {
        let settings = parse(
            r#"
            [node]
            name = "ropc01"
            kind = "readout"

            [registry]
            mode = "local"
            "#,
        )
        .unwrap();

        assert_eq!(settings.channels, slc_core::READOUT_MAX_CHANNELS);
        assert_eq!(settings.tick, DEFAULT_TICK);
        assert_eq!(settings.tick_timeout, DEFAULT_TICK);
        assert_eq!(settings.registry, RegistrySetting::Local);
        assert!(matches!(settings.link, LinkSetting::Simulated { .. }));
        assert!(settings.helper.is_none());
        assert!(!settings.daemonize);
    }

    #[test]
    fn test_missing_name_is_key_not_found() {
        let err = parse("[node]\nkind = \"hv\"\n").unwrap_err();
        assert_eq!(err.kind(), FaultKind::ConfigKeyNotFound);
    }

    #[test]
    fn test_load_failures_report_their_kind() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("absent.toml");
        let fault = Fault::from(NodeSettings::load(&missing, None).unwrap_err());
        assert_eq!(fault.kind, FaultKind::Config);
        assert!(fault.to_string().starts_with("ConfigError: cannot read"));
        assert!(fault.to_string().contains("absent.toml"));

        let no_kind = dir.path().join("no_kind.toml");
        std::fs::write(&no_kind, "[node]\nname = \"HV_TOP\"\n").unwrap();
        let fault = Fault::from(NodeSettings::load(&no_kind, None).unwrap_err());
        assert_eq!(fault.to_string(), "ConfigKeyNotFoundError: no key 'kind' in section [node]");
    }

    #[test]
    fn test_load_applies_name_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hv.toml");
        std::fs::write(&path, "[node]\nname = \"HV_TOP\"\nkind = \"hv\"\n").unwrap();

        let settings = NodeSettings::load(&path, Some("HV_BOTTOM")).unwrap();
        assert_eq!(settings.name.as_str(), "HV_BOTTOM");

        let err = NodeSettings::load(&path, Some("bad name")).unwrap_err();
        assert_eq!(err.kind(), FaultKind::Config);
        assert!(Fault::from(err).to_string().starts_with("ConfigError: invalid value 'bad name'"));
    }

    #[test]
    fn test_invalid_values() {
        let base = "[node]\nname = \"n\"\n";
        assert!(parse(&format!("{base}kind = \"camera\"\n")).is_err());
        assert!(parse(&format!("{base}kind = \"hv\"\nchannels = 93\n")).is_err());
        assert!(parse(&format!("{base}kind = \"hv\"\ntick_ms = 100\ntick_timeout_ms = 200\n")).is_err());
        assert!(parse(&format!("{base}kind = \"hv\"\ntick_ms = 0\n")).is_err());
        assert!(parse(&format!("{base}kind = \"hv\"\ndaemonize = \"maybe\"\n")).is_err());

        let err = parse("[node]\nname = \"bad name\"\nkind = \"hv\"\n").unwrap_err();
        assert_eq!(err.kind(), FaultKind::Config);
    }
}
