//! Broker configuration.
//!
//! `contextd.toml`, TOML-deserialized with per-field defaults. A missing
//! file yields the full default configuration, including the three stock
//! rule instances (`bluez`, `session`, `profile`); a file that omits
//! `[[rules]]` keeps those defaults too.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::value::is_valid_key;

/// Top-level broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    /// Daemon settings.
    #[serde(default)]
    pub daemon: DaemonSection,

    /// Derivation rule instances, recomputed in declaration order.
    #[serde(default = "default_rules")]
    pub rules: Vec<RuleSpec>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonSection::default(),
            rules: default_rules(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Load from `path`, falling back to the built-in defaults when the
    /// file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error for any failure other than the file being absent.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks what serde cannot: non-zero capacities, well-formed key
    /// names, non-empty rule names, and globally unique derived outputs.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.max_connections == 0 {
            return Err(ConfigError::Validation(
                "daemon.max_connections must be non-zero".to_string(),
            ));
        }
        if self.daemon.session_queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "daemon.session_queue_capacity must be non-zero".to_string(),
            ));
        }
        let mut outputs: HashSet<&str> = HashSet::new();
        for spec in &self.rules {
            if spec.name().is_empty() {
                return Err(ConfigError::Validation(
                    "rule name must not be empty".to_string(),
                ));
            }
            if let RuleSpec::Passthrough { name, map } = spec {
                if map.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "passthrough rule {name} has an empty map"
                    )));
                }
            }
            for key in spec.input_keys().into_iter().chain(spec.output_keys()) {
                if !is_valid_key(key) {
                    return Err(ConfigError::Validation(format!(
                        "rule {} binds malformed property name {key:?}",
                        spec.name()
                    )));
                }
            }
            for output in spec.output_keys() {
                if !outputs.insert(output) {
                    return Err(ConfigError::Validation(format!(
                        "derived output {output} is claimed by more than one rule"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// `[daemon]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonSection {
    /// Provider socket path (mode 0600, mutating plane).
    #[serde(default = "default_provider_socket")]
    pub provider_socket: PathBuf,

    /// Subscriber socket path (mode 0660, read/notify plane).
    #[serde(default = "default_subscriber_socket")]
    pub subscriber_socket: PathBuf,

    /// PID file written when daemonized.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Upper bound on concurrent connections across both sockets.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Bounded outbound queue length per subscriber session. When a
    /// session's queue is full, further pushes to it are dropped.
    #[serde(default = "default_session_queue_capacity")]
    pub session_queue_capacity: usize,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            provider_socket: default_provider_socket(),
            subscriber_socket: default_subscriber_socket(),
            pid_file: default_pid_file(),
            max_connections: default_max_connections(),
            session_queue_capacity: default_session_queue_capacity(),
        }
    }
}

/// Runtime directory for sockets and the PID file:
/// `$XDG_RUNTIME_DIR/contextd`, falling back to `/tmp/contextd`.
#[must_use]
pub fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR").map_or_else(
        |_| PathBuf::from("/tmp/contextd"),
        |runtime_dir| PathBuf::from(runtime_dir).join("contextd"),
    )
}

fn default_provider_socket() -> PathBuf {
    runtime_dir().join("provider.sock")
}

fn default_subscriber_socket() -> PathBuf {
    runtime_dir().join("subscriber.sock")
}

fn default_pid_file() -> PathBuf {
    runtime_dir().join("contextd.pid")
}

const fn default_max_connections() -> usize {
    256
}

const fn default_session_queue_capacity() -> usize {
    64
}

/// A `[[rules]]` entry selecting and binding one rule instance.
///
/// Instances carry a synthetic provider identity `<name>-<ordinal>` where
/// the ordinal counts instances of the same name in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RuleSpec {
    /// Boolean pass-through with existence gate; `map` binds each raw
    /// input to its derived output.
    Passthrough {
        name: String,
        map: BTreeMap<String, String>,
    },

    /// Priority-ordered session state: `fullscreen` over `blanked` over
    /// `normal`.
    SessionState {
        name: String,
        blanked: String,
        fullscreen: String,
        output: String,
    },

    /// Sticky profile name with validation.
    Profile {
        name: String,
        input: String,
        output: String,
    },
}

impl RuleSpec {
    /// Instance base name; the ordinal is appended when rules are built.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Passthrough { name, .. }
            | Self::SessionState { name, .. }
            | Self::Profile { name, .. } => name,
        }
    }

    /// Raw property names this instance reads.
    #[must_use]
    pub fn input_keys(&self) -> Vec<&str> {
        match self {
            Self::Passthrough { map, .. } => map.keys().map(String::as_str).collect(),
            Self::SessionState {
                blanked,
                fullscreen,
                ..
            } => vec![blanked, fullscreen],
            Self::Profile { input, .. } => vec![input],
        }
    }

    /// Derived property names this instance will claim.
    #[must_use]
    pub fn output_keys(&self) -> Vec<&str> {
        match self {
            Self::Passthrough { map, .. } => map.values().map(String::as_str).collect(),
            Self::SessionState { output, .. } | Self::Profile { output, .. } => vec![output],
        }
    }
}

fn default_rules() -> Vec<RuleSpec> {
    vec![
        RuleSpec::Passthrough {
            name: "bluez".to_string(),
            map: BTreeMap::from([
                (
                    "Bluetooth.Powered".to_string(),
                    "Bluetooth.Enabled".to_string(),
                ),
                (
                    "Bluetooth.Discoverable".to_string(),
                    "Bluetooth.Visible".to_string(),
                ),
            ]),
        },
        RuleSpec::SessionState {
            name: "session".to_string(),
            blanked: "Screen.Blanked".to_string(),
            fullscreen: "Screen.Fullscreen".to_string(),
            output: "Session.State".to_string(),
        },
        RuleSpec::Profile {
            name: "profile".to_string(),
            input: "Profile.Active".to_string(),
            output: "Profile.Name".to_string(),
        },
    ]
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
