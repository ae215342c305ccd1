//! Resolver options as they appear in configuration

use crate::core::constants::{delays, timeouts};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How the target PID is discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    File,
    Env,
    Command,
    Port,
}

/// `"path"` or `{ "path": "..." }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "FileSetting")]
pub struct FileOptions {
    pub path: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FileSetting {
    Path(PathBuf),
    Object { path: PathBuf },
}

impl From<FileSetting> for FileOptions {
    fn from(setting: FileSetting) -> Self {
        match setting {
            FileSetting::Path(path) | FileSetting::Object { path } => FileOptions { path },
        }
    }
}

/// Which candidate wins when a command pattern matches several processes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pick {
    #[default]
    First,
    Oldest,
    Newest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOptions {
    /// Substring searched for in the process name (or full args)
    pub pattern: String,
    #[serde(default)]
    pub full_command: bool,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub pick: Pick,
}

impl CommandOptions {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            full_command: false,
            case_sensitive: false,
            pick: Pick::default(),
        }
    }
}

/// Identity constraints checked against the resolved process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    /// Accepted process names; a single string is accepted too
    #[serde(default, deserialize_with = "one_or_many")]
    pub name: Vec<String>,
    /// Regular expression matched against the full argument string
    #[serde(default)]
    pub cmd_pattern: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

impl Constraints {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.cmd_pattern.is_none() && self.user.is_none()
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(name) => vec![name],
        OneOrMany::Many(names) => names,
    })
}

/// `true`, `false` or `{ "delay_ms": N }`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StrictMode {
    Flag(bool),
    Delay { delay_ms: u64 },
}

impl Default for StrictMode {
    fn default() -> Self {
        StrictMode::Flag(false)
    }
}

impl StrictMode {
    /// Delay before the second check, or `None` when strict mode is off.
    /// A zero delay falls back to the default.
    pub fn delay(&self) -> Option<Duration> {
        match *self {
            StrictMode::Flag(false) => None,
            StrictMode::Flag(true) | StrictMode::Delay { delay_ms: 0 } => Some(delays::STRICT),
            StrictMode::Delay { delay_ms } => Some(Duration::from_millis(delay_ms)),
        }
    }
}

/// Process inspection backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InspectorKind {
    /// The external `ps` tool
    #[default]
    Ps,
    /// In-process enumeration through sysinfo
    Sysinfo,
}

fn default_timeout_ms() -> u64 {
    timeouts::LOOKUP.as_millis() as u64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverOptions {
    pub strategy: Strategy,
    #[serde(default)]
    pub file: Option<FileOptions>,
    #[serde(default)]
    pub command: Option<CommandOptions>,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub strict: StrictMode,
    #[serde(default)]
    pub ensure_unique: bool,
    /// Bound on every external lookup; zero means the default
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub return_info: bool,
    #[serde(default)]
    pub inspector: InspectorKind,
}

impl ResolverOptions {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            file: None,
            command: None,
            constraints: Constraints::default(),
            strict: StrictMode::default(),
            ensure_unique: false,
            timeout_ms: default_timeout_ms(),
            return_info: false,
            inspector: InspectorKind::default(),
        }
    }

    /// File strategy reading the PID from `path`
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self::new(Strategy::File).with_file(path)
    }

    /// Command strategy matching `pattern`
    pub fn from_command(pattern: impl Into<String>) -> Self {
        Self::new(Strategy::Command).with_command(CommandOptions::new(pattern))
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(FileOptions { path: path.into() });
        self
    }

    pub fn with_command(mut self, command: CommandOptions) -> Self {
        self.command = Some(command);
        self
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_strict(mut self, strict: StrictMode) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_ensure_unique(mut self, ensure_unique: bool) -> Self {
        self.ensure_unique = ensure_unique;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_return_info(mut self, return_info: bool) -> Self {
        self.return_info = return_info;
        self
    }

    pub fn with_inspector(mut self, inspector: InspectorKind) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn timeout(&self) -> Duration {
        if self.timeout_ms == 0 {
            timeouts::LOOKUP
        } else {
            Duration::from_millis(self.timeout_ms)
        }
    }
}
