//! Client and daemon configuration
//!
//! Settings come from `~/.warmcrc` and are overridden by the environment:
//! - WARMC_DAEMON (1/true/yes/on enables compiling through the daemon)
//! - WARMC_DAEMON_SOCKET (path of the daemon's unix socket)
//! - WARMC_JVM_COMPILER (compiler executable for the bytecode target)
//! - WARMC_JS_COMPILER (compiler executable for the web target)
//!
//! The rc file uses shell assignment syntax, `export` prefixes and quotes
//! are accepted.

use crate::compiler::CompilerKind;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const ENV_DAEMON: &str = "WARMC_DAEMON";
pub const ENV_DAEMON_SOCKET: &str = "WARMC_DAEMON_SOCKET";
pub const ENV_JVM_COMPILER: &str = "WARMC_JVM_COMPILER";
pub const ENV_JS_COMPILER: &str = "WARMC_JS_COMPILER";

/// Process-wide switch deciding whether the daemon is tried at all.
///
/// Loaded once at startup and only read afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DaemonSwitch(bool);

impl DaemonSwitch {
    pub const ENABLED: DaemonSwitch = DaemonSwitch(true);
    pub const DISABLED: DaemonSwitch = DaemonSwitch(false);

    pub fn new(enabled: bool) -> Self {
        DaemonSwitch(enabled)
    }

    pub fn is_enabled(self) -> bool {
        self.0
    }
}

/// Complete client configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmcConfig {
    pub daemon_enabled: bool,
    pub socket_path: Option<PathBuf>,
    pub jvm_compiler: Option<String>,
    pub js_compiler: Option<String>,
}

impl WarmcConfig {
    /// Load from `~/.warmcrc`, then apply the process environment
    pub fn load() -> Self {
        let mut config = Self::from_file(&Self::rc_path()).unwrap_or_default();
        config.apply_env(utf8_vars(std::env::vars_os()));
        config
    }

    /// Get the path to .warmcrc
    pub fn rc_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".warmcrc")
    }

    /// Parse configuration from a specific file
    pub fn from_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        Some(Self::parse(&content))
    }

    /// Parse configuration from content string
    pub fn parse(content: &str) -> Self {
        let mut config = WarmcConfig::default();

        for line in content.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);

            if let Some((key, value)) = parse_assignment(line) {
                config.set(&key, unquote(&value));
            }
        }

        config
    }

    /// Override settings from environment variables
    pub fn apply_env<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            self.set(&key, value);
        }
    }

    fn set(&mut self, key: &str, value: String) {
        match key {
            ENV_DAEMON => match parse_bool(&value) {
                Some(enabled) => self.daemon_enabled = enabled,
                None => warn!(key, value = %value, "ignoring invalid boolean setting"),
            },
            ENV_DAEMON_SOCKET if !value.is_empty() => {
                self.socket_path = Some(PathBuf::from(value));
            }
            ENV_JVM_COMPILER if !value.is_empty() => self.jvm_compiler = Some(value),
            ENV_JS_COMPILER if !value.is_empty() => self.js_compiler = Some(value),
            _ => {}
        }
    }

    pub fn daemon_switch(&self) -> DaemonSwitch {
        DaemonSwitch::new(self.daemon_enabled)
    }

    /// Socket path, falling back to `~/.warmc/daemon.sock`
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| daemon_dir().join("daemon.sock"))
    }

    /// Compiler executable configured for a target
    pub fn compiler_program(&self, kind: CompilerKind) -> Option<&str> {
        match kind {
            CompilerKind::Jvm => self.jvm_compiler.as_deref(),
            CompilerKind::Js => self.js_compiler.as_deref(),
        }
    }
}

/// Directory holding the daemon's socket and pid file
pub fn daemon_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".warmc")
}

/// Environment entries that are valid UTF-8; anything else cannot be a setting
fn utf8_vars<I>(vars: I) -> impl Iterator<Item = (String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Parse a shell variable assignment (KEY=value or KEY="value")
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim().to_string();
    let value = line[eq_pos + 1..].trim().to_string();

    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }

    Some((key, value))
}

/// Remove surrounding quotes from a value
fn unquote(s: &str) -> String {
    let s = s.trim();

    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        return s[1..s.len() - 1].to_string();
    }

    s.to_string()
}
