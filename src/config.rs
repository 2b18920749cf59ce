use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pty::{SpawnCommand, WindowSize};
use crate::session::{SessionRegistry, SpawnMode};

/// Sub-mode argument passed to the embedded terminal UI.
pub const TUI_SUBCOMMAND: &str = "tui";

/// Console server settings, loaded from TOML.
///
/// Every field has a default, so an empty file (or no file) is valid.
/// Durations are written as seconds and may be fractional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsoleConfig {
    /// Address for the HTTP/WebSocket listener.
    pub bind: SocketAddr,
    /// Upper bound on concurrently registered sessions.
    pub max_sessions: usize,
    /// Close sessions that receive no input for this long. Zero disables.
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
    /// How often the reaper sweeps the registry.
    #[serde(with = "duration_secs")]
    pub reap_interval: Duration,
    /// Program spawned for `?mode=shell`.
    pub shell: PathBuf,
    pub shell_args: Vec<String>,
    /// Program spawned by default. Unset means this executable.
    pub tui_program: Option<PathBuf>,
    pub tui_args: Vec<String>,
    /// Initial terminal size.
    pub rows: u16,
    pub cols: u16,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        let size = WindowSize::default();
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8090)),
            max_sessions: 10,
            idle_timeout: Duration::from_secs(5 * 60),
            reap_interval: SessionRegistry::DEFAULT_REAP_INTERVAL,
            shell: PathBuf::from("/bin/bash"),
            shell_args: vec!["--login".to_string()],
            tui_program: None,
            tui_args: vec![TUI_SUBCOMMAND.to_string()],
            rows: size.rows,
            cols: size.cols,
        }
    }
}

impl ConsoleConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::ReadFailed {
                path: path.to_path_buf(),
                source,
            })?;
        let config: Self = toml::from_str(&contents)
            .map_err(|source| ConfigError::ParseFailed {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config at `path` if given, else the per-user default file if it
    /// exists, else built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => {
                tracing::debug!(path = %path.display(), "loading default console config");
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid("max_sessions must be at least 1".into()));
        }
        if self.rows == 0 || self.cols == 0 {
            return Err(ConfigError::Invalid(format!(
                "terminal size must be positive (rows={}, cols={})",
                self.rows, self.cols
            )));
        }
        if self.reap_interval.is_zero() {
            return Err(ConfigError::Invalid("reap_interval must be positive".into()));
        }
        Ok(())
    }

    /// Pin `tui_program` to the running executable when it was left unset.
    pub fn resolve_tui_program(&mut self) -> Result<(), ConfigError> {
        if self.tui_program.is_none() {
            let exe = std::env::current_exe().map_err(ConfigError::CurrentExe)?;
            self.tui_program = Some(exe);
        }
        Ok(())
    }

    pub fn window_size(&self) -> WindowSize {
        WindowSize::new(self.rows, self.cols)
    }

    /// The command a connection in `mode` runs.
    pub fn command_for(&self, mode: SpawnMode) -> SpawnCommand {
        match mode {
            SpawnMode::Shell => SpawnCommand::new(&self.shell, self.shell_args.iter().cloned()),
            SpawnMode::Tui => {
                let program = self
                    .tui_program
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(env!("CARGO_PKG_NAME")));
                SpawnCommand::new(program, self.tui_args.iter().cloned())
            }
        }
    }
}

/// `$XDG_CONFIG_HOME/wbconsole/console.toml` or the platform equivalent.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(env!("CARGO_PKG_NAME")).join("console.toml"))
}

/// Errors that can occur when loading config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", .path.display())]
    ParseFailed {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("cannot locate current executable: {0}")]
    CurrentExe(#[source] std::io::Error),
}

/// Serde helper: `Duration` as (fractional) seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
