use crate::verdict::DEFAULT_SENTINEL;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "ptywatch.toml";

/// Top-level configuration loaded from ptywatch.toml.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub command: CommandConfig,
    pub watchdog: WatchdogConfig,
    pub verdict: VerdictConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CommandConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Run the child in its own process group so a timeout kill also takes
    /// down anything it spawned.
    ///
    /// The group is a background group of the controlling terminal while
    /// stdin is still inherited. A child that reads from an interactive
    /// stdin gets SIGTTIN and stops until the watchdog kills it. Set this to
    /// false for such commands; the kill then reaches only the direct child.
    pub process_group: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VerdictConfig {
    pub sentinel: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Bytes requested per read on each pty.
    pub read_chunk: usize,
}

// --- Default implementations ---

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            program: "pros".to_string(),
            args: vec!["t".to_string()],
            process_group: true,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 10,
        }
    }
}

impl Default for VerdictConfig {
    fn default() -> Self {
        Self {
            sentinel: DEFAULT_SENTINEL.to_string(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { read_chunk: 1000 }
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(reason) => write!(f, "invalid config: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl Config {
    /// Parse a config file.
    ///
    /// When `required` is false a missing file yields the defaults; any
    /// other read error, or a missing file when `required` is true, fails.
    pub fn load(path: &Path, required: bool) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::parse(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.program.trim().is_empty() {
            return Err(ConfigError::Invalid("command.program is empty".to_string()));
        }
        if self.watchdog.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "watchdog.idle_timeout_secs must be positive".to_string(),
            ));
        }
        if self.verdict.sentinel.is_empty() {
            return Err(ConfigError::Invalid("verdict.sentinel is empty".to_string()));
        }
        if self.stream.read_chunk == 0 {
            return Err(ConfigError::Invalid(
                "stream.read_chunk must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog.idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.command.program, "pros");
        assert_eq!(config.command.args, vec!["t"]);
        assert!(config.command.process_group);
        assert_eq!(config.idle_timeout(), Duration::from_secs(10));
        assert_eq!(config.verdict.sentinel, "OK");
        assert_eq!(config.stream.read_chunk, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_file_keeps_other_defaults() {
        let config = Config::parse(
            r#"
            [command]
            program = "cargo"
            args = ["test", "--", "--nocapture"]

            [watchdog]
            idle_timeout_secs = 45
            "#,
        )
        .unwrap();
        assert_eq!(config.command.program, "cargo");
        assert_eq!(config.command.args, vec!["test", "--", "--nocapture"]);
        assert!(config.command.process_group);
        assert_eq!(config.watchdog.idle_timeout_secs, 45);
        assert_eq!(config.verdict.sentinel, "OK");
    }

    #[test]
    fn test_parse_empty_is_default() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.command.program, "pros");
    }

    #[test]
    fn test_parse_rejects_wrong_types() {
        assert!(Config::parse("[watchdog]\nidle_timeout_secs = \"ten\"\n").is_err());
    }

    #[test]
    fn test_load_missing_optional_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("ptywatch.toml"), false).unwrap();
        assert_eq!(config.watchdog.idle_timeout_secs, 10);
    }

    #[test]
    fn test_load_missing_required_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("custom.toml"), true).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("custom.toml"));
    }

    #[test]
    fn test_load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ptywatch.toml");
        std::fs::write(&path, "[verdict\nsentinel = 1").unwrap();
        let err = Config::load(&path, false).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("ptywatch.toml"));
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ptywatch.toml");
        std::fs::write(&path, "[verdict]\nsentinel = \"PASS\"\n").unwrap();
        let config = Config::load(&path, true).unwrap();
        assert_eq!(config.verdict.sentinel, "PASS");
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = Config::default();
        config.watchdog.idle_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_empty_program_and_sentinel() {
        let mut config = Config::default();
        config.command.program = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.verdict.sentinel.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.stream.read_chunk = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trips_through_toml_for_dry_run() {
        let rendered = toml::to_string_pretty(&Config::default()).unwrap();
        assert!(rendered.contains("idle_timeout_secs = 10"));
        assert!(rendered.contains("sentinel = \"OK\""));
    }
}
