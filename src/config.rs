use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "cmd-runner.toml";

/// Top-level configuration loaded from cmd-runner.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RunnerConfig {
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Wall-clock budget in seconds. Non-positive means the 3 second default.
    pub timeout_secs: i64,
    /// How long to wait for the group to exit and the pipes to close after SIGTERM.
    pub kill_grace_ms: u64,
    /// Follow up with SIGKILL if the direct child outlives the grace period.
    pub escalate: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3,
            kill_grace_ms: 200,
            escalate: true,
        }
    }
}

/// Errors that can occur while loading the config file.
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
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Load config from `path`. A missing file yields the defaults.
pub fn load(path: &Path) -> Result<RunnerConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(RunnerConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.supervisor.timeout_secs, 3);
        assert_eq!(config.supervisor.kill_grace_ms, 200);
        assert!(config.supervisor.escalate);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.supervisor.timeout_secs, 3);
    }

    #[test]
    fn test_partial_table_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "[supervisor]\ntimeout_secs = 10\n").unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.supervisor.timeout_secs, 10);
        assert_eq!(config.supervisor.kill_grace_ms, 200);
        assert!(config.supervisor.escalate);
    }

    #[test]
    fn test_full_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(
            &path,
            "[supervisor]\ntimeout_secs = -1\nkill_grace_ms = 50\nescalate = false\n",
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.supervisor.timeout_secs, -1);
        assert_eq!(config.supervisor.kill_grace_ms, 50);
        assert!(!config.supervisor.escalate);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "[supervisor\ntimeout_secs = ").unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn test_wrong_type_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "[supervisor]\ntimeout_secs = \"soon\"\n").unwrap();
        assert!(matches!(load(&path), Err(ConfigError::Parse { .. })));
    }
}
