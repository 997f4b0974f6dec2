//! User configuration settings
//!
//! Layered configuration: defaults → config file → environment variables

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Error, Result};
use crate::queue::default_parallelism;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Git executable (bare name resolved through PATH)
    pub git_path: PathBuf,

    /// Read-lane parallelism ceiling (0 = derive from CPU count)
    pub max_parallel: usize,

    /// Run commands on pooled worker hosts when they are ready
    pub use_worker_pool: bool,

    /// Always run commands in-process, ignoring the pool
    pub force_in_process: bool,

    /// Worker host command line (empty = re-run this executable as `worker`)
    pub worker_command: Vec<String>,

    /// Spawn time after which a worker reports itself sick (0 = never)
    pub sick_spawn_threshold_ms: u64,

    /// Count notable subcommands in the usage stats file
    pub record_usage: bool,

    /// Enable debug logging
    pub debug: bool,

    /// Log file path (if set, logs to file instead of stderr)
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            git_path: PathBuf::from("git"),
            max_parallel: 0,
            use_worker_pool: true,
            force_in_process: false,
            worker_command: Vec::new(),
            sick_spawn_threshold_ms: 1000,
            record_usage: true,
            debug: false,
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from all sources
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file_path()?)
    }

    /// Load configuration with `config_path` as the file layer
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            // GD_MAX_PARALLEL, GD_USE_WORKER_POOL, ...
            .merge(Env::prefixed("GD_"))
            .extract()
            .map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.git_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "git_path".to_string(),
                reason: "must not be empty".to_string(),
            }
            .into());
        }
        if self.worker_command.first().is_some_and(|program| program.is_empty()) {
            return Err(ConfigError::InvalidValue {
                key: "worker_command".to_string(),
                reason: "program must not be empty".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Effective read-lane ceiling
    pub fn parallelism(&self) -> usize {
        if self.max_parallel == 0 {
            default_parallelism()
        } else {
            self.max_parallel
        }
    }

    /// Get the configuration file path
    pub fn config_file_path() -> Result<PathBuf> {
        let dirs = Self::project_dirs()?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Get the data directory path
    pub fn data_dir() -> Result<PathBuf> {
        let dirs = Self::project_dirs()?;
        Ok(dirs.data_dir().to_path_buf())
    }

    /// Get the usage stats file path
    pub fn usage_file_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("usage.json"))
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        let dirs = Self::project_dirs()?;

        for dir in [dirs.config_dir(), dirs.data_dir()] {
            std::fs::create_dir_all(dir)
                .map_err(|_| Error::Config(ConfigError::DirectoryCreationFailed(dir.to_path_buf())))?;
        }

        // Seed a default config file if none exists so users can discover it
        let config_path = Self::config_file_path()?;
        if !config_path.exists() {
            let _ = Config::default().save();
        }

        Ok(())
    }

    /// Save current configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path()?)
    }

    /// Save current configuration to `config_path`
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|_| Error::Config(ConfigError::DirectoryCreationFailed(parent.to_path_buf())))?;
        }

        let toml = toml::to_string_pretty(self).map_err(|e| ConfigError::SaveFailed(e.to_string()))?;

        std::fs::write(config_path, toml).map_err(|e| ConfigError::SaveFailed(e.to_string()))?;

        Ok(())
    }

    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("com", "git-dispatch", "git-dispatch").ok_or_else(|| {
            Error::Config(ConfigError::LoadFailed(
                "Could not determine home directory".to_string(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.git_path, PathBuf::from("git"));
        assert!(config.use_worker_pool);
        assert!(!config.force_in_process);
        assert_eq!(config.sick_spawn_threshold_ms, 1000);
        assert!(config.parallelism() >= 1);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("use_worker_pool = true"));
        assert!(toml.contains("sick_spawn_threshold_ms"));
    }

    #[test]
    fn test_file_and_env_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                    max_parallel = 3
                    force_in_process = true
                    worker_command = ["/usr/local/bin/gd-worker", "worker"]
                "#,
            )?;
            jail.set_env("GD_MAX_PARALLEL", "6");

            let config = Config::load_from(Path::new("config.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.max_parallel, 6);
            assert_eq!(config.parallelism(), 6);
            assert!(config.force_in_process);
            assert_eq!(config.worker_command, vec!["/usr/local/bin/gd-worker", "worker"]);
            assert!(config.record_usage);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        Jail::expect_with(|_jail| {
            let config = Config::load_from(Path::new("absent.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config, Config::default());
            Ok(())
        });
    }

    #[test]
    fn test_invalid_value_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", r#"git_path = """#)?;
            let err = Config::load_from(Path::new("config.toml")).unwrap_err();
            assert!(matches!(
                err,
                Error::Config(ConfigError::InvalidValue { ref key, .. }) if key == "git_path"
            ));
            Ok(())
        });
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config {
            max_parallel: 2,
            use_worker_pool: false,
            ..Config::default()
        };

        config.save_to(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let loaded: Config = toml::from_str(&text).unwrap();
        assert_eq!(loaded, config);
    }
}
