//! Runtime configuration
//!
//! Sources, lowest priority first:
//! 1. Built-in defaults
//! 2. Config file (`--config` or `SANDSCRIPT_CONFIG_PATH`), TOML or JSON by extension
//! 3. `SANDSCRIPT_*` environment variables
//! 4. Explicit builder overrides

use std::path::PathBuf;

use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

pub const ENV_PREFIX: &str = "SANDSCRIPT";
pub const CONFIG_PATH_ENV: &str = "SANDSCRIPT_CONFIG_PATH";
pub const DEFAULT_CACHE_DIRECTORY: &str = ".sandscript";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Compiled artifacts live in `<cache_directory>/sbs/`
    pub cache_directory: PathBuf,
    /// Undefined variables and missing keys fail the script
    pub strict_variables: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cache_directory: PathBuf::from(DEFAULT_CACHE_DIRECTORY),
            strict_variables: true,
        }
    }
}

impl RuntimeConfig {
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Load from the default sources with no overrides
    pub fn load() -> Result<Self, ConfigError> {
        Self::builder().build()
    }
}

#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config_path: Option<PathBuf>,
    cache_directory: Option<PathBuf>,
    strict_variables: Option<bool>,
}

impl RuntimeConfigBuilder {
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn cache_directory(mut self, dir: Option<PathBuf>) -> Self {
        self.cache_directory = dir;
        self
    }

    pub fn strict_variables(mut self, strict: Option<bool>) -> Self {
        self.strict_variables = strict;
        self
    }

    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        let defaults = RuntimeConfig::default();

        let mut builder = config::Config::builder()
            .set_default(
                "cache_directory",
                defaults.cache_directory.to_string_lossy().to_string(),
            )?
            .set_default("strict_variables", defaults.strict_variables)?;

        let config_path = self
            .config_path
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));
        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        if let Some(dir) = self.cache_directory {
            builder = builder.set_override("cache_directory", dir.to_string_lossy().to_string())?;
        }
        if let Some(strict) = self.strict_variables {
            builder = builder.set_override("strict_variables", strict)?;
        }

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();

        assert_eq!(config.cache_directory, PathBuf::from(".sandscript"));
        assert!(config.strict_variables);
    }

    #[test]
    fn test_file_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandscript.toml");
        std::fs::write(&path, "cache_directory = \"/tmp/from-file\"\nstrict_variables = false\n")
            .unwrap();

        let config = RuntimeConfig::builder()
            .config_path(Some(path.clone()))
            .build()
            .unwrap();
        assert_eq!(config.cache_directory, PathBuf::from("/tmp/from-file"));
        assert!(!config.strict_variables);

        let config = RuntimeConfig::builder()
            .config_path(Some(path))
            .cache_directory(Some(PathBuf::from("/tmp/override")))
            .strict_variables(Some(true))
            .build()
            .unwrap();
        assert_eq!(config.cache_directory, PathBuf::from("/tmp/override"));
        assert!(config.strict_variables);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let result = RuntimeConfig::builder()
            .config_path(Some(PathBuf::from("/nonexistent/sandscript.toml")))
            .build();

        assert!(result.is_err());
    }
}
