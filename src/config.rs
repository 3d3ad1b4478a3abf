use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::core::copy::CopyOptions;
use crate::core::hasher::DEFAULT_BUFFER_SIZE;
use crate::core::offload::{DEFAULT_MAX_CONCURRENT, OffloadOptions};
use crate::core::verifier::VerifyOptions;
use crate::error::{Error, Result};
use crate::history::DEFAULT_HISTORY_LIMIT;

const APP_DIR: &str = "tandem";
const ENV_PREFIX: &str = "TANDEM_";
const CONFIG_ENV: &str = "TANDEM_CONFIG";
const MIN_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Copy jobs in flight at once, across all destinations
    pub max_concurrent_copies: usize,
    pub buffer_size: usize,
    /// fsync every destination file before reporting it copied
    pub sync_files: bool,
    /// Re-read each destination against its fresh manifest after an offload
    pub verify_after_copy: bool,
    /// Delete partial files left by failed or cancelled copies
    pub remove_partial_files: bool,
    pub history_path: PathBuf,
    pub history_limit: usize,
    pub manifest_prefix: String,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_concurrent_copies: DEFAULT_MAX_CONCURRENT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            sync_files: true,
            verify_after_copy: false,
            remove_partial_files: false,
            history_path: default_history_path(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            manifest_prefix: APP_DIR.to_string(),
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Load defaults, then the config file, then `TANDEM_*` environment
    /// variables, then whatever the CLI set.
    pub fn new<T: Serialize>(cli: Option<&T>) -> Result<Self> {
        Self::load_from(&config_file_path(), cli)
    }

    pub fn load_from<T: Serialize>(config_file: &Path, cli: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(config_file))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]));

        if let Some(cli) = cli {
            figment = figment.merge(Serialized::defaults(cli));
        }

        let config: AppConfig = figment
            .extract()
            .map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_copies == 0 {
            return Err(Error::Configuration(
                "max_concurrent_copies must be at least 1".into(),
            ));
        }
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(Error::Configuration(format!(
                "buffer_size must be at least {} bytes",
                MIN_BUFFER_SIZE
            )));
        }
        if self.history_limit == 0 {
            return Err(Error::Configuration(
                "history_limit must be at least 1".into(),
            ));
        }
        if self.manifest_prefix.is_empty() || self.manifest_prefix.contains(['/', '\\']) {
            return Err(Error::Configuration(format!(
                "invalid manifest_prefix {:?}",
                self.manifest_prefix
            )));
        }
        Ok(())
    }

    pub fn offload_options(&self) -> OffloadOptions {
        OffloadOptions {
            max_concurrent: self.max_concurrent_copies,
            copy: CopyOptions {
                buffer_size: self.buffer_size,
                sync_files: self.sync_files,
            },
            manifest_prefix: self.manifest_prefix.clone(),
            remove_partial_files: self.remove_partial_files,
        }
    }

    pub fn verify_options(&self) -> VerifyOptions {
        VerifyOptions {
            max_concurrent: self.max_concurrent_copies,
            buffer_size: self.buffer_size,
        }
    }

    /// The effective configuration as a TOML document
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Configuration(e.to_string()))
    }
}

/// `$TANDEM_CONFIG`, or `config.toml` in the per-user config directory.
pub fn config_file_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("config.toml")
}

fn default_history_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("history.json")
}
