use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::config::HelperConfig;

pub const LOG_FILE: &str = "node-test-helper.log";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LogConfig {
    pub(crate) log_level: String,
    pub(crate) log_dir: Option<PathBuf>,
}

impl LogConfig {
    pub fn new(log_level: impl Into<String>, log_dir: Option<PathBuf>) -> Self {
        Self {
            log_level: log_level.into(),
            log_dir,
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new("warn", None)
    }
}

impl From<&HelperConfig> for LogConfig {
    fn from(config: &HelperConfig) -> Self {
        Self::new(config.log_level.clone(), config.log_dir.clone())
    }
}

/// Installs the global subscriber: an `EnvFilter`, a test-friendly fmt layer
/// and, with a log directory, a daily rolling plain-text file.
///
/// Returns `Ok(false)` when a subscriber was already installed.
pub fn init_tracing(config: &LogConfig) -> Result<bool> {
    // RUST_LOG wins over the configured level
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .with_context(|| format!("invalid log level `{}`", config.log_level))?;

    let file_layer = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log dir {}", dir.display()))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE);
            Some(fmt::layer().with_writer(appender).with_ansi(false))
        }
        None => None,
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_test_writer())
        .with(file_layer)
        .try_init()
        .is_ok();
    Ok(installed)
}
