use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fmt};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const RUNTIME_KEY: &str = "NODE_TEST_RUNTIME";
pub const ADDRESS_KEY: &str = "NODE_TEST_ADDRESS";
pub const PORT_KEY: &str = "NODE_TEST_PORT";
pub const SHUTDOWN_GRACE_KEY: &str = "NODE_TEST_SHUTDOWN_GRACE_MS";
pub const LOG_KEY: &str = "NODE_TEST_LOG";
pub const LOG_DIR_KEY: &str = "NODE_TEST_LOG_DIR";

pub trait ConfigManagerType: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn get(&self, key: &str) -> Option<String> {
        self.0.get(key)
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, optionally primed from a `.env` file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: Option<PathBuf>,
}

impl EnvConfigManager {
    /// Loads `.env` from the working directory (or its parents) when present.
    pub fn new() -> Box<Self> {
        let env_file = dotenvy::dotenv().ok();
        if let Some(path) = &env_file {
            info!("Loaded .env from {}", path.display());
        }
        Box::new(Self { env_file })
    }

    pub fn from_path(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(&env_file).ok();
            info!("Loaded .env from {}", env_file.display());
        } else {
            warn!("could not load .env from {}", env_file.display())
        }
        Box::new(Self {
            env_file: Some(env_file),
        })
    }
}

impl ConfigManagerType for EnvConfigManager {
    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        match &self.env_file {
            Some(path) => format!("EnvConfigManager({})", path.display()),
            None => "EnvConfigManager".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            map: DashMap::new(),
        })
    }

    pub fn with(self: Box<Self>, key: &str, value: &str) -> Box<Self> {
        self.map.insert(key.to_string(), value.to_string());
        self
    }
}

impl ConfigManagerType for MapConfigManager {
    fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Harness settings resolved from a [`ConfigManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperConfig {
    /// Runtime provider name or path hint.
    pub runtime: Option<String>,
    pub address: IpAddr,
    pub port: u16,
    pub shutdown_grace: Duration,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            address: IpAddr::from([127, 0, 0, 1]),
            port: 0,
            shutdown_grace: Duration::ZERO,
            log_level: "warn".to_string(),
            log_dir: None,
        }
    }
}

impl HelperConfig {
    /// Missing keys keep their defaults; unparsable values are reported and ignored.
    pub fn load(config: &ConfigManager) -> Self {
        let mut loaded = Self::default();
        let text = |key: &str| {
            config
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        loaded.runtime = text(RUNTIME_KEY);
        if let Some(address) = text(ADDRESS_KEY) {
            match parse::<IpAddr>(ADDRESS_KEY, &address) {
                Ok(address) => loaded.address = address,
                Err(err) => warn!("{err:#}, using {}", loaded.address),
            }
        }
        if let Some(port) = text(PORT_KEY) {
            match parse::<u16>(PORT_KEY, &port) {
                Ok(port) => loaded.port = port,
                Err(err) => warn!("{err:#}, using {}", loaded.port),
            }
        }
        if let Some(grace) = text(SHUTDOWN_GRACE_KEY) {
            match parse::<u64>(SHUTDOWN_GRACE_KEY, &grace) {
                Ok(ms) => loaded.shutdown_grace = Duration::from_millis(ms),
                Err(err) => warn!("{err:#}, using no grace period"),
            }
        }
        if let Some(level) = text(LOG_KEY) {
            loaded.log_level = level;
        }
        loaded.log_dir = text(LOG_DIR_KEY).map(PathBuf::from);
        loaded
    }

    pub fn from_env() -> Self {
        Self::load(&ConfigManager(EnvConfigManager::new()))
    }
}

fn parse<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    use anyhow::Context;
    value
        .parse::<T>()
        .with_context(|| format!("invalid {key} value `{value}`"))
}
