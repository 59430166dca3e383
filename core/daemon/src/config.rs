use serde::Deserialize;
use std::path::PathBuf;

const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".tabwatch/daemon/config.toml";

/// Runtime tuning knobs. Everything has a default; a missing file is not an
/// error, a malformed file is.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub runtime: TickConfig,
    #[serde(default)]
    pub badge: BadgeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Quiet time after the request counter hits zero before the final
    /// status commits.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: i64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TickConfig {
    /// Interval of the settle pump thread.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BadgeConfig {
    /// Turn the completion counter badge off entirely.
    #[serde(default = "default_badge_enabled")]
    pub enabled: bool,
}

impl Default for BadgeConfig {
    fn default() -> Self {
        Self {
            enabled: default_badge_enabled(),
        }
    }
}

fn default_settle_ms() -> i64 {
    600
}

fn default_badge_enabled() -> bool {
    true
}

fn default_tick_ms() -> u64 {
    200
}

pub fn default_config_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

pub fn load_runtime_config(path: Option<PathBuf>) -> Result<RuntimeConfig, String> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(RuntimeConfig::default());
    }

    let content = fs_err::read_to_string(&config_path)
        .map_err(|err| format!("Failed to read config {}: {}", config_path.display(), err))?;
    toml::from_str::<RuntimeConfig>(&content)
        .map_err(|err| format!("Failed to parse config {}: {}", config_path.display(), err))
}
