use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::recognition::BackendPreference;
use crate::session::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
    #[serde(default)]
    pub round: RoundConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingConfig {
    #[serde(default = "default_success_threshold")]
    pub success_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechConfig {
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default)]
    pub backend: BackendPreference,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    #[serde(default = "default_vosk_model_path")]
    pub vosk_model_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundConfig {
    #[serde(default = "default_start_distance")]
    pub start_distance: f32,
    /// Distance covered per tick while running.
    #[serde(default = "default_approach_speed")]
    pub approach_speed: f32,
    /// A closed gate bounces the runner at or below this distance.
    #[serde(default = "default_near_threshold")]
    pub near_threshold: f32,
    /// An opening gate is passed at or below this distance.
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f32,
    #[serde(default = "default_bounce_ticks")]
    pub bounce_ticks: u32,
    #[serde(default = "default_rebound_distance")]
    pub rebound_distance: f32,
    /// Fraction of the remaining gap to the rebound distance closed per
    /// bounce tick.
    #[serde(default = "default_rebound_rate")]
    pub rebound_rate: f32,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_success_threshold() -> f64 { crate::matching::SUCCESS_THRESHOLD }

fn default_locale() -> String { "tr-TR".to_string() }
fn default_debounce_ms() -> u64 { 500 }
fn default_max_transient_retries() -> u32 { 3 }
fn default_retry_backoff_ms() -> u64 { 250 }
fn default_retry_backoff_max_ms() -> u64 { 4000 }
fn default_vosk_model_path() -> String { "~/.local/share/vosk/model".to_string() }

fn default_start_distance() -> f32 { 100.0 }
fn default_approach_speed() -> f32 { 0.5 }
fn default_near_threshold() -> f32 { 10.0 }
fn default_pass_threshold() -> f32 { 0.0 }
fn default_bounce_ticks() -> u32 { 30 }
fn default_rebound_distance() -> f32 { 40.0 }
fn default_rebound_rate() -> f32 { 0.15 }
fn default_tick_interval_ms() -> u64 { 16 }

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            success_threshold: default_success_threshold(),
        }
    }
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            locale: default_locale(),
            backend: BackendPreference::default(),
            debounce_ms: default_debounce_ms(),
            max_transient_retries: default_max_transient_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            vosk_model_path: default_vosk_model_path(),
        }
    }
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            start_distance: default_start_distance(),
            approach_speed: default_approach_speed(),
            near_threshold: default_near_threshold(),
            pass_threshold: default_pass_threshold(),
            bounce_ticks: default_bounce_ticks(),
            rebound_distance: default_rebound_distance(),
            rebound_rate: default_rebound_rate(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl SpeechConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_transient_retries: self.max_transient_retries,
            base_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_backoff_max_ms.max(self.retry_backoff_ms)),
        }
    }

    /// Model path with `~` and environment variables expanded.
    pub fn vosk_model_path(&self) -> PathBuf {
        if let Ok(path) = std::env::var("VOSK_MODEL_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(shellexpand::full(&self.vosk_model_path)
            .map(|p| p.into_owned())
            .unwrap_or_else(|_| self.vosk_model_path.clone()))
    }
}

impl RoundConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// `$XDG_CONFIG_HOME/word-practice/config.toml`, if a config dir exists.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("word-practice").join("config.toml"))
}

pub fn load_config() -> EngineConfig {
    match config_path() {
        Some(path) => load_config_from(&path),
        None => {
            warn!("Could not determine config directory, using default config");
            EngineConfig::default()
        }
    }
}

pub fn load_config_from(path: &Path) -> EngineConfig {
    let config_str = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => {
            warn!("Could not read config file at {}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&config_str) {
        Ok(config) => {
            info!("Loaded engine config from {}", path.display());
            config
        }
        Err(e) => {
            warn!("Failed to parse config: {}, using defaults", e);
            EngineConfig::default()
        }
    }
}
