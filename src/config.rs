//! Configuration for the reverb capture/replay core
//!
//! Supports YAML and TOML configuration files with validation. All tunables
//! are also plain struct fields so embedders can construct configuration in
//! code; there is no global configuration state.

use crate::error::{Result, ReverbError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReverbConfig {
    /// Accumulation settings (connection expiration)
    #[serde(default)]
    pub accumulation: AccumulationConfig,

    /// Replay scheduling and target connection settings
    #[serde(default)]
    pub replay: ReplaySettings,
}

impl Default for ReverbConfig {
    fn default() -> Self {
        Self {
            accumulation: AccumulationConfig::default(),
            replay: ReplaySettings::default(),
        }
    }
}

/// Settings for the traffic-to-transaction accumulator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccumulationConfig {
    /// Maximum idle duration before a connection's accumulation is evicted
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,

    /// Bucket width for the expiration sweep
    #[serde(default = "default_granularity", with = "humantime_serde")]
    pub granularity: Duration,
}

impl Default for AccumulationConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            granularity: default_granularity(),
        }
    }
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

fn default_granularity() -> Duration {
    Duration::from_secs(1)
}

/// Settings for replay scheduling and target connections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplaySettings {
    /// Replay speed multiplier (1.0 = original pacing, 2.0 = twice as fast)
    #[serde(default = "default_speed_multiplier")]
    pub speed_multiplier: f64,

    /// Timeout for a single request attempt against the target
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Delay between packets of one request when the capture carries no gap
    #[serde(default = "default_inter_packet_delay", with = "humantime_serde")]
    pub inter_packet_delay: Duration,

    /// Maximum send attempts per request (1 = no retries)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential retry backoff
    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Upper bound for retry backoff
    #[serde(default = "default_backoff_max", with = "humantime_serde")]
    pub backoff_max: Duration,

    /// Maximum concurrent target sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            speed_multiplier: default_speed_multiplier(),
            request_timeout: default_request_timeout(),
            inter_packet_delay: default_inter_packet_delay(),
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            max_sessions: default_max_sessions(),
        }
    }
}

fn default_speed_multiplier() -> f64 {
    1.0
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_inter_packet_delay() -> Duration {
    Duration::ZERO
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(100)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(5)
}

fn default_max_sessions() -> usize {
    1024
}

/// Load configuration from a file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ReverbConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| ReverbError::Config(format!("Failed to read config file {:?}: {}", path, e)))?;

    let config = parse_config(&content, path)?;
    validate_config(&config)?;

    info!("Configuration loaded successfully from {:?}", path);
    Ok(config)
}

/// Parse configuration from string content
fn parse_config(content: &str, path: &Path) -> Result<ReverbConfig> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("yaml");

    match extension {
        "yaml" | "yml" => serde_yaml::from_str(content).map_err(|e| e.into()),
        "toml" => toml::from_str(content).map_err(|e| e.into()),
        _ => Err(ReverbError::Config(format!(
            "Unsupported config format: {}",
            extension
        ))),
    }
}

/// Validate a configuration
pub fn validate_config(config: &ReverbConfig) -> Result<()> {
    if config.accumulation.window.is_zero() {
        return Err(ReverbError::ConfigValidation(
            "accumulation.window must be greater than zero".to_string(),
        ));
    }

    if config.accumulation.granularity.is_zero() {
        return Err(ReverbError::ConfigValidation(
            "accumulation.granularity must be greater than zero".to_string(),
        ));
    }

    if config.accumulation.granularity > config.accumulation.window {
        return Err(ReverbError::ConfigValidation(format!(
            "accumulation.granularity ({:?}) must not exceed accumulation.window ({:?})",
            config.accumulation.granularity, config.accumulation.window
        )));
    }

    if config.replay.speed_multiplier <= 0.0 || !config.replay.speed_multiplier.is_finite() {
        return Err(ReverbError::ConfigValidation(format!(
            "replay.speed_multiplier must be a positive finite number, got {}",
            config.replay.speed_multiplier
        )));
    }

    if config.replay.max_attempts == 0 {
        return Err(ReverbError::ConfigValidation(
            "replay.max_attempts must be at least 1".to_string(),
        ));
    }

    if config.replay.max_sessions == 0 {
        return Err(ReverbError::ConfigValidation(
            "replay.max_sessions must be at least 1".to_string(),
        ));
    }

    Ok(())
}
