use std::env;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub quality_sample_interval_ms: u64,
    pub quality_window_size: usize,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_jitter_ms: u64,
    pub negotiation_timeout_ms: u64,
    pub recording_storage_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            quality_sample_interval_ms: 2_000,
            quality_window_size: 10,
            reconnect_max_attempts: 5,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 16_000,
            reconnect_jitter_ms: 250,
            negotiation_timeout_ms: 30_000,
            recording_storage_dir: "./recordings".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            quality_sample_interval_ms: parse_var(
                "VIDEO_QUALITY_SAMPLE_INTERVAL_MS",
                defaults.quality_sample_interval_ms,
            ),
            quality_window_size: parse_var("VIDEO_QUALITY_WINDOW_SIZE", defaults.quality_window_size),
            reconnect_max_attempts: parse_var(
                "VIDEO_RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect_max_attempts,
            ),
            reconnect_base_delay_ms: parse_var(
                "VIDEO_RECONNECT_BASE_DELAY_MS",
                defaults.reconnect_base_delay_ms,
            ),
            reconnect_max_delay_ms: parse_var(
                "VIDEO_RECONNECT_MAX_DELAY_MS",
                defaults.reconnect_max_delay_ms,
            ),
            reconnect_jitter_ms: parse_var("VIDEO_RECONNECT_JITTER_MS", defaults.reconnect_jitter_ms),
            negotiation_timeout_ms: parse_var(
                "VIDEO_NEGOTIATION_TIMEOUT_MS",
                defaults.negotiation_timeout_ms,
            ),
            recording_storage_dir: env::var("VIDEO_RECORDING_DIR")
                .unwrap_or_else(|_| {
                    warn!("VIDEO_RECORDING_DIR not set, using default");
                    defaults.recording_storage_dir.clone()
                }),
        };

        if !config.is_configured() {
            warn!("Video session configuration has zero-valued timings - check environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        self.quality_sample_interval_ms > 0
            && self.quality_window_size > 0
            && self.reconnect_base_delay_ms > 0
            && self.negotiation_timeout_ms > 0
    }

    pub fn is_recording_storage_configured(&self) -> bool {
        !self.recording_storage_dir.is_empty()
    }
}

fn parse_var<T>(key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using default {}", key, raw, default);
            default
        }),
        Err(_) => {
            warn!("{} not set, using default {}", key, default);
            default
        }
    }
}
