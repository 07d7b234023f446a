use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What to do with accumulated pending messages once a gap is given up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GapFillStrategy {
    /// Skip only up to the unfillable gap; later gaps are still filled.
    #[default]
    Full,
    /// Skip every accumulated gap together with the unfillable one.
    Light,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("retry_wait_time must be non-zero when active gap filling is enabled")]
    ZeroRetryWait,
}

/// Ordering and gap fill settings for one dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderingConfig {
    /// When false, input is passed through in arrival order.
    pub ordering_enabled: bool,
    /// When false, gaps are only ever closed by real-time data or by force.
    pub gap_fill: bool,
    pub gap_fill_strategy: GapFillStrategy,
    /// Delay before the first resend; late real-time data may close the gap.
    #[serde(with = "humantime_serde")]
    pub initial_wait_time: Duration,
    /// Delay between resend attempts.
    #[serde(with = "humantime_serde")]
    pub retry_wait_time: Duration,
    /// Resend attempts per gap before forcing resolution.
    pub max_requests_per_gap: u32,
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self {
            ordering_enabled: true,
            gap_fill: true,
            gap_fill_strategy: GapFillStrategy::Full,
            initial_wait_time: Duration::from_secs(5),
            retry_wait_time: Duration::from_secs(5),
            max_requests_per_gap: 5,
        }
    }
}

/// Effective per-gap settings handed to each gap fill task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapFillerConfig {
    pub initial_wait_time: Duration,
    pub retry_wait_time: Duration,
    /// Zero means passive: storage is never queried.
    pub max_requests_per_gap: u32,
    pub strategy: GapFillStrategy,
}

impl OrderingConfig {
    /// Derives gap filler settings; disabling `gap_fill` forces passive mode.
    pub fn gap_filler_config(&self) -> GapFillerConfig {
        GapFillerConfig {
            initial_wait_time: self.initial_wait_time,
            retry_wait_time: self.retry_wait_time,
            max_requests_per_gap: if self.gap_fill {
                self.max_requests_per_gap
            } else {
                0
            },
            strategy: self.gap_fill_strategy,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let active = self.gap_fill && self.max_requests_per_gap > 1;
        if active && self.retry_wait_time.is_zero() {
            return Err(ConfigError::ZeroRetryWait);
        }
        Ok(())
    }
}
