//! Client tuning loaded via OrthoConfig.
//!
//! Every value is optional; accessors fall back to the defaults below.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;

const DEFAULT_TICK_INTERVAL_MS: u64 = 3_000;
const DEFAULT_REFRESH_INTERVAL_MS: u64 = 10_000;
const DEFAULT_ROOM_REFRESH_DEBOUNCE_MS: u64 = 500;
const DEFAULT_DRIFT_SCALE: f64 = 0.01;
const DEFAULT_MESSAGE_RETENTION_SECS: u64 = 300;
const DEFAULT_MESSAGE_CLEANUP_INTERVAL_SECS: u64 = 300;
const DEFAULT_MESSAGE_PURGE_AGE_SECS: u64 = 3_600;
const DEFAULT_FRIENDSHIP_GLOW_MS: u64 = 5_000;
const DEFAULT_ROOM_CAPACITY: u32 = 10;

/// Timing and sizing knobs for one client.
#[derive(Debug, Clone, Default, Deserialize, OrthoConfig)]
#[ortho_config(prefix = "STARFIELD")]
pub struct ClientSettings {
    /// Period of the local drift tick.
    pub tick_interval_ms: Option<u64>,
    /// Period of the full participant and room refresh.
    pub refresh_interval_ms: Option<u64>,
    /// Delay before refreshing rooms after a membership push.
    pub room_refresh_debounce_ms: Option<u64>,
    /// Width of the range drift components are drawn from.
    pub drift_scale: Option<f64>,
    /// Pushed messages older than this are ignored.
    pub message_retention_secs: Option<u64>,
    /// Period of the public message purge.
    pub message_cleanup_interval_secs: Option<u64>,
    /// Public messages older than this are purged.
    pub message_purge_age_secs: Option<u64>,
    /// Lifetime of a friendship glow.
    pub friendship_glow_ms: Option<u64>,
    /// Capacity used when a room is created without one.
    pub default_room_capacity: Option<u32>,
}

impl ClientSettings {
    pub fn tick_interval(&self) -> Duration {
        millis(self.tick_interval_ms, DEFAULT_TICK_INTERVAL_MS)
    }

    pub fn refresh_interval(&self) -> Duration {
        millis(self.refresh_interval_ms, DEFAULT_REFRESH_INTERVAL_MS)
    }

    pub fn room_refresh_debounce(&self) -> Duration {
        millis(self.room_refresh_debounce_ms, DEFAULT_ROOM_REFRESH_DEBOUNCE_MS)
    }

    /// Drift scale, clamped to a non-negative finite value.
    pub fn drift_scale(&self) -> f64 {
        self.drift_scale
            .filter(|scale| scale.is_finite() && *scale >= 0.0)
            .unwrap_or(DEFAULT_DRIFT_SCALE)
    }

    pub fn message_retention(&self) -> Duration {
        secs(self.message_retention_secs, DEFAULT_MESSAGE_RETENTION_SECS)
    }

    pub fn message_cleanup_interval(&self) -> Duration {
        secs(
            self.message_cleanup_interval_secs,
            DEFAULT_MESSAGE_CLEANUP_INTERVAL_SECS,
        )
    }

    pub fn message_purge_age(&self) -> Duration {
        secs(self.message_purge_age_secs, DEFAULT_MESSAGE_PURGE_AGE_SECS)
    }

    pub fn friendship_glow(&self) -> Duration {
        millis(self.friendship_glow_ms, DEFAULT_FRIENDSHIP_GLOW_MS)
    }

    pub fn default_room_capacity(&self) -> u32 {
        self.default_room_capacity
            .filter(|capacity| *capacity > 0)
            .unwrap_or(DEFAULT_ROOM_CAPACITY)
    }
}

// Zero periods would make `tokio::time::interval` panic.
fn millis(value: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(value.filter(|v| *v > 0).unwrap_or(default))
}

fn secs(value: Option<u64>, default: u64) -> Duration {
    Duration::from_secs(value.filter(|v| *v > 0).unwrap_or(default))
}
