use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{PresenceError, Result};
use crate::resolver::{Bounds, PositioningMode, RANGING_SCALE};

pub const DEFAULT_SERVICE_TYPE: &str = "bt-rocks";
pub const DEFAULT_INVITE_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Only peers advertising the same service type are discovered.
    pub service_type: String,
    pub invite_timeout_ms: u64,
    pub bounds: Bounds,
    pub ranging_scale: f64,
    pub mode: PositioningMode,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            invite_timeout_ms: DEFAULT_INVITE_TIMEOUT_MS,
            bounds: Bounds::default(),
            ranging_scale: RANGING_SCALE,
            mode: PositioningMode::default(),
        }
    }
}

impl PresenceConfig {
    pub fn invite_timeout(&self) -> Duration {
        Duration::from_millis(self.invite_timeout_ms)
    }

    pub fn with_invite_timeout(mut self, timeout: Duration) -> Self {
        self.invite_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_mode(mut self, mode: PositioningMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.service_type.is_empty() || self.service_type.len() > 15 {
            return Err(PresenceError::Config(format!(
                "service type must be 1-15 characters, got {:?}",
                self.service_type
            )));
        }
        if self.invite_timeout_ms == 0 {
            return Err(PresenceError::Config(
                "invite timeout must be positive".to_string(),
            ));
        }
        let valid_extent = |v: f64| v.is_finite() && v > 0.0;
        if !valid_extent(self.bounds.width) || !valid_extent(self.bounds.height) {
            return Err(PresenceError::Config(format!(
                "bounds must be positive, got {}x{}",
                self.bounds.width, self.bounds.height
            )));
        }
        if !self.ranging_scale.is_finite() {
            return Err(PresenceError::Config(
                "ranging scale must be finite".to_string(),
            ));
        }
        Ok(())
    }
}
