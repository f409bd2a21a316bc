//! Replication tuning knobs.

use thiserror::Error;

/// Replication configuration
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Whether view culling is active. When disabled every indexed entity
    /// is replicated to every viewer (debug / single-screen servers).
    pub culling_enabled: bool,
    /// Side length of the square view region around each eye, in world units
    pub view_size: f32,
    /// Per-tick cap on entities sent to a viewer for the first time
    pub new_entity_budget: usize,
    /// Per-tick cap on entities re-entering a viewer's view
    pub entered_entity_budget: usize,
    /// Ticks a viewer may go without acknowledging before the server
    /// force-acknowledges on its behalf. Zero disables the timeout.
    pub force_ack_threshold: u32,
    /// How many per-tick sent lists are retained for ack matching
    pub window: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            culling_enabled: true,
            view_size: 30.0,
            new_entity_budget: 256,
            entered_entity_budget: 1024,
            force_ack_threshold: 60,
            window: 20,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("view_size must be positive, got {0}")]
    InvalidViewSize(f32),
    #[error("window must be at least 1")]
    ZeroWindow,
    #[error("force_ack_threshold {threshold} must be zero or at least the window {window}")]
    ThresholdInsideWindow { threshold: u32, window: usize },
}

impl ReplicationConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("VIEWSCOPE_CULLING_ENABLED") {
            match value.parse::<bool>() {
                Ok(parsed) => config.culling_enabled = parsed,
                Err(_) => {
                    tracing::warn!("Invalid VIEWSCOPE_CULLING_ENABLED '{}', using default", value)
                }
            }
        }

        if let Ok(value) = std::env::var("VIEWSCOPE_VIEW_SIZE") {
            match value.parse::<f32>() {
                Ok(parsed) if parsed > 0.0 => config.view_size = parsed,
                Ok(_) => tracing::warn!("VIEWSCOPE_VIEW_SIZE must be > 0, using default"),
                Err(_) => tracing::warn!("Invalid VIEWSCOPE_VIEW_SIZE '{}', using default", value),
            }
        }

        if let Ok(value) = std::env::var("VIEWSCOPE_NEW_ENTITY_BUDGET") {
            match value.parse::<usize>() {
                Ok(parsed) => config.new_entity_budget = parsed,
                Err(_) => {
                    tracing::warn!("Invalid VIEWSCOPE_NEW_ENTITY_BUDGET '{}', using default", value)
                }
            }
        }

        if let Ok(value) = std::env::var("VIEWSCOPE_ENTERED_ENTITY_BUDGET") {
            match value.parse::<usize>() {
                Ok(parsed) => config.entered_entity_budget = parsed,
                Err(_) => tracing::warn!(
                    "Invalid VIEWSCOPE_ENTERED_ENTITY_BUDGET '{}', using default",
                    value
                ),
            }
        }

        if let Ok(value) = std::env::var("VIEWSCOPE_FORCE_ACK_THRESHOLD") {
            match value.parse::<u32>() {
                Ok(parsed) => config.force_ack_threshold = parsed,
                Err(_) => {
                    tracing::warn!("Invalid VIEWSCOPE_FORCE_ACK_THRESHOLD '{}', using default", value)
                }
            }
        }

        if let Ok(value) = std::env::var("VIEWSCOPE_WINDOW") {
            match value.parse::<usize>() {
                Ok(parsed) if parsed > 0 => config.window = parsed,
                Ok(_) => tracing::warn!("VIEWSCOPE_WINDOW must be > 0, using default"),
                Err(_) => tracing::warn!("Invalid VIEWSCOPE_WINDOW '{}', using default", value),
            }
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.view_size > 0.0) {
            return Err(ConfigError::InvalidViewSize(self.view_size));
        }
        if self.window == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        // A timeout shorter than the window would force-ack ticks the
        // client could still legitimately acknowledge.
        if self.force_ack_threshold != 0 && (self.force_ack_threshold as usize) < self.window {
            return Err(ConfigError::ThresholdInsideWindow {
                threshold: self.force_ack_threshold,
                window: self.window,
            });
        }
        Ok(())
    }
}
