//! Application configuration options

use std::time::Duration;

use crate::storage::settings::Settings;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Engine settings
    pub settings: Settings,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            settings: Settings::default(),
        }
    }
}

/// Lifecycle options for the engine
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Time given to running deployments to cancel and drain on shutdown
    pub drain_timeout: Duration,

    /// Maximum delay for graceful shutdown as a whole
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(20),
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}
