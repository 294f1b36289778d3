//! Application state shared across handlers.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::RwLock;

use motionwatch_core::{ChartAggregator, CheckInSweeper, DeviceRegistry, EventLogStore};
use motionwatch_store::Store;

use crate::config::{Config, SecurityConfig};

/// Shared application state.
pub struct AppState {
    /// Device table, the single authority for device state.
    pub registry: Arc<DeviceRegistry>,
    /// Histograms over the active logs.
    pub charts: ChartAggregator,
    /// Background check-in sweeper.
    pub sweeper: Arc<CheckInSweeper<Store>>,
    /// Configuration (RwLock for runtime reads from handlers).
    pub config: RwLock<Config>,
    /// Password gate settings, shared with the middleware.
    pub security: Arc<SecurityConfig>,
    /// When the service started.
    pub started_at: OffsetDateTime,
}

impl AppState {
    /// Create new application state around a loaded registry.
    ///
    /// The sweeper is created but not started.
    pub fn new(registry: DeviceRegistry, config: Config) -> Arc<Self> {
        let registry = Arc::new(registry);
        let charts = ChartAggregator::new(Arc::clone(registry.logs()));
        let sweeper = Arc::new(CheckInSweeper::new(
            Arc::clone(&registry),
            config.checkin.timeout(),
        ));
        let security = Arc::new(config.security.clone());

        Arc::new(Self {
            registry,
            charts,
            sweeper,
            config: RwLock::new(config),
            security,
            started_at: OffsetDateTime::now_utc(),
        })
    }

    /// The log store behind the registry.
    pub fn logs(&self) -> &Arc<EventLogStore> {
        self.registry.logs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_app_state_new() {
        let dir = tempfile::tempdir().unwrap();
        let logs = Arc::new(EventLogStore::new(dir.path()));
        let registry = DeviceRegistry::load(Store::open_in_memory().unwrap(), logs).unwrap();

        let mut config = Config::default();
        config.checkin.timeout_secs = 42;
        config.security.password = "secret".to_string();
        let state = AppState::new(registry, config);

        assert_eq!(state.sweeper.timeout().as_secs(), 42);
        assert!(state.security.is_enabled());
        assert_eq!(state.logs().root(), dir.path());
        assert_eq!(state.config.read().await.checkin.timeout_secs, 42);
    }
}
