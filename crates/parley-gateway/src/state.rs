//! Gateway shared state.

use std::sync::Arc;

use chrono::{DateTime, Utc};

#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::PrometheusHandle;

use crate::manager::SessionManager;

/// Shared state for the HTTP handlers.
pub struct GatewayState {
    pub manager: Arc<SessionManager>,
    pub started_at: DateTime<Utc>,
    #[cfg(feature = "prometheus")]
    pub prometheus: Option<PrometheusHandle>,
}

impl GatewayState {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            started_at: Utc::now(),
            #[cfg(feature = "prometheus")]
            prometheus: None,
        }
    }

    #[cfg(feature = "prometheus")]
    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
