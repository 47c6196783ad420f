//! Application state shared across request handlers.

use std::sync::Arc;

use crate::config::RelayConfig;
use crate::hub::Hub;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            hub: Arc::new(Hub::new(config.outbound_capacity)),
            config: Arc::new(config),
        }
    }
}
