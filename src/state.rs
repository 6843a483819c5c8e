use crate::config::GatewayConfig;
use crate::events::EventHub;
use crate::session::SessionRegistry;
use std::sync::Arc;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub config: GatewayConfig,
    pub registry: Arc<SessionRegistry>,
    pub events: EventHub,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        registry: Arc<SessionRegistry>,
        events: EventHub,
    ) -> SharedState {
        Arc::new(Self {
            config,
            registry,
            events,
        })
    }
}
