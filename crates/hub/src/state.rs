use std::sync::Arc;

use crate::{
    activity::ActivityMap,
    config::HubConfig,
    observer::ObserverHub,
    profiles::ProfileStore,
    stores::{analytics::AnalyticsStore, reviews::ReviewSessionStore, threads::ThreadIndexStore},
    supervisor::Supervisor,
    ws::ClientRegistry,
};

/// Everything the HTTP and WebSocket handlers need, passed explicitly.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HubConfig>,
    pub profiles: Arc<ProfileStore>,
    pub supervisor: Supervisor,
    pub clients: ClientRegistry,
    pub activity: Arc<ActivityMap>,
    pub threads: ThreadIndexStore,
    pub analytics: AnalyticsStore,
    pub reviews: ReviewSessionStore,
    pub observer: ObserverHub,
}
