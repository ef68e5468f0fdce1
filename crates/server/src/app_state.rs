use std::{collections::HashSet, sync::Arc, time::Duration};

use server_api::ApiContext;
use shared::domain::CallId;
use tokio::sync::Mutex;

use crate::{presence::PresenceRegistry, relay::EventRelay};

pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) presence: Arc<PresenceRegistry>,
    pub(crate) relay: EventRelay,
    pub(crate) ring_timeout: Duration,
    /// Calls with a ring timer in flight.
    pub(crate) ringing: Mutex<HashSet<CallId>>,
}

impl AppState {
    pub(crate) fn new(api: ApiContext, ring_timeout: Duration) -> Self {
        let presence = Arc::new(PresenceRegistry::default());
        Self {
            api,
            relay: EventRelay::new(presence.clone()),
            presence,
            ring_timeout,
            ringing: Mutex::new(HashSet::new()),
        }
    }
}
