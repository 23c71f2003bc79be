use std::convert::Infallible;
use std::sync::Arc;

use warp::Filter;

use crate::config::Config;
use crate::peer::PeerRelay;
use crate::rate_limit::{RateLimiter, AUTH_MAX_ATTEMPTS, AUTH_WINDOW};
use crate::server::Server;
use crate::session::SessionStore;
use crate::store::Store;

/// Handles shared by every route.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub sessions: Arc<SessionStore>,
    pub auth_limiter: Arc<RateLimiter>,
    pub hub: Arc<Server>,
    pub peers: Arc<PeerRelay>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn Store>) -> Self {
        let sessions = SessionStore::new(&config.session_secret, config.production);
        Self {
            hub: Arc::new(Server::new(Arc::clone(&store))),
            sessions: Arc::new(sessions),
            auth_limiter: Arc::new(RateLimiter::new(AUTH_MAX_ATTEMPTS, AUTH_WINDOW)),
            peers: Arc::new(PeerRelay::new()),
            config: Arc::new(config),
            store,
        }
    }

    /// Background sweepers for sessions and typing indicators.
    pub fn spawn_maintenance(&self) {
        self.sessions.spawn_sweeper();
        self.hub.spawn_typing_sweeper();
    }
}

pub fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}
