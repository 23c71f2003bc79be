use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;
use tokio::sync::Mutex;
use warp::{Filter, Rejection};

use crate::error::AppError;

pub const AUTH_MAX_ATTEMPTS: u32 = 10;
pub const AUTH_WINDOW: Duration = Duration::from_secs(15 * 60);

struct Window {
    started: Instant,
    attempts: u32,
}

/// Fixed-window attempt counter keyed by client address.
pub struct RateLimiter {
    max_attempts: u32,
    window: Duration,
    clients: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Records one attempt and reports whether it is within budget.
    pub async fn check(&self, client: &str) -> bool {
        self.check_at(client, Instant::now()).await
    }

    async fn check_at(&self, client: &str, now: Instant) -> bool {
        let mut clients = self.clients.lock().await;

        // Drop idle windows so the table does not grow without bound.
        let window = self.window;
        clients.retain(|_, w| now.duration_since(w.started) < window);

        let entry = clients.entry(client.to_string()).or_insert(Window {
            started: now,
            attempts: 0,
        });
        entry.attempts += 1;
        entry.attempts <= self.max_attempts
    }
}

/// Identifies the caller: the first `X-Forwarded-For` hop when running behind a
/// trusted proxy, otherwise the socket peer.
pub fn client_key(
    trust_proxy: bool,
) -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::header::optional::<String>("x-forwarded-for")
        .and(warp::addr::remote())
        .map(move |forwarded: Option<String>, remote: Option<SocketAddr>| {
            let forwarded = forwarded
                .filter(|_| trust_proxy)
                .and_then(|header| header.split(',').next().map(|hop| hop.trim().to_string()))
                .filter(|hop| !hop.is_empty());

            forwarded
                .or_else(|| remote.map(|addr| addr.ip().to_string()))
                .unwrap_or_else(|| "unknown".to_string())
        })
}

/// Passes through when the caller still has attempts left, rejects with 429 otherwise.
pub fn throttle(
    limiter: Arc<RateLimiter>,
    trust_proxy: bool,
) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    client_key(trust_proxy)
        .and_then(move |client: String| {
            let limiter = Arc::clone(&limiter);
            async move {
                if limiter.check(&client).await {
                    Ok(())
                } else {
                    warn!("Throttling auth attempts from {client}");
                    Err(Rejection::from(AppError::RateLimited))
                }
            }
        })
        .untuple_one()
}
