//! Cookie-backed login sessions.
//!
//! The cookie holds `<token>.<signature>`, the signature being an
//! HMAC-SHA256 of the token under `SESSION_SECRET`. Session state itself stays
//! in process memory and is lost on restart.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::digest::{Key, KeyInit};
use hmac::{Hmac, Mac};
use log::{debug, info};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use warp::{Filter, Rejection};

use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

pub const COOKIE_NAME: &str = "sid";
pub const SESSION_TTL: Duration = Duration::from_secs(60 * 60 * 24);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

struct Session {
    username: String,
    expires_at: Instant,
}

pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    mac: HmacSha256,
    ttl: Duration,
    secure_cookie: bool,
}

impl SessionStore {
    pub fn new(secret: &str, secure_cookie: bool) -> Self {
        Self::with_ttl(secret, secure_cookie, SESSION_TTL)
    }

    pub fn with_ttl(secret: &str, secure_cookie: bool, ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            mac: keyed_mac(secret.as_bytes()),
            ttl,
            secure_cookie,
        }
    }

    fn mac(&self) -> HmacSha256 {
        self.mac.clone()
    }

    fn sign(&self, token: &str) -> String {
        let mut mac = self.mac();
        mac.update(token.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Returns the token if the signature checks out.
    fn unsign<'a>(&self, cookie: &'a str) -> Option<&'a str> {
        let (token, signature) = cookie.split_once('.')?;
        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;
        let mut mac = self.mac();
        mac.update(token.as_bytes());
        mac.verify_slice(&signature).ok()?;
        Some(token)
    }

    /// Starts a session and returns the signed cookie value.
    pub async fn create(&self, username: &str) -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);

        let mut sessions = self.sessions.write().await;
        sessions.insert(
            token.clone(),
            Session {
                username: username.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );

        let signature = self.sign(&token);
        format!("{token}.{signature}")
    }

    pub async fn resolve(&self, cookie: &str) -> Option<String> {
        let token = self.unsign(cookie)?;
        let sessions = self.sessions.read().await;
        let session = sessions.get(token)?;
        if Instant::now() >= session.expires_at {
            return None;
        }
        Some(session.username.clone())
    }

    pub async fn destroy(&self, cookie: &str) {
        if let Some(token) = self.unsign(cookie) {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.remove(token) {
                info!("{} logged out", session.username);
            }
        }
    }

    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| session.expires_at > now);
        before - sessions.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let removed = store.sweep_expired().await;
                if removed > 0 {
                    debug!("Swept {removed} expired sessions");
                }
            }
        });
    }

    pub fn cookie_header(&self, value: &str) -> String {
        let secure = if self.secure_cookie { "; Secure" } else { "" };
        format!(
            "{COOKIE_NAME}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}{secure}",
            self.ttl.as_secs()
        )
    }

    pub fn clear_cookie_header(&self) -> String {
        let secure = if self.secure_cookie { "; Secure" } else { "" };
        format!("{COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0{secure}")
    }
}

/// Block-sized HMAC key: short secrets are zero padded, long ones hashed first.
fn keyed_mac(secret: &[u8]) -> HmacSha256 {
    let mut key = Key::<HmacSha256>::default();
    if secret.len() > key.len() {
        let digest = Sha256::digest(secret);
        key[..digest.len()].copy_from_slice(&digest);
    } else {
        key[..secret.len()].copy_from_slice(secret);
    }
    <HmacSha256 as KeyInit>::new(&key)
}

/// Extracts the logged-in username, if any.
pub fn current_user(
    sessions: Arc<SessionStore>,
) -> impl Filter<Extract = (Option<String>,), Error = Infallible> + Clone {
    warp::cookie::optional::<String>(COOKIE_NAME).and_then(move |cookie: Option<String>| {
        let sessions = Arc::clone(&sessions);
        async move {
            let user = match cookie {
                Some(cookie) => sessions.resolve(&cookie).await,
                None => None,
            };
            Ok::<_, Infallible>(user)
        }
    })
}

/// Like [`current_user`] but rejects with 401 when nobody is logged in.
pub fn authenticated(
    sessions: Arc<SessionStore>,
) -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    current_user(sessions).and_then(|user: Option<String>| async move {
        user.ok_or_else(|| Rejection::from(AppError::Unauthorized))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn created_session_resolves() {
        let store = SessionStore::new("secret", false);
        let cookie = store.create("alice").await;
        assert_eq!(store.resolve(&cookie).await.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn tampered_or_foreign_cookies_are_rejected() {
        let store = SessionStore::new("secret", false);
        let cookie = store.create("alice").await;
        let (token, _) = cookie.split_once('.').unwrap();

        assert!(store.resolve(token).await.is_none());
        assert!(store.resolve(&format!("{token}.AAAA")).await.is_none());

        let other = SessionStore::new("another-secret", false);
        assert!(other.resolve(&cookie).await.is_none());
    }

    #[test]
    fn keyed_mac_matches_variable_length_keys() {
        let long = "long-secret-".repeat(10);
        for secret in ["secret", long.as_str()] {
            let mut expected = <HmacSha256 as KeyInit>::new_from_slice(secret.as_bytes()).unwrap();
            let mut actual = keyed_mac(secret.as_bytes());
            expected.update(b"token");
            actual.update(b"token");
            assert_eq!(expected.finalize().into_bytes(), actual.finalize().into_bytes());
        }
    }

    #[tokio::test]
    async fn destroy_ends_the_session() {
        let store = SessionStore::new("secret", false);
        let cookie = store.create("alice").await;
        store.destroy(&cookie).await;
        assert!(store.resolve(&cookie).await.is_none());
    }

    #[tokio::test]
    async fn expired_sessions_are_ignored_and_swept() {
        let store = SessionStore::with_ttl("secret", false, Duration::ZERO);
        let cookie = store.create("alice").await;
        assert!(store.resolve(&cookie).await.is_none());
        assert_eq!(store.sweep_expired().await, 1);
    }

    #[test]
    fn secure_flag_follows_environment() {
        let dev = SessionStore::new("secret", false);
        let prod = SessionStore::new("secret", true);
        assert!(!dev.cookie_header("v").contains("Secure"));
        assert!(prod.cookie_header("v").contains("; Secure"));
        assert!(prod.cookie_header("v").contains("Max-Age=86400"));
        assert!(dev.clear_cookie_header().contains("Max-Age=0"));
    }
}
