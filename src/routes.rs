use std::convert::Infallible;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::json;
use warp::http::{header, StatusCode, Uri};
use warp::{Filter, Rejection, Reply};

use crate::auth;
use crate::error::{handle_rejection, AppError};
use crate::peer::{PeerQuery, PeerRelay, PEER_KEY};
use crate::rate_limit::throttle;
use crate::session::{authenticated, current_user, SessionStore, COOKIE_NAME};
use crate::state::{with_state, AppState};

const AUTH_BODY_LIMIT: u64 = 16 * 1024;
const AVATAR_BODY_LIMIT: u64 = 1024 * 1024;
const AVATAR_URL_MAX: usize = 2048;
const AVATAR_IMAGE_MAX: usize = 512 * 1024;
const AVATAR_IMAGE_TYPES: [&str; 4] = ["png", "jpeg", "gif", "webp"];
const DEFAULT_HISTORY: u32 = 50;
const MAX_HISTORY: u32 = 200;

#[derive(Debug, Default, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    limit: Option<u32>,
    before: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarRequest {
    avatar_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthReply {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    redirect_url: Option<&'static str>,
}

pub fn routes(state: AppState) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    pages(&state)
        .or(auth_routes(&state))
        .or(api_routes(&state))
        .or(realtime_routes(&state))
        .or(warp::get().and(warp::fs::dir(state.config.static_dir.clone())))
        .recover(handle_rejection)
        .with(warp::log("lounge::http"))
}

/// Accepts either a JSON or a form-encoded body.
fn credentials() -> impl Filter<Extract = (Credentials,), Error = Rejection> + Clone {
    warp::body::content_length_limit(AUTH_BODY_LIMIT).and(
        warp::body::json::<Credentials>()
            .or(warp::body::form::<Credentials>())
            .unify(),
    )
}

/// Passes only with a live session; pages fall back to a login redirect.
fn require_login(sessions: Arc<SessionStore>) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    authenticated(sessions).map(|_: String| ()).untuple_one()
}

/// Passes only without a live session.
fn anonymous(sessions: Arc<SessionStore>) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    current_user(sessions)
        .and_then(|user: Option<String>| async move {
            match user {
                Some(_) => Err(warp::reject::not_found()),
                None => Ok(()),
            }
        })
        .untuple_one()
}

fn redirect_to_login() -> warp::reply::Response {
    warp::redirect::found(Uri::from_static("/login")).into_response()
}

fn pages(state: &AppState) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let static_dir = &state.config.static_dir;
    let views_dir = &state.config.views_dir;

    let index = warp::path::end().and(warp::fs::file(static_dir.join("index.html")));
    let login = warp::path("login")
        .and(warp::path::end())
        .and(warp::fs::file(static_dir.join("login.html")));
    let signup = warp::path("signup")
        .and(warp::path::end())
        .and(warp::fs::file(static_dir.join("signup.html")));

    let gated = |name: &'static str, file: std::path::PathBuf| {
        let page = warp::path(name)
            .and(warp::path::end())
            .and(require_login(Arc::clone(&state.sessions)))
            .and(warp::fs::file(file))
            .map(|file: warp::fs::File| file.into_response());
        let fallback = warp::path(name)
            .and(warp::path::end())
            .and(anonymous(Arc::clone(&state.sessions)))
            .map(redirect_to_login);
        page.or(fallback).unify()
    };

    let logout = warp::path("logout")
        .and(warp::path::end())
        .and(warp::cookie::optional::<String>(COOKIE_NAME))
        .and(with_state(state.clone()))
        .and_then(logout);

    warp::get().and(
        index
            .or(login)
            .unify()
            .or(signup)
            .unify()
            .map(|file: warp::fs::File| file.into_response())
            .or(gated("dashboard", views_dir.join("dashboard.html")))
            .unify()
            .or(gated("chat", views_dir.join("chat.html")))
            .unify()
            .or(logout)
            .unify(),
    )
}

fn auth_routes(state: &AppState) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let limited = throttle(
        Arc::clone(&state.auth_limiter),
        state.config.trust_proxy,
    );

    let login = warp::path("login")
        .and(warp::path::end())
        .and(limited.clone())
        .and(credentials())
        .and(with_state(state.clone()))
        .and_then(login);

    let signup = warp::path("signup")
        .and(warp::path::end())
        .and(limited)
        .and(credentials())
        .and(with_state(state.clone()))
        .and_then(signup);

    warp::post().and(login.or(signup).unify())
}

fn api_routes(state: &AppState) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let userinfo = warp::get()
        .and(warp::path!("api" / "userinfo"))
        .and(current_user(Arc::clone(&state.sessions)))
        .map(userinfo);

    let messages = warp::get()
        .and(warp::path!("api" / "messages"))
        .and(authenticated(Arc::clone(&state.sessions)))
        .and(warp::query::<HistoryQuery>())
        .and(with_state(state.clone()))
        .and_then(list_messages);

    let users = warp::get()
        .and(warp::path!("api" / "users"))
        .and(authenticated(Arc::clone(&state.sessions)))
        .and(with_state(state.clone()))
        .and_then(list_users);

    let avatar = warp::post()
        .and(warp::path!("api" / "avatar"))
        .and(authenticated(Arc::clone(&state.sessions)))
        .and(warp::body::content_length_limit(AVATAR_BODY_LIMIT))
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(update_avatar);

    userinfo
        .or(messages)
        .unify()
        .or(users)
        .unify()
        .or(avatar)
        .unify()
}

fn realtime_routes(state: &AppState) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let hub = Arc::clone(&state.hub);
    let socket = warp::path("ws")
        .and(warp::path::end())
        .and(authenticated(Arc::clone(&state.sessions)))
        .and(warp::ws())
        .map(move |username: String, ws: warp::ws::Ws| {
            let hub = Arc::clone(&hub);
            ws.on_upgrade(move |socket| hub.handle_connection(socket, username))
                .into_response()
        });

    // PeerJS clients ask for `<path>/<key>/id`; `/peerjs/id` is kept for plain fetches.
    let keyed_id = warp::path!("peerjs" / String / "id")
        .and_then(|key: String| async move {
            if key == PEER_KEY {
                Ok(())
            } else {
                Err(warp::reject::not_found())
            }
        })
        .untuple_one();
    let peer_id = warp::get()
        .and(warp::path!("peerjs" / "id").or(keyed_id).unify())
        .and(require_login(Arc::clone(&state.sessions)))
        .map(|| PeerRelay::generate_id().into_response());

    let peers = Arc::clone(&state.peers);
    let peer_socket = warp::path!("peerjs" / "peerjs")
        .and(require_login(Arc::clone(&state.sessions)))
        .and(warp::query::<PeerQuery>())
        .and(warp::ws())
        .map(move |query: PeerQuery, ws: warp::ws::Ws| {
            let peers = Arc::clone(&peers);
            ws.on_upgrade(move |socket| peers.handle_connection(socket, query))
                .into_response()
        });

    socket.or(peer_id).unify().or(peer_socket).unify()
}

async fn login(credentials: Credentials, state: AppState) -> Result<warp::reply::Response, Rejection> {
    let username = auth::login(
        state.store.as_ref(),
        credentials.username.trim(),
        &credentials.password,
    )
    .await?;

    let cookie = state.sessions.create(&username).await;
    let body = warp::reply::json(&AuthReply {
        success: true,
        message: None,
        redirect_url: Some("/dashboard"),
    });
    Ok(warp::reply::with_header(body, header::SET_COOKIE, state.sessions.cookie_header(&cookie))
        .into_response())
}

async fn signup(credentials: Credentials, state: AppState) -> Result<warp::reply::Response, Rejection> {
    auth::signup(
        state.store.as_ref(),
        credentials.username.trim(),
        &credentials.password,
    )
    .await?;

    let body = warp::reply::json(&AuthReply {
        success: true,
        message: Some("User created! Log in now."),
        redirect_url: None,
    });
    Ok(warp::reply::with_status(body, StatusCode::CREATED).into_response())
}

async fn logout(cookie: Option<String>, state: AppState) -> Result<warp::reply::Response, Rejection> {
    if let Some(cookie) = cookie {
        state.sessions.destroy(&cookie).await;
    }
    let redirect = warp::redirect::found(Uri::from_static("/"));
    Ok(
        warp::reply::with_header(redirect, header::SET_COOKIE, state.sessions.clear_cookie_header())
            .into_response(),
    )
}

fn userinfo(user: Option<String>) -> warp::reply::Response {
    match user {
        Some(username) => warp::reply::json(&json!({ "username": username })).into_response(),
        None => warp::reply::with_status(
            warp::reply::json(&json!({ "error": "Not logged in." })),
            StatusCode::UNAUTHORIZED,
        )
        .into_response(),
    }
}

async fn list_messages(
    _username: String,
    query: HistoryQuery,
    state: AppState,
) -> Result<warp::reply::Response, Rejection> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY).clamp(1, MAX_HISTORY);
    let messages = state
        .store
        .recent_messages(limit, query.before)
        .await
        .map_err(AppError::from)?;
    Ok(warp::reply::json(&messages).into_response())
}

async fn list_users(_username: String, state: AppState) -> Result<warp::reply::Response, Rejection> {
    let users = state.store.list_users().await.map_err(AppError::from)?;
    Ok(warp::reply::json(&users).into_response())
}

async fn update_avatar(
    username: String,
    request: AvatarRequest,
    state: AppState,
) -> Result<warp::reply::Response, Rejection> {
    let avatar_url = validate_avatar(&request.avatar_url)?;
    state
        .store
        .update_avatar(&username, avatar_url)
        .await
        .map_err(AppError::from)?;
    info!("{username} updated their avatar");

    Ok(warp::reply::json(&json!({ "success": true, "avatarUrl": avatar_url })).into_response())
}

/// Empty clears the avatar; otherwise an http(s) URL or an inline base64 image.
fn validate_avatar(raw: &str) -> Result<Option<&str>, AppError> {
    let url = raw.trim();
    if url.is_empty() {
        return Ok(None);
    }

    if let Some(rest) = url.strip_prefix("data:image/") {
        let (kind, data) = rest
            .split_once(";base64,")
            .ok_or_else(|| AppError::InvalidInput("Avatar must be a base64 image.".to_string()))?;
        if !AVATAR_IMAGE_TYPES.contains(&kind) {
            return Err(AppError::InvalidInput("Unsupported avatar image type.".to_string()));
        }
        let decoded = BASE64
            .decode(data)
            .map_err(|_| AppError::InvalidInput("Avatar image is not valid base64.".to_string()))?;
        if decoded.len() > AVATAR_IMAGE_MAX {
            return Err(AppError::InvalidInput("Avatar image is too large.".to_string()));
        }
        return Ok(Some(url));
    }

    let is_web = url.starts_with("https://") || url.starts_with("http://");
    if !is_web || url.len() > AVATAR_URL_MAX || url.chars().any(char::is_whitespace) {
        return Err(AppError::InvalidInput("Avatar must be an http(s) URL or an image.".to_string()));
    }
    Ok(Some(url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::memory::MemoryStore;
    use crate::store::Store;
    use rstest::rstest;
    use serde_json::Value;

    fn state() -> (AppState, Arc<MemoryStore>) {
        let config = Config::from_lookup(|_| None).unwrap();
        let store = Arc::new(MemoryStore::new());
        (AppState::new(config, store.clone()), store)
    }

    fn body_json(response: &warp::http::Response<warp::hyper::body::Bytes>) -> Value {
        serde_json::from_slice(response.body()).unwrap()
    }

    fn session_cookie(response: &warp::http::Response<warp::hyper::body::Bytes>) -> String {
        let header = response.headers()[header::SET_COOKIE].to_str().unwrap();
        header.split(';').next().unwrap().to_string()
    }

    async fn sign_up_and_log_in<F>(filter: &F) -> String
    where
        F: Filter + 'static,
        F::Extract: Reply + Send,
    {
        let signup = warp::test::request()
            .method("POST")
            .path("/signup")
            .json(&json!({"username": "alice", "password": "hunter22"}))
            .reply(filter)
            .await;
        assert_eq!(signup.status(), StatusCode::CREATED);

        let login = warp::test::request()
            .method("POST")
            .path("/login")
            .header("content-type", "application/x-www-form-urlencoded")
            .body("username=alice&password=hunter22")
            .reply(filter)
            .await;
        assert_eq!(login.status(), StatusCode::OK);
        assert_eq!(body_json(&login)["redirectUrl"], "/dashboard");
        session_cookie(&login)
    }

    #[tokio::test]
    async fn userinfo_follows_session() {
        let (state, _) = state();
        let filter = routes(state);

        let anonymous = warp::test::request()
            .path("/api/userinfo")
            .reply(&filter)
            .await;
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(&anonymous)["error"], "Not logged in.");

        let cookie = sign_up_and_log_in(&filter).await;
        let known = warp::test::request()
            .path("/api/userinfo")
            .header("cookie", &cookie)
            .reply(&filter)
            .await;
        assert_eq!(known.status(), StatusCode::OK);
        assert_eq!(body_json(&known)["username"], "alice");

        let logout = warp::test::request()
            .path("/logout")
            .header("cookie", &cookie)
            .reply(&filter)
            .await;
        assert_eq!(logout.status(), StatusCode::FOUND);
        let after = warp::test::request()
            .path("/api/userinfo")
            .header("cookie", &cookie)
            .reply(&filter)
            .await;
        assert_eq!(after.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn duplicate_signup_does_not_echo_username() {
        let (state, _) = state();
        let filter = routes(state);
        sign_up_and_log_in(&filter).await;

        let duplicate = warp::test::request()
            .method("POST")
            .path("/signup")
            .json(&json!({"username": "Alice", "password": "whatever1"}))
            .reply(&filter)
            .await;
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);
        let body = body_json(&duplicate);
        assert_eq!(body["success"], false);
        assert!(!body["message"].as_str().unwrap().to_lowercase().contains("alice"));
    }

    #[tokio::test]
    async fn wrong_password_gets_generic_message() {
        let (state, _) = state();
        let filter = routes(state);
        sign_up_and_log_in(&filter).await;

        let response = warp::test::request()
            .method("POST")
            .path("/login")
            .json(&json!({"username": "alice", "password": "wrong-one"}))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_json(&response)["message"],
            "Username or password is incorrect."
        );
        assert!(response.headers().get(header::SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn gated_pages_redirect_to_login() {
        let (state, _) = state();
        let filter = routes(state);
        for path in ["/dashboard", "/chat"] {
            let response = warp::test::request().path(path).reply(&filter).await;
            assert_eq!(response.status(), StatusCode::FOUND);
            assert_eq!(response.headers()[header::LOCATION], "/login");
        }
    }

    #[tokio::test]
    async fn missing_view_is_not_masked_as_login_redirect() {
        let config = Config::from_lookup(|key| {
            (key == "VIEWS_DIR").then(|| "/nonexistent/lounge-views".to_string())
        })
        .unwrap();
        let filter = routes(AppState::new(config, Arc::new(MemoryStore::new())));
        let cookie = sign_up_and_log_in(&filter).await;

        let response = warp::test::request()
            .path("/dashboard")
            .header("cookie", &cookie)
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get(header::LOCATION).is_none());
    }

    #[tokio::test]
    async fn auth_attempts_are_throttled() {
        let (state, _) = state();
        let filter = routes(state);
        let mut last = StatusCode::OK;
        for _ in 0..=crate::rate_limit::AUTH_MAX_ATTEMPTS {
            last = warp::test::request()
                .method("POST")
                .path("/login")
                .remote_addr("10.0.0.7:4000".parse().unwrap())
                .json(&json!({"username": "alice", "password": "hunter22"}))
                .reply(&filter)
                .await
                .status();
        }
        assert_eq!(last, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn api_requires_session_and_returns_history() {
        let (state, store) = state();
        let filter = routes(state);

        let anonymous = warp::test::request().path("/api/messages").reply(&filter).await;
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

        let cookie = sign_up_and_log_in(&filter).await;
        for text in ["one", "two", "three"] {
            store.insert_message(1, "alice", text).await.unwrap();
        }

        let page = warp::test::request()
            .path("/api/messages?limit=2")
            .header("cookie", &cookie)
            .reply(&filter)
            .await;
        let body = body_json(&page);
        let contents: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["content"].as_str().unwrap())
            .collect();
        assert_eq!(contents, vec!["two", "three"]);

        let users = warp::test::request()
            .path("/api/users")
            .header("cookie", &cookie)
            .reply(&filter)
            .await;
        assert_eq!(body_json(&users)[0]["username"], "alice");
    }

    #[tokio::test]
    async fn avatar_update_is_persisted() {
        let (state, store) = state();
        let filter = routes(state);
        let cookie = sign_up_and_log_in(&filter).await;

        let response = warp::test::request()
            .method("POST")
            .path("/api/avatar")
            .header("cookie", &cookie)
            .json(&json!({"avatarUrl": "https://cdn.example.com/a.png"}))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let user = store.find_user("alice").await.unwrap().unwrap();
        assert_eq!(user.avatar_url.as_deref(), Some("https://cdn.example.com/a.png"));

        let rejected = warp::test::request()
            .method("POST")
            .path("/api/avatar")
            .header("cookie", &cookie)
            .json(&json!({"avatarUrl": "javascript:alert(1)"}))
            .reply(&filter)
            .await;
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
    }

    #[rstest]
    #[case("", true)]
    #[case("https://example.com/me.png", true)]
    #[case("data:image/png;base64,iVBORw0KGgo=", true)]
    #[case("data:image/svg+xml;base64,PHN2Zz4=", false)]
    #[case("data:image/png;base64,***", false)]
    #[case("ftp://example.com/me.png", false)]
    #[case("https://example.com/with space.png", false)]
    fn avatar_rules(#[case] url: &str, #[case] ok: bool) {
        assert_eq!(validate_avatar(url).is_ok(), ok);
    }

    #[tokio::test]
    async fn realtime_endpoints_require_session() {
        let (state, _) = state();
        let filter = routes(state);
        let socket = warp::test::request().path("/ws").reply(&filter).await;
        assert_eq!(socket.status(), StatusCode::UNAUTHORIZED);
        let peer_id = warp::test::request().path("/peerjs/peerjs/id").reply(&filter).await;
        assert_eq!(peer_id.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn peer_id_is_issued_to_logged_in_users() {
        let (state, _) = state();
        let filter = routes(state);
        let cookie = sign_up_and_log_in(&filter).await;
        let response = warp::test::request()
            .path("/peerjs/peerjs/id")
            .header("cookie", &cookie)
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().len(), 36);
    }
}
