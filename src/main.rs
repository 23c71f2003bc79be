mod auth;
mod config;
mod error;
mod messages;
mod models;
mod peer;
mod presence;
mod rate_limit;
mod routes;
mod server;
mod session;
mod state;
mod store;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info, warn};

use config::{Config, TlsPaths};
use state::AppState;
use store::MySqlStore;

fn tls_files_present(tls: &TlsPaths) -> bool {
    for path in [&tls.cert, &tls.key] {
        if let Err(e) = std::fs::metadata(path) {
            warn!("Cannot read {}: {e}", path.display());
            return false;
        }
    }
    true
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let store = match MySqlStore::connect(&config.database).await {
        Ok(store) => store,
        Err(e) => {
            error!("DB connection error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = store.migrate().await {
        error!("Could not prepare database schema: {e}");
        return ExitCode::FAILURE;
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let tls = config.tls.clone().filter(tls_files_present);

    let state = AppState::new(config, Arc::new(store));
    state.spawn_maintenance();
    let routes = routes::routes(state);

    match tls {
        Some(tls) => {
            info!("Server + Chat running (HTTPS/WSS) at port: {}", addr.port());
            warp::serve(routes)
                .tls()
                .cert_path(&tls.cert)
                .key_path(&tls.key)
                .run(addr)
                .await;
        }
        None => {
            info!("Server + Chat running at: http://localhost:{}", addr.port());
            warp::serve(routes).run(addr).await;
        }
    }

    ExitCode::SUCCESS
}
