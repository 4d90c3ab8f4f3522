mod config;
mod sweep;

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use classbits_api::auth::{AppState, AppStateInner, create_token};
use classbits_api::storage::ProofStorage;
use classbits_db::Database;
use classbits_notify::Dispatcher;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "classbits=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    let db = Database::open(&config.db_path)?;

    // `classbits issue-token <user-id>` prints a bearer token for an existing
    // user. Login is handled by another service.
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let [cmd, user_id] = args.as_slice() {
        if cmd == "issue-token" {
            let user_id: Uuid = user_id.parse()?;
            let user = db
                .get_user(user_id)?
                .ok_or_else(|| anyhow::anyhow!("no user {}", user_id))?;
            println!("{}", create_token(&config.jwt_secret, user.id, &user.username)?);
            return Ok(());
        }
    }

    let state: AppState = Arc::new(AppStateInner {
        db,
        dispatcher: Dispatcher::new(),
        proofs: ProofStorage::new(config.proof_dir.clone()).await?,
        jwt_secret: config.jwt_secret.clone(),
    });

    if config.expiry_sweep_secs > 0 {
        tokio::spawn(sweep::run_expiry_loop(state.clone(), config.expiry_sweep_secs));
        info!("Expiry sweep every {} seconds", config.expiry_sweep_secs);
    } else {
        info!("Expiry sweep disabled; requests expire when voted on");
    }

    let app = classbits_api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Classbits server listening on {}", config.addr);
    let listener = tokio::net::TcpListener::bind(config.addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
