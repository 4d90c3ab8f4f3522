use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use classbits_api::auth::AppState;
use classbits_api::workflow;

/// Background task that expires pending siphon requests past their deadline.
///
/// Votes already expire a request lazily; the sweep covers groups where
/// nobody votes again.
pub async fn run_expiry_loop(state: AppState, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        match sweep_once(&state).await {
            Ok(0) => {}
            Ok(count) => info!("Sweep: expired {} siphon requests", count),
            Err(e) => warn!("Sweep error: {}", e),
        }
    }
}

async fn sweep_once(state: &AppState) -> anyhow::Result<usize> {
    let db = state.clone();
    let committed = tokio::task::spawn_blocking(move || workflow::expire_stale(&db.db, Utc::now())).await??;
    state.dispatcher.publish(committed.notifications);
    Ok(committed.value)
}
