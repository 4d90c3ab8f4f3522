use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Extension, Json,
    extract::{Query, State},
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures_util::Stream;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error};

use classbits_types::api::{Claims, NotificationResponse};

use crate::auth::AppState;
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<u32>,
}

/// GET /notifications: newest first, at most 200.
pub async fn list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<NotificationResponse>>> {
    let limit = query.limit.unwrap_or(50).min(200);
    let db = state.clone();
    let rows = tokio::task::spawn_blocking(move || db.db.notifications_for(claims.sub, limit))
        .await
        .map_err(|e| ApiError::internal(format!("spawn_blocking join error: {}", e)))?
        .map_err(|e| ApiError::internal(format!("list notifications: {}", e)))?;
    Ok(Json(rows))
}

/// POST /notifications/read: marks everything read.
pub async fn mark_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let db = state.clone();
    let updated = tokio::task::spawn_blocking(move || db.db.mark_notifications_read(claims.sub))
        .await
        .map_err(|e| ApiError::internal(format!("spawn_blocking join error: {}", e)))?
        .map_err(|e| ApiError::internal(format!("mark notifications read: {}", e)))?;
    Ok(Json(json!({ "updated": updated })))
}

/// GET /notifications/stream: server-sent events, one `notification` event
/// per committed notification addressed to the caller.
pub async fn stream(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut subscription = state.dispatcher.subscribe(claims.sub);
    debug!("{} subscribed to notifications", claims.username);

    let events = async_stream::stream! {
        while let Some(n) = subscription.next().await {
            let payload = NotificationResponse {
                id: n.id,
                kind: n.kind.as_str().to_string(),
                message: n.message,
                siphon_id: Some(n.siphon_id),
                classroom_id: Some(n.classroom_id),
                read: false,
                created_at: n.created_at,
            };
            match Event::default().event("notification").json_data(&payload) {
                Ok(event) => yield Ok(event),
                Err(e) => error!("Failed to encode notification {}: {}", payload.id, e),
            }
        }
    };

    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
