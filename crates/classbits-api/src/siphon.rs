//! HTTP handlers under `/api/siphon`.

use axum::{
    Extension, Json,
    body::Body,
    extract::{FromRequest, Multipart, Path, Request, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::IntoResponse,
};
use chrono::Utc;
use tokio_util::io::ReaderStream;
use tracing::{error, warn};
use uuid::Uuid;

use classbits_db::Database;
use classbits_types::api::{CastVoteRequest, Claims, CreateSiphonRequest, SiphonDetailResponse};
use classbits_types::models::{ProofMeta, SiphonRequest};

use crate::auth::AppState;
use crate::error::{ApiError, ApiResult};
use crate::storage::MAX_PROOF_SIZE;
use crate::workflow::{self, NewSiphon, VoteOutcome, WorkflowResult};

/// Run a workflow call on the blocking pool.
async fn blocking<T, F>(state: &AppState, f: F) -> ApiResult<T>
where
    F: FnOnce(&Database) -> WorkflowResult<T> + Send + 'static,
    T: Send + 'static,
{
    let state = state.clone();
    tokio::task::spawn_blocking(move || f(&state.db))
        .await
        .map_err(|e| ApiError::internal(format!("spawn_blocking join error: {}", e)))?
        .map_err(ApiError::from)
}

/// POST /api/siphon/group/{group_id}/create
///
/// Accepts `application/json`, or `multipart/form-data` with the same fields
/// as text parts and an optional `proof` file part.
pub async fn create_siphon(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    req: Request,
) -> ApiResult<impl IntoResponse> {
    let is_multipart = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    let (body, proof) = if is_multipart {
        let multipart = Multipart::from_request(req, &state)
            .await
            .map_err(|e| ApiError::Validation(e.body_text()))?;
        read_multipart(&state, multipart).await?
    } else {
        let Json(body) = Json::<CreateSiphonRequest>::from_request(req, &state)
            .await
            .map_err(|e| ApiError::Validation(e.body_text()))?;
        (body, None)
    };

    let stored = proof.as_ref().map(|p| p.stored_name.clone());
    let new = NewSiphon {
        group_id,
        requested_by: claims.sub,
        target_user: body.target_user_id,
        reason: body.reason,
        amount: body.amount,
        proof,
    };
    let result = blocking(&state, move |db| workflow::create(db, new, Utc::now())).await;

    match result {
        Ok(committed) => {
            state.dispatcher.publish(committed.notifications);
            Ok((StatusCode::CREATED, Json(committed.value)))
        }
        Err(e) => {
            // Nothing references the stored proof now
            if let Some(name) = stored {
                if let Err(del) = state.proofs.delete(&name).await {
                    warn!("Failed to remove orphaned proof {}: {}", name, del);
                }
            }
            Err(e)
        }
    }
}

async fn read_multipart(
    state: &AppState,
    mut multipart: Multipart,
) -> ApiResult<(CreateSiphonRequest, Option<ProofMeta>)> {
    let mut target_user_id = None;
    let mut reason = None;
    let mut amount = None;
    let mut upload: Option<(String, String, bytes::Bytes)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "proof" => {
                let file_name = field.file_name().unwrap_or("proof").to_string();
                let mime = field.content_type().unwrap_or_default().to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::Validation(e.body_text()))?;
                if data.len() > MAX_PROOF_SIZE {
                    return Err(ApiError::Validation("proof file exceeds 10 MiB".into()));
                }
                if !data.is_empty() {
                    upload = Some((file_name, mime, data));
                }
            }
            "targetUserId" | "reason" | "amount" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::Validation(e.body_text()))?;
                match name.as_str() {
                    "targetUserId" => {
                        target_user_id = Some(
                            text.trim()
                                .parse::<Uuid>()
                                .map_err(|_| ApiError::Validation("targetUserId must be a UUID".into()))?,
                        )
                    }
                    "reason" => reason = Some(text),
                    _ => {
                        amount = Some(
                            text.trim()
                                .parse::<i64>()
                                .map_err(|_| ApiError::Validation("amount must be an integer".into()))?,
                        )
                    }
                }
            }
            other => return Err(ApiError::Validation(format!("unexpected field '{}'", other))),
        }
    }

    let body = CreateSiphonRequest {
        target_user_id: target_user_id.ok_or_else(|| ApiError::Validation("targetUserId is required".into()))?,
        reason: reason.ok_or_else(|| ApiError::Validation("reason is required".into()))?,
        amount: amount.ok_or_else(|| ApiError::Validation("amount is required".into()))?,
    };

    let proof = match upload {
        Some((file_name, mime, data)) => Some(state.proofs.save(&file_name, &mime, &data).await.map_err(|e| {
            error!("Failed to store proof: {}", e);
            ApiError::internal("failed to store proof")
        })?),
        None => None,
    };

    Ok((body, proof))
}

/// POST /api/siphon/{id}/vote
pub async fn cast_vote(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    payload: Result<Json<CastVoteRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(body) = payload.map_err(|e| ApiError::Validation(e.body_text()))?;
    let committed = blocking(&state, move |db| workflow::vote(db, id, claims.sub, body.vote, Utc::now())).await?;
    state.dispatcher.publish(committed.notifications);

    match committed.value {
        VoteOutcome::Recorded(response) => Ok(Json(response)),
        VoteOutcome::Expired => Err(ApiError::Expired),
    }
}

/// POST /api/siphon/{id}/teacher-reject
pub async fn teacher_reject(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<SiphonRequest>> {
    let committed = blocking(&state, move |db| workflow::teacher_reject(db, id, claims.sub, Utc::now())).await?;
    state.dispatcher.publish(committed.notifications);
    Ok(Json(committed.value))
}

/// POST /api/siphon/{id}/teacher-approve
pub async fn teacher_approve(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<SiphonRequest>> {
    let committed = blocking(&state, move |db| workflow::teacher_approve(db, id, claims.sub, Utc::now())).await?;
    state.dispatcher.publish(committed.notifications);
    Ok(Json(committed.value.request))
}

/// GET /api/siphon/{id}/proof: streams the stored proof file.
pub async fn download_proof(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let meta = blocking(&state, move |db| workflow::proof_for(db, id, claims.sub)).await?;

    let file = state.proofs.open(&meta.stored_name).await.map_err(|e| {
        error!("Proof {} for siphon {} unreadable: {}", meta.stored_name, id, e);
        ApiError::from(workflow::WorkflowError::NotFound("proof"))
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size));
    if let Ok(disposition) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", meta.original_name)) {
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }

    Ok((headers, Body::from_stream(ReaderStream::new(file))))
}

/// GET /api/siphon/{id}
pub async fn get_siphon(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<SiphonDetailResponse>> {
    let detail = blocking(&state, move |db| workflow::detail(db, id, claims.sub)).await?;
    Ok(Json(detail))
}

/// GET /api/siphon/group/{group_id}
pub async fn list_group_siphons(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<SiphonRequest>>> {
    let list = blocking(&state, move |db| workflow::list_for_group(db, group_id, claims.sub)).await?;
    Ok(Json(list))
}
