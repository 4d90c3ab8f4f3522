use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
};

use crate::auth::AppState;
use crate::middleware::require_auth;
use crate::storage::MAX_PROOF_SIZE;
use crate::{notifications, siphon};

/// Every route the service exposes. Layers that only the binary cares about
/// (CORS, request tracing) are added by the caller.
pub fn router(state: AppState) -> Router {
    let siphon_routes = Router::new()
        .route("/group/{group_id}/create", post(siphon::create_siphon))
        .route("/group/{group_id}", get(siphon::list_group_siphons))
        .route("/{id}", get(siphon::get_siphon))
        .route("/{id}/vote", post(siphon::cast_vote))
        .route("/{id}/teacher-reject", post(siphon::teacher_reject))
        .route("/{id}/teacher-approve", post(siphon::teacher_approve))
        .route("/{id}/proof", get(siphon::download_proof))
        // Room for the proof plus the text fields around it
        .layer(DefaultBodyLimit::max(MAX_PROOF_SIZE + 64 * 1024));

    let protected_routes = Router::new()
        .nest("/api/siphon", siphon_routes)
        .route("/notifications", get(notifications::list))
        .route("/notifications/read", post(notifications::mark_read))
        .route("/notifications/stream", get(notifications::stream))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(protected_routes)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
        response::Response,
    };
    use chrono::{Duration, Utc};
    use serde_json::{Value, json};
    use tower::ServiceExt;
    use uuid::Uuid;

    use classbits_db::Database;
    use classbits_notify::Dispatcher;
    use classbits_types::models::{MemberStatus, Role};

    use super::*;
    use crate::auth::{AppStateInner, create_token};
    use crate::storage::ProofStorage;

    const SECRET: &str = "route-test-secret";

    struct Harness {
        app: Router,
        state: AppState,
        _dir: tempfile::TempDir,
        group: Uuid,
        teacher: Uuid,
        target: Uuid,
        voters: Vec<Uuid>,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let (classroom, group_set, group) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        db.create_classroom(classroom, "Period 5", 72).unwrap();
        db.create_group_set(group_set, classroom, "Lab Teams").unwrap();
        db.create_group(group, group_set, "Team Osprey").unwrap();

        let teacher = Uuid::new_v4();
        db.create_user(teacher, "mr_keating", Role::Teacher).unwrap();
        db.add_classroom_teacher(classroom, teacher).unwrap();

        let target = Uuid::new_v4();
        db.create_user(target, "mallory", Role::Student).unwrap();
        db.upsert_group_member(group, target, MemberStatus::Approved).unwrap();
        db.deposit(target, Some(classroom), 100, "Starting bits", Some(teacher)).unwrap();

        let voters: Vec<Uuid> = (0..2)
            .map(|i| {
                let id = Uuid::new_v4();
                db.create_user(id, &format!("voter{}", i), Role::Student).unwrap();
                db.upsert_group_member(group, id, MemberStatus::Approved).unwrap();
                id
            })
            .collect();

        let state: AppState = Arc::new(AppStateInner {
            db,
            dispatcher: Dispatcher::new(),
            proofs: ProofStorage::new(dir.path().join("proofs")).await.unwrap(),
            jwt_secret: SECRET.to_string(),
        });

        Harness {
            app: router(state.clone()),
            state,
            _dir: dir,
            group,
            teacher,
            target,
            voters,
        }
    }

    fn bearer(user: Uuid) -> String {
        format!("Bearer {}", create_token(SECRET, user, "someone").unwrap())
    }

    fn post_json(uri: &str, user: Uuid, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::AUTHORIZATION, bearer(user))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_as(uri: &str, user: Uuid) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, bearer(user))
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    impl Harness {
        async fn send(&self, req: Request<Body>) -> Response {
            self.app.clone().oneshot(req).await.unwrap()
        }

        async fn open_siphon(&self, amount: i64) -> Uuid {
            let response = self
                .send(post_json(
                    &format!("/api/siphon/group/{}/create", self.group),
                    self.voters[0],
                    json!({ "targetUserId": self.target, "reason": "Never shares", "amount": amount }),
                ))
                .await;
            assert_eq!(response.status(), StatusCode::CREATED);
            json_body(response).await["id"].as_str().unwrap().parse().unwrap()
        }
    }

    #[tokio::test]
    async fn health_is_public() {
        let h = harness().await;
        let response = h
            .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn siphon_routes_require_a_valid_token() {
        let h = harness().await;
        let response = h
            .send(
                Request::builder()
                    .uri(format!("/api/siphon/group/{}", h.group))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let forged = create_token("some-other-secret", h.voters[0], "voter0").unwrap();
        let response = h
            .send(
                Request::builder()
                    .uri(format!("/api/siphon/group/{}", h.group))
                    .header(header::AUTHORIZATION, format!("Bearer {}", forged))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn create_vote_and_approve_over_http() {
        let h = harness().await;
        let id = h.open_siphon(100).await;

        // A second request in the same group is refused
        let response = h
            .send(post_json(
                &format!("/api/siphon/group/{}/create", h.group),
                h.voters[1],
                json!({ "targetUserId": h.target, "reason": "Again", "amount": 5 }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "ACTIVE_SIPHON_EXISTS");

        let response = h
            .send(post_json(&format!("/api/siphon/{}/vote", id), h.target, json!({ "vote": "no" })))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = h
            .send(post_json(&format!("/api/siphon/{}/vote", id), h.voters[0], json!({ "vote": "yes" })))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "group_approved");
        assert_eq!(body["votingProgress"]["majorityThreshold"], 1);
        assert_eq!(body["votingProgress"]["needsMoreVotes"], false);

        // Voting is closed now
        let response = h
            .send(post_json(&format!("/api/siphon/{}/vote", id), h.voters[1], json!({ "vote": "no" })))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = h
            .send(post_json(&format!("/api/siphon/{}/teacher-approve", id), h.voters[0], json!({})))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = h
            .send(post_json(&format!("/api/siphon/{}/teacher-approve", id), h.teacher, json!({})))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "teacher_approved");

        let response = h
            .send(post_json(&format!("/api/siphon/{}/teacher-reject", id), h.teacher, json!({})))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = h.send(get_as(&format!("/api/siphon/group/{}", h.group), h.teacher)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await.as_array().unwrap().len(), 1);

        let response = h.send(get_as("/notifications", h.target)).await;
        let listed = json_body(response).await;
        assert_eq!(listed[0]["kind"], "siphon_bits_lost");
    }

    #[tokio::test]
    async fn expired_vote_reports_bad_request_and_commits_expiry() {
        let h = harness().await;
        let id = h.open_siphon(10).await;

        // Push the deadline into the past
        h.state
            .db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE siphon_requests SET expires_at = ?1 WHERE id = ?2",
                    (classbits_db::ts(Utc::now() - Duration::hours(1)), id.to_string()),
                )?;
                Ok(())
            })
            .unwrap();

        let response = h
            .send(post_json(&format!("/api/siphon/{}/vote", id), h.voters[1], json!({ "vote": "yes" })))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "SIPHON_EXPIRED");

        let response = h.send(get_as(&format!("/api/siphon/{}", id), h.voters[1])).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "expired");
        assert_eq!(body["votingProgress"]["totalVotes"], 0);
    }

    #[tokio::test]
    async fn malformed_bodies_are_validation_errors() {
        let h = harness().await;
        let response = h
            .send(post_json(
                &format!("/api/siphon/group/{}/create", h.group),
                h.voters[0],
                json!({ "targetUserId": h.target, "reason": "x", "amount": "lots" }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "VALIDATION_ERROR");

        let response = h
            .send(post_json(
                &format!("/api/siphon/group/{}/create", Uuid::new_v4()),
                h.voters[0],
                json!({ "targetUserId": h.target, "reason": "x", "amount": 5 }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn multipart_create_stores_and_serves_the_proof() {
        let h = harness().await;
        let boundary = "X-CLASSBITS-BOUNDARY";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"targetUserId\"\r\n\r\n{target}\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"reason\"\r\n\r\n<p>See attached</p>\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"amount\"\r\n\r\n30\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"proof\"; filename=\"chat.txt\"\r\n\
             Content-Type: text/plain\r\n\r\nscreenshot text\r\n\
             --{b}--\r\n",
            b = boundary,
            target = h.target,
        );
        let response = h
            .send(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/siphon/group/{}/create", h.group))
                    .header(header::AUTHORIZATION, bearer(h.voters[0]))
                    .header(
                        header::CONTENT_TYPE,
                        format!("multipart/form-data; boundary={}", boundary),
                    )
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = json_body(response).await;
        assert_eq!(created["proof"]["originalName"], "chat.txt");
        assert_eq!(created["proof"]["size"], 15);
        let id = created["id"].as_str().unwrap().to_string();

        let response = h.send(get_as(&format!("/api/siphon/{}/proof", id), h.teacher)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"chat.txt\""
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"screenshot text");

        let outsider = Uuid::new_v4();
        h.state.db.create_user(outsider, "eve", Role::Student).unwrap();
        let response = h.send(get_as(&format!("/api/siphon/{}/proof", id), outsider)).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
