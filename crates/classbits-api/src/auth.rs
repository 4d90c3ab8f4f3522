use std::sync::Arc;

use jsonwebtoken::{EncodingKey, Header, encode};
use uuid::Uuid;

use classbits_db::Database;
use classbits_notify::Dispatcher;
use classbits_types::api::Claims;

use crate::storage::ProofStorage;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Database,
    pub dispatcher: Dispatcher,
    pub proofs: ProofStorage,
    pub jwt_secret: String,
}

/// Issue a bearer token for `user_id`. Login lives outside this service;
/// the server uses this for tooling and tests use it to call the routes.
pub fn create_token(secret: &str, user_id: Uuid, username: &str) -> jsonwebtoken::errors::Result<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}
