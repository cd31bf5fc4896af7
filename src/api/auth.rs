use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};

use crate::{entity::CurrentUser, error::ChatError};

use super::server::ApiState;

/// The caller behind an `Authorization: Bearer <token>` header.
/// Handlers that take this parameter reject anonymous requests with 401.
pub struct AuthUser(pub CurrentUser);

#[async_trait]
impl FromRequestParts<Arc<ApiState>> for AuthUser {
    type Rejection = ChatError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<ApiState>) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(ChatError::Unauthenticated)?;

        state
            .store
            .resolve_session(token)
            .await?
            .map(AuthUser)
            .ok_or(ChatError::Unauthenticated)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
