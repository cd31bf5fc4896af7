use axum::{
    extract::{FromRequest, Request},
    Json,
};
use serde::de::DeserializeOwned;

use crate::error::ChatError;

/// `Json<T>` whose rejections are reported as validation errors, so a missing
/// or mistyped field gets the same `{ "error": .. }` 400 as any other bad input.
pub struct ValidJson<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ChatError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ChatError::Validation(rejection.body_text()))?;
        Ok(Self(value))
    }
}
