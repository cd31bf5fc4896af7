use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

/// Failures the chat core can report, server side and client side alike.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("authentication required")]
    Unauthenticated,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("only the sender may delete this message")]
    Forbidden,
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),
}

impl ChatError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let Self::StoreUnavailable(e) = &self {
            error!("Store error while handling request: {}", e);
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Failures seen from the client side of the HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("authentication required")]
    Unauthenticated,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("only the sender may delete this message")]
    Forbidden,
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("chat service unavailable: {0}")]
    Unavailable(String),
}

impl ClientError {
    /// Maps an error response back onto the server's taxonomy.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 => Self::Unauthenticated,
            403 => Self::Forbidden,
            404 => Self::NotFound(message),
            400 | 422 => Self::Validation(message),
            _ => Self::Unavailable(message),
        }
    }

    /// Whether retrying the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<ChatError> for ClientError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Unauthenticated => Self::Unauthenticated,
            ChatError::NotFound(what) => Self::NotFound(what),
            ChatError::Forbidden => Self::Forbidden,
            ChatError::Validation(why) => Self::Validation(why),
            ChatError::StoreUnavailable(e) => Self::Unavailable(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_taxonomy() {
        assert_eq!(ChatError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ChatError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(ChatError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(ChatError::Validation("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ChatError::StoreUnavailable(sqlx::Error::PoolTimedOut).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn client_errors_mirror_statuses() {
        assert_eq!(ClientError::from_status(401, String::new()), ClientError::Unauthenticated);
        assert_eq!(ClientError::from_status(403, String::new()), ClientError::Forbidden);
        assert_eq!(
            ClientError::from_status(404, "message 1".into()),
            ClientError::NotFound("message 1".into())
        );
        assert_eq!(
            ClientError::from_status(400, "bad".into()),
            ClientError::Validation("bad".into())
        );
        assert!(ClientError::from_status(503, "down".into()).is_transient());
        assert!(ClientError::from_status(500, "boom".into()).is_transient());
        assert!(!ClientError::Forbidden.is_transient());
    }
}
