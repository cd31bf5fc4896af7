use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use super::{auth::AuthUser, extract::ValidJson};
use crate::{
    chat::{parse_conversation_id, ChatMessage, Conversation, MessageRef, ParticipantPair},
    entity::{CurrentUser, Listing, Username},
    error::ChatError,
    store::Store,
};

// -----------------------------------------------------------------------------
// Wire Types
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: CurrentUser,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MeResponse {
    pub user: CurrentUser,
}

/// Full-log replacement. `messages` stays loosely typed so a non-array body
/// is reported as a validation error instead of a generic parse failure.
#[derive(Debug, Deserialize)]
pub struct UpsertRequest {
    #[serde(default, alias = "chat_id")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub messages: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpsertResponse {
    pub success: bool,
    pub message_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppendRequest {
    pub text: String,
    /// Epoch milliseconds; the server clock is used when absent.
    #[serde(default, alias = "timestamp")]
    pub time: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppendResponse {
    pub success: bool,
    pub message_count: usize,
    pub message: ChatMessage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub message_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NewListingRequest {
    pub title: String,
    pub author: String,
    pub price: f64,
}

// -----------------------------------------------------------------------------
// Server State
// -----------------------------------------------------------------------------

pub struct ApiState {
    pub store: Store,
}

// -----------------------------------------------------------------------------
// Implementation
// -----------------------------------------------------------------------------

pub struct ApiServer {
    store: Store,
}

impl ApiServer {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(ApiState {
            store: self.store.clone(),
        });

        Router::new()
            .route("/api/session", post(login_handler))
            .route("/api/me", get(me_handler))
            .route("/api/chats", get(list_chats_handler).post(upsert_chat_handler))
            .route("/api/chats/:conversation_id", get(get_chat_handler))
            .route("/api/chats/:conversation_id/messages", post(append_message_handler))
            .route(
                "/api/chats/:conversation_id/messages/:message_ref",
                delete(delete_message_handler),
            )
            .route("/api/books", get(list_books_handler).post(create_book_handler))
            .route("/api/books/:id", delete(delete_book_handler))
            .route("/api/books/:id/chat", post(open_book_chat_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }
}

async fn login_handler(
    State(state): State<Arc<ApiState>>,
    ValidJson(request): ValidJson<LoginRequest>,
) -> Result<Json<LoginResponse>, ChatError> {
    let email = request.email.trim();
    if !email.contains('@') {
        return Err(ChatError::Validation("a valid email is required".into()));
    }

    let user = CurrentUser {
        username: Username::parse(request.username)?,
        email: email.to_string(),
    };
    let token = state.store.create_session(&user).await?;

    Ok(Json(LoginResponse { token, user }))
}

async fn me_handler(AuthUser(user): AuthUser) -> Json<MeResponse> {
    Json(MeResponse { user })
}

async fn list_chats_handler(
    State(state): State<Arc<ApiState>>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<Conversation>>, ChatError> {
    let conversations = state.store.list_for_participant(&user.username).await?;
    Ok(Json(conversations))
}

async fn get_chat_handler(
    State(state): State<Arc<ApiState>>,
    AuthUser(_user): AuthUser,
    Path(conversation_id): Path<String>,
) -> Result<Json<Conversation>, ChatError> {
    let conversation = state.store.fetch_or_materialize(&conversation_id).await?;
    Ok(Json(conversation))
}

async fn upsert_chat_handler(
    State(state): State<Arc<ApiState>>,
    AuthUser(user): AuthUser,
    ValidJson(request): ValidJson<UpsertRequest>,
) -> Result<Json<UpsertResponse>, ChatError> {
    let conversation_id = request
        .conversation_id
        .ok_or_else(|| ChatError::Validation("conversation_id is required".into()))?;

    let messages: Vec<ChatMessage> = match request.messages {
        Some(value @ Value::Array(_)) => serde_json::from_value(value)
            .map_err(|e| ChatError::Validation(format!("malformed message: {}", e)))?,
        _ => return Err(ChatError::Validation("messages must be an array".into())),
    };

    let message_count = state
        .store
        .upsert(&user.username, &conversation_id, &request.participants, messages)
        .await?;

    Ok(Json(UpsertResponse {
        success: true,
        message_count,
    }))
}

async fn append_message_handler(
    State(state): State<Arc<ApiState>>,
    AuthUser(user): AuthUser,
    Path(conversation_id): Path<String>,
    ValidJson(request): ValidJson<AppendRequest>,
) -> Result<Json<AppendResponse>, ChatError> {
    let pair = parse_conversation_id(&conversation_id)
        .ok_or_else(|| ChatError::Validation(format!("'{}' is not a canonical conversation id", conversation_id)))?;

    let time = request.time.unwrap_or_else(|| Utc::now().timestamp_millis());
    let message = ChatMessage::new(&user.username, request.text.trim(), time);
    let message_count = state.store.append_message(&pair, &message).await?;

    Ok(Json(AppendResponse {
        success: true,
        message_count,
        message,
    }))
}

async fn delete_message_handler(
    State(state): State<Arc<ApiState>>,
    AuthUser(user): AuthUser,
    Path((conversation_id, message_ref)): Path<(String, String)>,
) -> Result<Json<DeleteResponse>, ChatError> {
    let reference: MessageRef = message_ref.parse()?;
    let message_count = state
        .store
        .delete_message(&user.username, &conversation_id, &reference)
        .await?;

    Ok(Json(DeleteResponse {
        success: true,
        message_count,
    }))
}

async fn list_books_handler(State(state): State<Arc<ApiState>>) -> Result<Json<Vec<Listing>>, ChatError> {
    Ok(Json(state.store.list_listings().await?))
}

async fn create_book_handler(
    State(state): State<Arc<ApiState>>,
    AuthUser(user): AuthUser,
    ValidJson(request): ValidJson<NewListingRequest>,
) -> Result<Json<Listing>, ChatError> {
    let title = request.title.trim();
    let author = request.author.trim();
    if title.is_empty() || author.is_empty() || request.price <= 0.0 {
        return Err(ChatError::Validation("title, author, and price are required".into()));
    }

    let listing = state.store.create_listing(&user.username, title, author, request.price).await?;
    info!("{} listed '{}' (#{})", user.username, listing.title, listing.id);
    Ok(Json(listing))
}

async fn delete_book_handler(
    State(state): State<Arc<ApiState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ChatError> {
    state.store.delete_listing(&user.username, id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// Opens the buyer-seller conversation for a listing. The listing only
/// supplies the seller; the id is the participant pair alone.
async fn open_book_chat_handler(
    State(state): State<Arc<ApiState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Conversation>, ChatError> {
    let listing = state
        .store
        .get_listing(id)
        .await?
        .ok_or_else(|| ChatError::NotFound(format!("listing {}", id)))?;

    let pair = ParticipantPair::new(user.username, listing.seller)?;
    let conversation = state.store.fetch_or_materialize(&pair.conversation_id()).await?;
    Ok(Json(conversation))
}

/// Serves a router over `store` on an ephemeral local port.
#[cfg(test)]
pub(crate) async fn spawn_for_tests(store: Store) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = ApiServer::new(store).router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}
