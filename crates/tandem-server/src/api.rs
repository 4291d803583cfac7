//! Request/response chat API.
//!
//! Every route requires `Authorization: Bearer <token>`. Successful bodies are
//! wrapped as `{"data": ...}`, failures as `{"error": ..., "code": ...}`.

use crate::handlers::AppState;
use crate::metrics;
use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tandem_core::{parse_conversation_id, AuthenticatedUser, ChatError, ErrorKind, UserId};
use tracing::{error, warn};

/// Build the `/api/chat` routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/chat/conversations",
            post(create_conversation).get(list_conversations),
        )
        .route(
            "/api/chat/conversations/:id/messages",
            get(list_messages).post(send_message),
        )
        .route("/api/chat/conversations/:id/read", put(mark_read))
        .route("/api/chat/users/online", get(reachable_users))
}

/// Response envelope.
#[derive(Debug, Serialize)]
pub struct Data<T> {
    pub data: T,
}

fn data<T: Serialize>(value: T) -> Json<Data<T>> {
    Json(Data { data: value })
}

/// A [`ChatError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::NotAuthorized => StatusCode::FORBIDDEN,
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        };
        if kind == ErrorKind::Transient {
            error!(error = %self.0, "Store failure on request path");
        }
        metrics::record_error(kind.as_str());

        (
            status,
            Json(serde_json::json!({
                "error": self.0.to_string(),
                "code": kind.as_str(),
            })),
        )
            .into_response()
    }
}

/// Extract a bearer token from request headers.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// The verified caller of a request.
#[derive(Debug, Clone)]
pub struct Caller(pub AuthenticatedUser);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(ChatError::Unauthenticated)?;
        let user = state.hub.authenticate(token).map_err(|e| {
            warn!(path = %parts.uri.path(), "Rejected request token");
            ChatError::from(e)
        })?;
        Ok(Caller(user))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversation {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SendMessage {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct MarkedRead {
    pub updated: u64,
}

/// POST /api/chat/conversations - Create or fetch the conversation with a user.
async fn create_conversation(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Json(body): Json<CreateConversation>,
) -> Result<impl IntoResponse, ApiError> {
    let peer = body.user_id.trim();
    if peer.is_empty() {
        return Err(ChatError::MalformedId(body.user_id).into());
    }
    let conversation = state
        .hub
        .gateway()
        .get_or_create(&caller, &UserId::from(peer))
        .await?;
    Ok(data(conversation))
}

/// GET /api/chat/conversations - The caller's conversations, newest first.
async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
) -> Result<impl IntoResponse, ApiError> {
    let conversations = state.hub.gateway().list(&caller).await?;
    Ok(data(conversations))
}

/// GET /api/chat/conversations/:id/messages - Messages, oldest first.
async fn list_messages(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = parse_conversation_id(&id)?;
    let messages = state
        .hub
        .gateway()
        .list_messages(&caller, conversation)
        .await?;
    Ok(data(messages))
}

/// POST /api/chat/conversations/:id/messages - Send a message.
async fn send_message(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    Json(body): Json<SendMessage>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = parse_conversation_id(&id)?;
    let message = state
        .hub
        .gateway()
        .send_message(&caller, conversation, &body.text)
        .await?;
    metrics::record_message_sent("request");
    Ok((StatusCode::CREATED, data(message)))
}

/// PUT /api/chat/conversations/:id/read - Mark all messages read.
async fn mark_read(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = parse_conversation_id(&id)?;
    let updated = state.hub.gateway().mark_read(&caller, conversation).await?;
    Ok(data(MarkedRead { updated }))
}

/// GET /api/chat/users/online - Users the caller can reach, online first.
async fn reachable_users(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
) -> Result<impl IntoResponse, ApiError> {
    let users = state.hub.gateway().reachable_users(&caller).await?;
    Ok(data(users))
}
