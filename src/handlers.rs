use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::protocol::ChatRequest;
use crate::session;
use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::{Value, json};

pub async fn root() -> Json<Value> {
    Json(json!({ "message": "Hello world!" }))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Response> {
    let req: ChatRequest = serde_json::from_slice(&body).map_err(AppError::invalid_request_body)?;

    let model = state.model_mapper.resolve(&req.model).to_string();
    tracing::info!(
        requested_model = %req.model,
        upstream_model = %model,
        messages = req.messages.len(),
        "received chat request"
    );
    let drain = session::start(state.upstream.clone(), model, req.messages);
    Ok(drain.into_response())
}
