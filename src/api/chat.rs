use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::Json;

use super::routes::AppState;
use super::types::{CancelBody, CancelResponse, ChatBody};
use crate::bridge::{BridgeError, ChatRequest};
use crate::conversation::ConversationKey;
use crate::workspace::{workspace_key, Workspace};

fn required<'a>(name: &str, value: &'a str) -> Result<&'a str, (StatusCode, String)> {
    let value = value.trim();
    if value.is_empty() {
        return Err((StatusCode::BAD_REQUEST, format!("{} is required", name)));
    }
    Ok(value)
}

pub async fn post_chat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatBody>,
) -> Result<Response, (StatusCode, String)> {
    let conversation = ConversationKey::new(
        required("userId", &body.user_id)?,
        required("tabGroupId", &body.tab_group_id)?,
        required("tabId", &body.tab_id)?,
    );
    required("prompt", &body.prompt)?;
    let workspace = Workspace::resolve(&state.config.workspaces_root, &body.workspace)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let model = body
        .model
        .filter(|m| !m.trim().is_empty())
        .or_else(|| state.config.default_model.clone());

    let stream = state
        .bridge
        .start(ChatRequest {
            conversation,
            workspace,
            prompt: body.prompt,
            model,
        })
        .map_err(|e| match e {
            BridgeError::Busy(_) => (StatusCode::CONFLICT, e.to_string()),
        })?;

    let request_id = stream.request_id().to_string();
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-request-id", request_id)
        .body(Body::from_stream(stream.into_ndjson()))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

pub async fn post_cancel(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CancelBody>,
) -> Result<Json<CancelResponse>, (StatusCode, String)> {
    if let Some(request_id) = body.request_id.filter(|id| !id.trim().is_empty()) {
        let ok = state.bridge.cancel(request_id.trim()).await;
        let cancelled = if ok { vec![request_id] } else { Vec::new() };
        return Ok(Json(CancelResponse { ok, cancelled }));
    }

    let (Some(user_id), Some(tab_group_id), Some(tab_id), Some(workspace)) =
        (body.user_id, body.tab_group_id, body.tab_id, body.workspace)
    else {
        return Err((
            StatusCode::BAD_REQUEST,
            "requestId, or userId, tabGroupId, tabId and workspace are required".to_string(),
        ));
    };

    let conversation = ConversationKey::new(
        required("userId", &user_id)?,
        required("tabGroupId", &tab_group_id)?,
        required("tabId", &tab_id)?,
    );
    let workspace = workspace_key(&workspace).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let cancelled = state
        .bridge
        .cancel_conversation(&conversation, &workspace)
        .await;
    Ok(Json(CancelResponse {
        ok: !cancelled.is_empty(),
        cancelled,
    }))
}
