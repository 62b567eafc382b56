//! REST handlers for session lifecycle. Grounded on the daemon's
//! `rest/routes/sessions.rs` and `rest/routes/health.rs`, retargeted at
//! `SessionManager` instead of the daemon's JSON-RPC `ipc::handlers`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::SupervisorError;
use crate::events::{ApprovalDecision, PermissionMode};
use crate::AppContext;

type ApiResult<T> = Result<T, (StatusCode, Json<Value>)>;

fn status_for(err: &SupervisorError) -> StatusCode {
    match err {
        SupervisorError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        SupervisorError::ClaimConflict(_) | SupervisorError::SessionEnded(_) => StatusCode::CONFLICT,
        SupervisorError::AtCapacity { .. } => StatusCode::TOO_MANY_REQUESTS,
        SupervisorError::UnknownAgentKind(_) => StatusCode::BAD_REQUEST,
        SupervisorError::ApprovalNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn err_response(e: SupervisorError) -> (StatusCode, Json<Value>) {
    (status_for(&e), Json(json!({ "error": e.to_string() })))
}

pub async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": ctx.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn list_sessions(State(ctx): State<Arc<AppContext>>) -> ApiResult<Json<Value>> {
    let rows = ctx.session_manager.list_sessions().await.map_err(err_response)?;
    let list: Vec<Value> = rows
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "kind": r.kind,
                "cwd": r.cwd,
                "status": r.status(),
                "model": r.model,
                "started_at": r.started_at,
                "last_active_at": r.last_active_at,
            })
        })
        .collect();
    Ok(Json(json!({ "sessions": list })))
}

pub async fn get_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let r = ctx.session_manager.get_session(&id).await.map_err(err_response)?;
    Ok(Json(json!({
        "id": r.id,
        "kind": r.kind,
        "cwd": r.cwd,
        "status": r.status(),
        "session_ref": r.session_ref,
        "model": r.model,
        "permission_mode": r.permission_mode(),
        "total_cost_usd": r.total_cost_usd,
        "total_turns": r.total_turns,
        "started_at": r.started_at,
        "last_active_at": r.last_active_at,
        "ended_at": r.ended_at,
    })))
}

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub kind: String,
    pub cwd: PathBuf,
    pub initial_prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "crate::session::runner::default_permission_mode")]
    pub permission_mode: PermissionMode,
}

pub async fn create_session(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateSessionRequest>,
) -> ApiResult<Json<Value>> {
    let id = ctx
        .session_manager
        .create_session(body.kind, body.cwd, body.initial_prompt, body.model, body.permission_mode)
        .await
        .map_err(err_response)?;
    Ok(Json(json!({ "id": id })))
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
    #[serde(default)]
    pub image_ref: Option<String>,
}

pub async fn send_message(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(body): Json<SendMessageRequest>,
) -> ApiResult<Json<Value>> {
    ctx.session_manager
        .send_message(&id, body.text, body.image_ref)
        .await
        .map_err(err_response)?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn cancel_session(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    ctx.session_manager.cancel_session(&id).await.map_err(err_response)?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn interrupt_session(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    ctx.session_manager.interrupt_session(&id).await.map_err(err_response)?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
pub struct ResolveApprovalRequest {
    pub approval_id: String,
    pub decision: ApprovalDecision,
    #[serde(default)]
    pub updated_input: Option<Value>,
    #[serde(default)]
    pub post_approval_mode: Option<PermissionMode>,
    #[serde(default)]
    pub clear_context_restart: bool,
}

pub async fn resolve_approval(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(body): Json<ResolveApprovalRequest>,
) -> ApiResult<Json<Value>> {
    ctx.session_manager
        .resolve_approval(
            &id,
            body.approval_id,
            body.decision,
            body.updated_input,
            body.post_approval_mode,
            body.clear_context_restart,
        )
        .await
        .map_err(err_response)?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
pub struct AnswerQuestionRequest {
    pub request_id: String,
    pub answers: Vec<String>,
}

pub async fn answer_question(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(body): Json<AnswerQuestionRequest>,
) -> ApiResult<Json<Value>> {
    ctx.session_manager
        .answer_question(&id, body.request_id, body.answers)
        .await
        .map_err(err_response)?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
pub struct SetPermissionModeRequest {
    pub mode: PermissionMode,
}

pub async fn set_permission_mode(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(body): Json<SetPermissionModeRequest>,
) -> ApiResult<Json<Value>> {
    ctx.session_manager
        .set_permission_mode(&id, body.mode)
        .await
        .map_err(err_response)?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
pub struct SetModelRequest {
    pub model: String,
}

pub async fn set_model(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(body): Json<SetModelRequest>,
) -> ApiResult<Json<Value>> {
    ctx.session_manager.set_model(&id, body.model).await.map_err(err_response)?;
    Ok(Json(json!({ "ok": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_domain_errors_to_the_right_status_codes() {
        assert_eq!(
            status_for(&SupervisorError::SessionNotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&SupervisorError::ApprovalNotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&SupervisorError::ClaimConflict("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&SupervisorError::SessionEnded("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&SupervisorError::AtCapacity { running: 1, max: 1 }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(&SupervisorError::UnknownAgentKind("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&SupervisorError::Other(anyhow::anyhow!("boom"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn err_response_embeds_the_display_message() {
        let (status, Json(body)) = err_response(SupervisorError::SessionNotFound("abc".into()));
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], json!(SupervisorError::SessionNotFound("abc".into()).to_string()));
    }
}
