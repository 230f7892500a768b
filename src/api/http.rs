//! JSON request handlers.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::AppState;
use crate::collaboration::{DecisionRequest, InviteRequest};
use crate::error::{parse_id, AppResult};
use crate::session::parse_user_id;
use crate::share::{BulkShareRequest, CodeShareRequest, FileShareRequest, ShareReceipt};
use crate::vcs::service::ConflictDecision;
use crate::vcs::{CommitRequest, DeleteRequest};

type JsonResult = AppResult<Json<Value>>;

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    #[serde(default)]
    user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    #[serde(default)]
    project_id: String,
    #[serde(default)]
    file_path: String,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ProjectQuery {
    #[serde(default)]
    project_id: String,
    limit: Option<usize>,
    file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    #[serde(default, alias = "version_id", alias = "conflict_id")]
    id: String,
}

#[derive(Debug, Deserialize)]
pub struct RequestsQuery {
    #[serde(default, alias = "user_email")]
    user: String,
}

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    #[serde(default, alias = "owner_email")]
    owner: String,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "online_users": state.presence.online_count(),
        "dispatch": state.dispatcher.stats(),
        "storage": state.store.stats(),
    }))
}

pub async fn online_users(State(state): State<Arc<AppState>>) -> Json<Value> {
    let users = state.presence.list_online();
    Json(json!({
        "success": true,
        "count": users.len(),
        "online_users": users,
    }))
}

pub async fn user_status(State(state): State<Arc<AppState>>, Query(query): Query<UserQuery>) -> JsonResult {
    let user_id = parse_user_id(&query.user_id)?;
    Ok(Json(json!({
        "success": true,
        "user_id": user_id,
        "is_online": state.presence.is_online(user_id),
    })))
}

pub async fn commit(State(state): State<Arc<AppState>>, Json(request): Json<CommitRequest>) -> JsonResult {
    let version = state.vcs.commit(request).await?;
    Ok(Json(json!({
        "success": true,
        "message": "File committed successfully",
        "version": version,
    })))
}

pub async fn delete_file(State(state): State<Arc<AppState>>, Json(request): Json<DeleteRequest>) -> JsonResult {
    let version = state.vcs.delete_file(request).await?;
    Ok(Json(json!({
        "success": true,
        "message": "File deleted successfully",
        "version": version,
    })))
}

pub async fn file_history(State(state): State<Arc<AppState>>, Query(query): Query<FileQuery>) -> JsonResult {
    let project_id = parse_id("project_id", &query.project_id)?;
    let versions = state.vcs.file_history(
        project_id,
        &query.file_path,
        query.limit,
        query.offset.unwrap_or(0),
    )?;
    Ok(Json(json!({
        "success": true,
        "file_path": query.file_path,
        "count": versions.len(),
        "versions": versions,
    })))
}

pub async fn latest_version(State(state): State<Arc<AppState>>, Query(query): Query<FileQuery>) -> JsonResult {
    let project_id = parse_id("project_id", &query.project_id)?;
    let version = state.vcs.latest(project_id, &query.file_path)?;
    Ok(Json(json!({ "success": true, "version": version })))
}

pub async fn version_by_id(State(state): State<Arc<AppState>>, Query(query): Query<IdQuery>) -> JsonResult {
    let version = state.vcs.version(parse_id("version_id", &query.id)?)?;
    Ok(Json(json!({ "success": true, "version": version })))
}

pub async fn project_versions(State(state): State<Arc<AppState>>, Query(query): Query<ProjectQuery>) -> JsonResult {
    let project_id = parse_id("project_id", &query.project_id)?;
    let versions = state.vcs.project_versions(project_id, query.limit)?;
    Ok(Json(json!({
        "success": true,
        "count": versions.len(),
        "versions": versions,
    })))
}

pub async fn pending_conflicts(State(state): State<Arc<AppState>>, Query(query): Query<ProjectQuery>) -> JsonResult {
    let project_id = parse_id("project_id", &query.project_id)?;
    let conflicts = state
        .vcs
        .pending_conflicts(project_id, query.file_path.as_deref().filter(|p| !p.is_empty()))?;
    Ok(Json(json!({
        "success": true,
        "count": conflicts.len(),
        "conflicts": conflicts,
    })))
}

pub async fn conflict_by_id(State(state): State<Arc<AppState>>, Query(query): Query<IdQuery>) -> JsonResult {
    let conflict = state.vcs.conflict(parse_id("conflict_id", &query.id)?)?;
    Ok(Json(json!({ "success": true, "conflict": conflict })))
}

pub async fn resolve_conflict(
    State(state): State<Arc<AppState>>,
    Json(decision): Json<ConflictDecision>,
) -> JsonResult {
    let conflict = state.vcs.resolve_conflict(decision).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Conflict resolved",
        "conflict": conflict,
    })))
}

pub async fn ignore_conflict(
    State(state): State<Arc<AppState>>,
    Json(decision): Json<ConflictDecision>,
) -> JsonResult {
    let conflict = state.vcs.ignore_conflict(decision).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Conflict ignored",
        "conflict": conflict,
    })))
}

fn share_response(receipt: ShareReceipt) -> Json<Value> {
    let message = if receipt.is_online {
        format!("Shared with {}", receipt.recipient)
    } else {
        format!("{} is offline; nothing was delivered", receipt.recipient)
    };
    Json(json!({
        "success": true,
        "message": message,
        "is_online": receipt.is_online,
        "receipt": receipt,
    }))
}

pub async fn share_file(State(state): State<Arc<AppState>>, Json(request): Json<FileShareRequest>) -> JsonResult {
    Ok(share_response(state.shares.share_file(request).await?))
}

pub async fn share_code(State(state): State<Arc<AppState>>, Json(request): Json<CodeShareRequest>) -> JsonResult {
    Ok(share_response(state.shares.share_code(request).await?))
}

pub async fn share_bulk(State(state): State<Arc<AppState>>, Json(request): Json<BulkShareRequest>) -> JsonResult {
    Ok(share_response(state.shares.share_bulk(request).await?))
}

pub async fn shareable_collaborators(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProjectQuery>,
) -> JsonResult {
    let project_id = parse_id("project_id", &query.project_id)?;
    let collaborators = state.shares.shareable_collaborators(project_id).await?;
    Ok(Json(json!({
        "success": true,
        "count": collaborators.len(),
        "collaborators": collaborators,
    })))
}

pub async fn invite(State(state): State<Arc<AppState>>, Json(request): Json<InviteRequest>) -> JsonResult {
    let collaboration = state.collaboration.invite(request).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Collaboration request sent",
        "collaboration": collaboration,
    })))
}

pub async fn decide(State(state): State<Arc<AppState>>, Json(request): Json<DecisionRequest>) -> JsonResult {
    let collaboration = state.collaboration.decide(request).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Collaboration {}", collaboration.status.as_str()),
        "collaboration": collaboration,
    })))
}

pub async fn remove_collaborator(
    State(state): State<Arc<AppState>>,
    Path(collab_id): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> JsonResult {
    let removed = state.collaboration.remove(&collab_id, &query.owner).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Collaborator removed successfully",
        "collaboration": removed,
    })))
}

pub async fn project_collaborators(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProjectQuery>,
) -> JsonResult {
    let project_id = parse_id("project_id", &query.project_id)?;
    let collaborators = state.collaboration.project_collaborators(project_id).await?;
    Ok(Json(json!({
        "success": true,
        "count": collaborators.len(),
        "collaborators": collaborators,
    })))
}

pub async fn pending_requests(State(state): State<Arc<AppState>>, Query(query): Query<RequestsQuery>) -> JsonResult {
    let requests = state.collaboration.pending_requests(&query.user).await?;
    Ok(Json(json!({
        "success": true,
        "count": requests.len(),
        "requests": requests,
    })))
}
