//! Route table and request handlers.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::routing::{any, get, post};
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use super::error::ApiError;
use crate::engine::ReadOptions;
use crate::error::HubError;
use crate::lifecycle::{CloneRequest, DroneQueueSpec};
use crate::prompts::SendPrompt;
use crate::prs::MergeMethod;
use crate::registry::DroneRecord;
use crate::sync::DiffKind;
use crate::terminal::OpenRequest;

/// Build the API router (state is added by the caller).
pub(super) fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/api/status", get(status))
        .route("/api/repos", get(list_repos).post(add_repo))
        .route("/api/drones", get(list_drones).post(queue_drones))
        .route(
            "/api/drones/{id}",
            get(get_drone).delete(delete_drone),
        )
        .route("/api/drones/{id}/rename", post(rename_drone))
        .route("/api/drones/{id}/clone", post(clone_drone))
        .route("/api/drones/{id}/base-image", post(set_base_image))
        .route(
            "/api/drones/{id}/chats/{chat}/transcript",
            get(get_transcript),
        )
        .route("/api/drones/{id}/chats/{chat}/prompt", post(send_prompt))
        .route("/api/drones/{id}/chats/{chat}/pending", get(get_pending))
        .route(
            "/api/drones/{id}/chats/{chat}/pending/{prompt_id}/unstick",
            post(unstick_prompt),
        )
        .route("/api/drones/{id}/terminal/open", post(open_terminal))
        .route(
            "/api/drones/{id}/terminal/{session}/output",
            get(read_terminal),
        )
        .route(
            "/api/drones/{id}/terminal/{session}/stream",
            get(crate::terminal::terminal_stream_handler),
        )
        .route("/api/drones/{id}/repo/changes", get(repo_changes))
        .route("/api/drones/{id}/repo/diff", get(repo_diff))
        .route("/api/drones/{id}/repo/pull", post(repo_pull))
        .route("/api/drones/{id}/repo/push", post(repo_push))
        .route("/api/drones/{id}/repo/pull/changes", get(pull_changes))
        .route("/api/drones/{id}/repo/pull/diff", get(pull_diff))
        .route(
            "/api/drones/{id}/repo/pull-requests",
            get(list_pull_requests),
        )
        .route(
            "/api/drones/{id}/repo/pull-requests/merge-all",
            post(merge_all_pull_requests),
        )
        .route(
            "/api/drones/{id}/repo/pull-requests/{number}/merge",
            post(merge_pull_request),
        )
        .route(
            "/api/drones/{id}/repo/pull-requests/{number}/close",
            post(close_pull_request),
        )
        .route("/api/drones/{id}/ports", get(drone_ports))
        .route(
            "/api/drones/{id}/preview/{port}/{*path}",
            any(super::preview::preview_handler),
        )
}

/// Reject ids with path separators, traversal, or control characters.
fn validate_id(id: &str) -> Result<(), ApiError> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(HubError::InvalidName {
            reason: "invalid drone id".to_owned(),
        }
        .into())
    }
}

async fn drone(state: &AppState, id: &str) -> Result<DroneRecord, ApiError> {
    validate_id(id)?;
    Ok(state.hub.drone(id).await?)
}

fn host_repo(drone: &DroneRecord) -> Result<std::path::PathBuf, ApiError> {
    drone
        .repo_path
        .clone()
        .ok_or_else(|| HubError::not_found("repository for drone").into())
}

// ---- fleet ----

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let drones = state.hub.registry().list().await.len();
    let engine_ok = state.hub.engine_ok().await;
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "drones": drones,
        "engineOk": engine_ok,
    }))
}

async fn list_repos(State(state): State<AppState>) -> Json<serde_json::Value> {
    let repos = state.hub.registry().list_repos().await;
    Json(json!({ "ok": true, "repos": repos }))
}

#[derive(Debug, Deserialize)]
struct AddRepoRequest {
    path: String,
}

async fn add_repo(
    State(state): State<AppState>,
    Json(request): Json<AddRepoRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let repo = state
        .hub
        .register_repo(std::path::Path::new(&request.path))
        .await?;
    Ok(Json(json!({ "ok": true, "repo": repo })))
}

async fn list_drones(State(state): State<AppState>) -> Json<serde_json::Value> {
    let drones = state.hub.registry().list().await;
    Json(json!({ "ok": true, "drones": drones }))
}

#[derive(Debug, Deserialize)]
struct QueueRequest {
    drones: Vec<DroneQueueSpec>,
}

async fn queue_drones(
    State(state): State<AppState>,
    Json(request): Json<QueueRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state.hub.lifecycle().queue(request.drones).await;
    Ok(Json(json!({
        "ok": true,
        "accepted": outcome.accepted,
        "rejected": outcome.rejected,
    })))
}

async fn get_drone(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let drone = drone(&state, &id).await?;
    Ok(Json(json!({ "ok": true, "drone": drone })))
}

async fn delete_drone(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_id(&id)?;
    // Unknown ids are fine: delete is idempotent for optimistic clients.
    state.hub.lifecycle().delete(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameRequest {
    new_name: String,
    #[serde(default)]
    migrate_volume_name: bool,
}

async fn rename_drone(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_id(&id)?;
    let (old_name, new_name) = state
        .hub
        .lifecycle()
        .rename(&id, &request.new_name, request.migrate_volume_name)
        .await?;
    Ok(Json(json!({ "ok": true, "oldName": old_name, "newName": new_name })))
}

async fn clone_drone(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CloneRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_id(&id)?;
    let accepted = state.hub.lifecycle().clone_drone(&id, request).await?;
    Ok(Json(json!({ "ok": true, "drone": accepted })))
}

async fn set_base_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_id(&id)?;
    let base_image = state.hub.lifecycle().set_base_image(&id).await?;
    Ok(Json(json!({ "ok": true, "baseImage": base_image })))
}

// ---- chats ----

#[derive(Debug, Deserialize)]
struct TranscriptQuery {
    /// `all` (default) or a turn number to read past.
    turn: Option<String>,
}

async fn get_transcript(
    State(state): State<AppState>,
    Path((id, chat)): Path<(String, String)>,
    Query(query): Query<TranscriptQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    drone(&state, &id).await?;
    let since = match query.turn.as_deref() {
        None | Some("all") => None,
        Some(raw) => Some(raw.parse::<u64>().map_err(|_| HubError::InvalidName {
            reason: format!("invalid turn parameter: {raw}"),
        })?),
    };
    let transcripts = state.hub.prompts().transcript(&id, &chat, since).await;
    Ok(Json(json!({ "ok": true, "transcripts": transcripts })))
}

async fn send_prompt(
    State(state): State<AppState>,
    Path((id, chat)): Path<(String, String)>,
    Json(request): Json<SendPrompt>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_id(&id)?;
    let receipt = state.hub.prompts().send(&id, &chat, request).await?;
    Ok(Json(json!({
        "ok": true,
        "accepted": true,
        "promptId": receipt.prompt_id,
    })))
}

async fn get_pending(
    State(state): State<AppState>,
    Path((id, chat)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    drone(&state, &id).await?;
    let pending = state.hub.prompts().pending(&id, &chat).await;
    Ok(Json(json!({ "ok": true, "pending": pending })))
}

async fn unstick_prompt(
    State(state): State<AppState>,
    Path((id, chat, prompt_id)): Path<(String, String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_id(&id)?;
    state.hub.prompts().unstick(&id, &chat, &prompt_id).await?;
    Ok(Json(json!({ "ok": true })))
}

// ---- terminal ----

async fn open_terminal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(request): Query<OpenRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_id(&id)?;
    let session_name = state.hub.terminal().open(&id, request).await?;
    Ok(Json(json!({ "ok": true, "sessionName": session_name })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutputQuery {
    since: Option<u64>,
    tail: Option<u64>,
    max_bytes: Option<u64>,
}

async fn read_terminal(
    State(state): State<AppState>,
    Path((id, session)): Path<(String, String)>,
    Query(query): Query<OutputQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_id(&id)?;
    let chunk = state
        .hub
        .terminal()
        .read(
            &id,
            &session,
            ReadOptions {
                since: query.since,
                max_bytes: query.max_bytes,
                tail_lines: query.tail,
            },
        )
        .await?;
    Ok(Json(json!({
        "ok": true,
        "offsetBytes": chunk.offset_bytes,
        "text": chunk.text,
    })))
}

// ---- repo sync ----

async fn repo_changes(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = drone(&state, &id).await?;
    let changes = state.hub.sync().working_tree_changes(&record.name).await?;
    Ok(Json(json!({
        "ok": true,
        "entries": changes.entries,
        "counts": changes.counts,
    })))
}

#[derive(Debug, Deserialize)]
struct RepoDiffQuery {
    path: String,
    kind: DiffKind,
}

async fn repo_diff(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RepoDiffQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = drone(&state, &id).await?;
    let diff = state
        .hub
        .sync()
        .working_tree_diff(&record.name, &query.path, query.kind)
        .await?;
    Ok(Json(json!({
        "ok": true,
        "path": diff.path,
        "diff": diff.diff,
        "truncated": diff.truncated,
        "fromUntracked": diff.from_untracked,
    })))
}

async fn repo_pull(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = drone(&state, &id).await?;
    let repo = host_repo(&record)?;
    let outcome = state
        .hub
        .sync()
        .pull_into_host(&record.id, &record.name, &repo)
        .await?;
    Ok(Json(json!({
        "ok": true,
        "importedSha": outcome.imported_sha,
        "baseSha": outcome.base_sha,
        "merged": outcome.merged,
    })))
}

async fn repo_push(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = drone(&state, &id).await?;
    let repo = host_repo(&record)?;
    state
        .hub
        .sync()
        .push_host_into_drone(&record.name, &repo)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

async fn pull_changes(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = drone(&state, &id).await?;
    let repo = host_repo(&record)?;
    let preview = state.hub.sync().pull_preview(&record.name, &repo).await?;
    Ok(Json(json!({
        "ok": true,
        "baseSha": preview.base_sha,
        "headSha": preview.head_sha,
        "branchContext": preview.branch_context,
        "entries": preview.entries,
    })))
}

#[derive(Debug, Deserialize)]
struct PullDiffQuery {
    path: String,
    base: String,
    head: String,
}

async fn pull_diff(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PullDiffQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = drone(&state, &id).await?;
    let diff = state
        .hub
        .sync()
        .pull_diff(&record.name, &query.path, &query.base, &query.head)
        .await?;
    Ok(Json(json!({
        "ok": true,
        "path": diff.path,
        "diff": diff.diff,
        "truncated": diff.truncated,
    })))
}

// ---- pull requests ----

#[derive(Debug, Deserialize)]
struct PrListQuery {
    state: Option<String>,
}

async fn list_pull_requests(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PrListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_id(&id)?;
    if let Some(requested) = query.state.as_deref() {
        if requested != "open" {
            return Err(HubError::InvalidName {
                reason: format!("unsupported state filter: {requested}"),
            }
            .into());
        }
    }
    let pull_requests = state.hub.prs().list(&id).await?;
    Ok(Json(json!({ "ok": true, "pullRequests": pull_requests })))
}

#[derive(Debug, Deserialize)]
struct MergeRequest {
    method: MergeMethod,
    #[serde(default)]
    force: bool,
}

async fn merge_pull_request(
    State(state): State<AppState>,
    Path((id, number)): Path<(String, u64)>,
    Json(request): Json<MergeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_id(&id)?;
    state
        .hub
        .prs()
        .merge(&id, number, request.method, request.force)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

async fn close_pull_request(
    State(state): State<AppState>,
    Path((id, number)): Path<(String, u64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_id(&id)?;
    state.hub.prs().close(&id, number).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn merge_all_pull_requests(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<MergeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_id(&id)?;
    let outcome = state
        .hub
        .prs()
        .merge_all(&id, request.method, request.force)
        .await?;
    Ok(Json(json!({
        "ok": true,
        "merged": outcome.merged,
        "skipped": outcome.skipped,
        "failed": outcome.failed,
    })))
}

// ---- ports ----

async fn drone_ports(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = drone(&state, &id).await?;
    let ports = state.hub.engine().ports(&record.name).await?;
    Ok(Json(json!({ "ok": true, "ports": ports })))
}
