//! HTTP surface of the controller.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use axum_extra::extract::Multipart;
use chrono::Utc;
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::archive::{read_manifest_from_bytes, sha256_hex};
use crate::artefact_storage::ArtefactStorage;
use crate::controller_client::StateChange;
use crate::error::{ApiError, StoreError};
use crate::lifecycle::{DelayOutOfRange, LifecycleActionScheduler, ScheduleOutcome};
use crate::manifest::Manifest;
use crate::mismatch::compute_mismatches;
use crate::model::{
    ArtefactModel, CronjobExecution, LifecycleAction, ScheduledLifecycleAction,
    ServerArtefactState, ServerModel, StateType,
};
use crate::store::StateStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub storage: Arc<ArtefactStorage>,
    pub lifecycle: Arc<LifecycleActionScheduler>,
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/server", put(upsert_server).get(list_servers))
        .route("/server/:uuid", get(get_server))
        .route(
            "/server/:uuid/state/:kind",
            get(get_state).patch(patch_state).delete(delete_state),
        )
        .route("/operator/:server/:action", post(operator_action))
        .route("/artefact", post(upload_artefact).get(list_artefacts))
        .route("/artefact/:uuid", get(get_artefact))
        .route("/artefact/:uuid/download", get(download_artefact))
        .route("/artefact/:uuid/download/manifest", get(download_manifest))
        .route("/cron", get(list_cron))
        .route("/schedule", get(list_schedule))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn upsert_server(
    State(state): State<AppState>,
    Json(server): Json<ServerModel>,
) -> Result<Json<ServerModel>, ApiError> {
    let server = state.store.upsert_server(server)?;
    info!("🖥️  Server {} ({}) saved", server.name, server.uuid);
    Ok(Json(server))
}

async fn list_servers(State(state): State<AppState>) -> Result<Json<Vec<ServerModel>>, ApiError> {
    Ok(Json(state.store.list_servers()?))
}

async fn get_server(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<Json<ServerModel>, ApiError> {
    Ok(Json(state.store.get_server(uuid)?))
}

#[derive(Debug, Deserialize)]
struct MismatchQuery {
    #[serde(rename = "requiresRestart")]
    requires_restart: Option<bool>,
}

/// `update` lists mismatches; anything else names a state type.
async fn get_state(
    State(state): State<AppState>,
    Path((uuid, kind)): Path<(Uuid, String)>,
    Query(query): Query<MismatchQuery>,
) -> Result<Response, ApiError> {
    if kind == "update" {
        let mismatches = compute_mismatches(state.store.as_ref(), uuid, query.requires_restart)?;
        return Ok(Json(mismatches).into_response());
    }
    let state_type: StateType = kind.parse().map_err(ApiError::bad_request)?;
    state.store.get_server(uuid)?;
    Ok(Json(state.store.list_states(uuid, Some(state_type))?).into_response())
}

fn writable_state_type(kind: &str) -> Result<StateType, ApiError> {
    match kind.parse::<StateType>().map_err(ApiError::bad_request)? {
        StateType::History => Err(ApiError::bad_request("HISTORY rows are read-only")),
        state_type => Ok(state_type),
    }
}

async fn patch_state(
    State(state): State<AppState>,
    Path((uuid, kind)): Path<(Uuid, String)>,
    Json(change): Json<StateChange>,
) -> Result<Json<ServerArtefactState>, ApiError> {
    let state_type = writable_state_type(&kind)?;
    let artefact = change
        .artefact_uuid
        .ok_or_else(|| ApiError::bad_request("artefactUuid is required"))?;
    let row = state
        .store
        .upsert_state(uuid, state_type, &change.artefact_identifier, artefact)?;
    info!(
        "📝 Server {}: {} {} = {}",
        uuid, state_type, change.artefact_identifier, artefact
    );
    Ok(Json(row))
}

async fn delete_state(
    State(state): State<AppState>,
    Path((uuid, kind)): Path<(Uuid, String)>,
    Json(change): Json<StateChange>,
) -> Result<Json<ServerArtefactState>, ApiError> {
    let state_type = writable_state_type(&kind)?;
    let removed = state
        .store
        .remove_state(uuid, state_type, &change.artefact_identifier)?;
    info!(
        "📝 Server {}: {} {} removed",
        uuid, state_type, change.artefact_identifier
    );
    Ok(Json(removed))
}

#[derive(Debug, Deserialize)]
struct DelayQuery {
    delay: Option<String>,
}

async fn operator_action(
    State(state): State<AppState>,
    Path((server, action)): Path<(Uuid, String)>,
    Query(query): Query<DelayQuery>,
) -> Result<Json<ScheduleOutcome>, ApiError> {
    let action: LifecycleAction = action.parse().map_err(ApiError::bad_request)?;
    let delay = query
        .delay
        .as_deref()
        .filter(|d| !d.is_empty())
        .map(humantime::parse_duration)
        .transpose()
        .map_err(|e| ApiError::bad_request(format!("invalid delay: {}", e)))?;
    let outcome = state
        .lifecycle
        .schedule(server, action, delay)
        .await
        .map_err(|e| {
            if e.is::<DelayOutOfRange>() {
                return ApiError::bad_request(format!("invalid delay: {}", e));
            }
            match e.downcast::<StoreError>() {
                Ok(store_err) => ApiError::from(store_err),
                Err(other) => ApiError::bad_gateway(format!("{:#}", other)),
            }
        })?;
    Ok(Json(outcome))
}

async fn upload_artefact(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<ArtefactModel>), ApiError> {
    let mut archive = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {}", e)))?
    {
        if field.name() == Some("archive") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::bad_request(format!("reading archive: {}", e)))?;
            archive = Some(bytes.to_vec());
        }
    }
    let bytes = archive.ok_or_else(|| ApiError::bad_request("multipart field 'archive' is required"))?;
    let manifest = read_manifest_from_bytes(&bytes)
        .map_err(|e| ApiError::bad_request(format!("{:#}", e)))?;

    if state
        .store
        .list_artefacts()?
        .iter()
        .any(|a| a.identifier == manifest.identifier && a.version == manifest.version)
    {
        return Err(StoreError::conflict(format!("artefact {} already exists", manifest.label())).into());
    }

    let model = ArtefactModel {
        uuid: Uuid::new_v4(),
        identifier: manifest.identifier.clone(),
        version: manifest.version.clone(),
        uploaded_at: Utc::now(),
        hash: sha256_hex(&bytes),
        requires_restart: manifest.requires_restart,
    };
    let size = bytes.len();
    state.storage.put(model.uuid, bytes).await?;
    let model = match state.store.insert_artefact(model.clone()) {
        Ok(model) => model,
        Err(e) => {
            if let Err(cleanup) = state.storage.delete(model.uuid).await {
                warn!("Failed to delete orphaned archive {}: {:#}", model.uuid, cleanup);
            }
            return Err(e.into());
        }
    };
    info!("📤 Uploaded {} as {} ({} bytes)", model.label(), model.uuid, size);
    Ok((StatusCode::CREATED, Json(model)))
}

async fn list_artefacts(State(state): State<AppState>) -> Result<Json<Vec<ArtefactModel>>, ApiError> {
    Ok(Json(state.store.list_artefacts()?))
}

async fn get_artefact(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<Json<ArtefactModel>, ApiError> {
    Ok(Json(state.store.get_artefact(uuid)?))
}

async fn download_artefact(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<Response, ApiError> {
    let artefact = state.store.get_artefact(uuid)?;
    let bytes = state.storage.get(uuid).await?;
    let disposition = format!("attachment; filename=\"{}-{}.tar.gz\"", artefact.identifier, artefact.version);
    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

async fn download_manifest(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<Json<Manifest>, ApiError> {
    state.store.get_artefact(uuid)?;
    let bytes = state.storage.get(uuid).await?;
    let manifest = read_manifest_from_bytes(&bytes)?;
    Ok(Json(manifest))
}

async fn list_cron(State(state): State<AppState>) -> Result<Json<Vec<CronjobExecution>>, ApiError> {
    Ok(Json(state.store.list_cronjob_executions()?))
}

async fn list_schedule(
    State(state): State<AppState>,
) -> Result<Json<Vec<ScheduledLifecycleAction>>, ApiError> {
    Ok(Json(state.store.list_scheduled_actions()?))
}
