//! HTTP surface of an operator.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::ApiError;
use crate::model::{ActionReport, LifecycleAction};
use crate::operator::Operator;

pub fn router(operator: Arc<Operator>) -> Router {
    Router::new()
        .route("/server/:uuid/:action", post(execute_action))
        .route("/cron/cache/clear", post(clear_cache))
        .layer(TraceLayer::new_for_http())
        .with_state(operator)
}

async fn execute_action(
    State(operator): State<Arc<Operator>>,
    Path((server, action)): Path<(Uuid, String)>,
) -> Result<Json<ActionReport>, ApiError> {
    let action: LifecycleAction = action.parse().map_err(ApiError::bad_request)?;
    let report = operator.execute(server, action).await?;
    if let Some(update) = report.update.as_ref().filter(|u| !u.is_success()) {
        let failed: Vec<String> = update
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.identifier, f.error))
            .collect();
        return Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "UPDATE_FAILED",
            format!("{}; {}", report.message, failed.join("; ")),
        ));
    }
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct ClearQuery {
    age: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearResponse {
    pub removed: usize,
}

async fn clear_cache(
    State(operator): State<Arc<Operator>>,
    Query(query): Query<ClearQuery>,
) -> Result<Json<ClearResponse>, ApiError> {
    let max_age = humantime::parse_duration(&query.age)
        .map_err(|e| ApiError::bad_request(format!("invalid age '{}': {}", query.age, e)))?;
    let removed = operator.clear_cache(max_age).await?;
    Ok(Json(ClearResponse { removed }))
}
