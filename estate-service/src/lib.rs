// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP control surface (spec §4.I/§6): thin axum layer translating
//! requests into `Supervisor` calls and snapshotting its state back as
//! `{status, message?}` JSON, per the control API contract.
//!
//! Grounded on the `axum` + `State`/`Json`/`IntoResponse` idiom seen in
//! the pack's gateway HTTP layer, adapted to this system's uniform
//! response envelope instead of a REST-resource-per-type API.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use estate_scheduler::{StageStatus, Supervisor};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

/// Stage name the bulk crawl is registered under.
pub const STAGE_BULK_CRAWL: &str = "first_scraper";
/// Stage name the incremental loop is registered under.
pub const STAGE_LOOP: &str = "loop_scraper";
/// Stage name the night agency-brute enrichment is registered under.
pub const STAGE_AGENCE_BRUTE: &str = "agence_brute";
/// Stage name the night agency resolver is registered under.
pub const STAGE_AGENCE_NOTEXISTING: &str = "agence_notexisting";
/// Stage name the image processor is registered under.
pub const STAGE_IMAGE_PROCESSOR: &str = "process_and_transfer";

const MIN_INSTANCES: u32 = 1;
const MAX_INSTANCES: u32 = 10;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
}

/// The uniform response envelope every endpoint returns: `status` is one
/// of `started|running|stopped|idle|success|error`; `message` carries
/// free-form detail (a stage-status map for `/status`, an error
/// description for failures, a timestamp for `/health`).
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<serde_json::Value>,
}

impl ApiResponse {
    fn new(status: &str) -> Self {
        ApiResponse {
            status: status.to_string(),
            message: None,
        }
    }

    fn with_message(status: &str, message: serde_json::Value) -> Self {
        ApiResponse {
            status: status.to_string(),
            message: Some(message),
        }
    }
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

struct ApiError {
    code: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.code,
            Json(ApiResponse::with_message("error", serde_json::Value::String(self.message))),
        )
            .into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/scrape/100_pages", get(start_bulk_crawl))
        .route("/api/v1/scrape/loop", get(start_loop))
        .route("/api/v1/scrape/agence_brute", get(start_agence_brute))
        .route("/api/v1/scrape/agence_notexisting", get(start_agence_notexisting))
        .route("/api/v1/scrape/process_and_transfer", get(start_image_processor))
        .route("/api/v1/stop/:task_name", get(stop_stage))
        .route("/api/v1/status", get(status_all))
        .route("/api/v1/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn start_stage(state: &AppState, name: &str) -> Result<ApiResponse, ApiError> {
    if !state.supervisor.known_stage(name).await {
        return Err(ApiError {
            code: StatusCode::BAD_REQUEST,
            message: format!("unknown task_name: {name}"),
        });
    }
    let status = state
        .supervisor
        .request_start(name)
        .await
        .map_err(|e| ApiError { code: StatusCode::INTERNAL_SERVER_ERROR, message: e.to_string() })?;
    Ok(ApiResponse::new(started_status_word(status)))
}

fn started_status_word(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Running => "started",
        StageStatus::Idle => "idle",
    }
}

async fn start_bulk_crawl(State(state): State<AppState>) -> Result<ApiResponse, ApiError> {
    start_stage(&state, STAGE_BULK_CRAWL).await
}

async fn start_loop(State(state): State<AppState>) -> Result<ApiResponse, ApiError> {
    start_stage(&state, STAGE_LOOP).await
}

async fn start_agence_brute(State(state): State<AppState>) -> Result<ApiResponse, ApiError> {
    start_stage(&state, STAGE_AGENCE_BRUTE).await
}

async fn start_agence_notexisting(State(state): State<AppState>) -> Result<ApiResponse, ApiError> {
    start_stage(&state, STAGE_AGENCE_NOTEXISTING).await
}

#[derive(Debug, Deserialize)]
struct ProcessAndTransferParams {
    instances: Option<u32>,
}

/// Validates `instances` (1-10) and starts the image processor stage
/// with that worker-pool size, restarting it if it's already running
/// with a different count.
async fn start_image_processor(
    State(state): State<AppState>,
    Query(params): Query<ProcessAndTransferParams>,
) -> Result<ApiResponse, ApiError> {
    let instances = params.instances.unwrap_or(5);
    if !(MIN_INSTANCES..=MAX_INSTANCES).contains(&instances) {
        return Err(ApiError {
            code: StatusCode::BAD_REQUEST,
            message: format!("instances must be between {MIN_INSTANCES} and {MAX_INSTANCES}"),
        });
    }
    if !state.supervisor.known_stage(STAGE_IMAGE_PROCESSOR).await {
        return Err(ApiError {
            code: StatusCode::BAD_REQUEST,
            message: format!("unknown task_name: {STAGE_IMAGE_PROCESSOR}"),
        });
    }
    let status = state
        .supervisor
        .request_start_with_instances(STAGE_IMAGE_PROCESSOR, instances as usize)
        .await
        .map_err(|e| ApiError { code: StatusCode::INTERNAL_SERVER_ERROR, message: e.to_string() })?;
    Ok(ApiResponse::new(started_status_word(status)))
}

async fn stop_stage(State(state): State<AppState>, Path(task_name): Path<String>) -> Result<ApiResponse, ApiError> {
    if !state.supervisor.known_stage(&task_name).await {
        return Err(ApiError {
            code: StatusCode::BAD_REQUEST,
            message: format!("unknown task_name: {task_name}"),
        });
    }
    let status = state
        .supervisor
        .request_stop(&task_name)
        .await
        .map_err(|e| ApiError { code: StatusCode::INTERNAL_SERVER_ERROR, message: e.to_string() })?;
    Ok(ApiResponse::new(match status {
        StageStatus::Idle => "stopped",
        StageStatus::Running => "running",
    }))
}

async fn status_all(State(state): State<AppState>) -> ApiResponse {
    let snapshot = state.supervisor.status_all().await;
    let message = serde_json::Value::Object(
        snapshot
            .into_iter()
            .map(|(name, status)| (name, serde_json::Value::String(status.as_str().to_string())))
            .collect(),
    );
    ApiResponse::with_message("success", message)
}

async fn health() -> ApiResponse {
    ApiResponse::with_message("success", serde_json::Value::String(Utc::now().to_rfc3339()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use estate_scheduler::StageSpec;
    use estate_util::cancel::CancelToken;
    use estate_util::window::Window;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_stage(name: &str) -> StageSpec {
        StageSpec {
            name: name.to_string(),
            window: Window::Always,
            run: std::sync::Arc::new(
                |mut cancel: CancelToken, _instances: usize| -> Pin<Box<dyn Future<Output = Result<(), estate_error::Error>> + Send>> {
                    Box::pin(async move {
                        cancel.cancelled().await;
                        Ok(())
                    })
                },
            ),
            initial_instances: 1,
        }
    }

    async fn test_state() -> AppState {
        let supervisor = Arc::new(Supervisor::new(10, 22));
        supervisor.register(noop_stage(STAGE_IMAGE_PROCESSOR)).await;
        AppState { supervisor }
    }

    /// Records the `instances` value the Supervisor actually launched
    /// the image processor stage with.
    fn recording_image_processor_stage(seen: Arc<AtomicUsize>) -> StageSpec {
        StageSpec {
            name: STAGE_IMAGE_PROCESSOR.to_string(),
            window: Window::Always,
            run: std::sync::Arc::new(
                move |mut cancel: CancelToken, instances: usize| -> Pin<Box<dyn Future<Output = Result<(), estate_error::Error>> + Send>> {
                    let seen = seen.clone();
                    Box::pin(async move {
                        seen.store(instances, Ordering::SeqCst);
                        cancel.cancelled().await;
                        Ok(())
                    })
                },
            ),
            initial_instances: 1,
        }
    }

    #[tokio::test]
    async fn unknown_task_name_is_rejected_before_touching_the_supervisor() {
        let state = test_state().await;
        let err = start_stage(&state, "nonexistent").await.unwrap_err();
        assert_eq!(err.code, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn known_stage_starts_successfully() {
        let state = test_state().await;
        let response = start_stage(&state, STAGE_IMAGE_PROCESSOR).await.unwrap();
        assert_eq!(response.status, "started");
    }

    #[tokio::test]
    async fn instances_out_of_range_is_rejected() {
        let state = test_state().await;
        let err = start_image_processor(State(state), Query(ProcessAndTransferParams { instances: Some(11) }))
            .await
            .unwrap_err();
        assert_eq!(err.code, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn instances_in_range_is_accepted() {
        let state = test_state().await;
        let response = start_image_processor(State(state), Query(ProcessAndTransferParams { instances: Some(5) }))
            .await
            .unwrap();
        assert_eq!(response.status, "started");
    }

    #[tokio::test]
    async fn requested_instances_value_reaches_the_stage() {
        let supervisor = Arc::new(Supervisor::new(10, 22));
        let seen = Arc::new(AtomicUsize::new(0));
        supervisor.register(recording_image_processor_stage(seen.clone())).await;
        let state = AppState { supervisor };

        start_image_processor(State(state), Query(ProcessAndTransferParams { instances: Some(7) }))
            .await
            .unwrap();
        tokio::task::yield_now().await;

        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }
}
