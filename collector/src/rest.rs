use crate::errors::Error;
use crate::filter::{ReadingFilter, TimeRange, TimeRangeQuery};
use crate::jobs::{JobMessage, JobQueue, JobStatus, JobStore};
use crate::metrics::READINGS_TOTAL;
use crate::model::{Device, NewDevice, NewReading, NewUser, ReadingsPage, Statistics, User};
use crate::repo::{Page, Repository};
use crate::validate::{validate_device, validate_reading, validate_user};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Handles shared by every request. Each operation acquires its own
/// connection from the repository's pool.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub jobs: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobQueue>,
}

#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    start_date: Option<String>,
    end_date: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/users", post(create_user).get(list_users))
        .route("/devices", post(create_device).get(list_devices))
        .route("/statistics", post(create_statistic))
        .route("/device/:device_id/readings", get(device_readings))
        .route("/device/:device_id/statistics", get(device_statistics))
        .route(
            "/device/:device_id/statistics/async",
            get(device_statistics_async),
        )
        .route("/user/:user_id/statistics", get(user_statistics))
        .route("/user/:user_id/statistics/async", get(user_statistics_async))
        .route(
            "/user/:user_id/device/:device_id/statistics",
            get(user_device_statistics),
        )
        .route(
            "/user/:user_id/device/:device_id/statistics/async",
            get(user_device_statistics_async),
        )
        .route("/analytics/status/:task_id", get(job_status))
        .with_state(state)
}

async fn create_user(
    State(state): State<AppState>,
    Json(body): Json<NewUser>,
) -> Result<Json<Value>, AppError> {
    validate_user(&body)?;
    let user = state.repo.create_user(&body).await?;

    Ok(Json(json!({ "ok": true, "user_id": user.id })))
}

async fn list_users(State(state): State<AppState>) -> Result<Json<Vec<User>>, AppError> {
    Ok(Json(state.repo.list_users().await?))
}

async fn create_device(
    State(state): State<AppState>,
    Json(body): Json<NewDevice>,
) -> Result<Json<Value>, AppError> {
    validate_device(&body)?;
    let device = state.repo.create_device(&body).await?;

    Ok(Json(json!({ "ok": true, "device_id": device.id })))
}

async fn list_devices(State(state): State<AppState>) -> Result<Json<Vec<Device>>, AppError> {
    Ok(Json(state.repo.list_devices().await?))
}

async fn create_statistic(
    State(state): State<AppState>,
    Json(body): Json<NewReading>,
) -> Result<Json<Value>, AppError> {
    validate_reading(&body)?;
    let reading = state.repo.create_reading(&body).await?;
    READINGS_TOTAL.inc();
    debug!("Stored reading {} for device {}", reading.id, reading.device_id);

    Ok(Json(json!({ "ok": true, "statistic_id": reading.id })))
}

async fn device_readings(
    State(state): State<AppState>,
    Path(device_id): Path<i64>,
    Query(params): Query<ReadingsQuery>,
) -> Result<Json<ReadingsPage>, AppError> {
    let range = TimeRange::parse(params.start_date.as_deref(), params.end_date.as_deref())?;
    let filter = ReadingFilter::for_device(device_id, range);
    let page = Page::new(params.limit, params.offset);

    let readings = state.repo.list_readings(&filter, page).await?;

    Ok(Json(ReadingsPage {
        total: readings.len(),
        data: readings,
        limit: page.limit,
        offset: page.offset,
    }))
}

async fn device_statistics(
    State(state): State<AppState>,
    Path(device_id): Path<i64>,
    Query(params): Query<TimeRangeQuery>,
) -> Result<Json<Statistics>, AppError> {
    let filter = ReadingFilter::for_device(device_id, params.range()?);
    Ok(Json(state.repo.statistics(&filter).await?))
}

async fn user_statistics(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(params): Query<TimeRangeQuery>,
) -> Result<Json<Statistics>, AppError> {
    let filter = ReadingFilter::for_user(user_id, params.range()?);
    Ok(Json(state.repo.statistics(&filter).await?))
}

async fn user_device_statistics(
    State(state): State<AppState>,
    Path((user_id, device_id)): Path<(i64, i64)>,
    Query(params): Query<TimeRangeQuery>,
) -> Result<Json<Statistics>, AppError> {
    let filter = ReadingFilter::for_user_device(user_id, device_id, params.range()?);
    Ok(Json(state.repo.statistics(&filter).await?))
}

async fn device_statistics_async(
    State(state): State<AppState>,
    Path(device_id): Path<i64>,
    Query(params): Query<TimeRangeQuery>,
) -> Result<Json<Value>, AppError> {
    let filter = ReadingFilter::for_device(device_id, params.range()?);
    enqueue(&state, filter).await
}

async fn user_statistics_async(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(params): Query<TimeRangeQuery>,
) -> Result<Json<Value>, AppError> {
    let filter = ReadingFilter::for_user(user_id, params.range()?);
    enqueue(&state, filter).await
}

async fn user_device_statistics_async(
    State(state): State<AppState>,
    Path((user_id, device_id)): Path<(i64, i64)>,
    Query(params): Query<TimeRangeQuery>,
) -> Result<Json<Value>, AppError> {
    let filter = ReadingFilter::for_user_device(user_id, device_id, params.range()?);
    enqueue(&state, filter).await
}

async fn enqueue(state: &AppState, filter: ReadingFilter) -> Result<Json<Value>, AppError> {
    let job = JobMessage::new(&filter);
    state.jobs.insert(&job).await?;

    if let Err(e) = state.queue.publish(&job).await {
        let message = e.to_string();
        if let Err(store_err) = state.jobs.fail(job.task_id, &message, &format!("{:?}", e)).await {
            error!("Failed to mark job {} as failed: {}", job.task_id, store_err);
        }
        return Err(e.into());
    }

    info!("Enqueued statistics job {} for {:?}", job.task_id, filter);
    Ok(Json(json!({ "task_id": job.task_id, "status": "processing" })))
}

async fn job_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<JobStatus>, AppError> {
    let task_id = Uuid::parse_str(&task_id)
        .map_err(|_| Error::Validation(format!("Invalid task id '{}'", task_id)))?;

    let record = state
        .jobs
        .get(task_id)
        .await?
        .ok_or_else(|| Error::not_found("Task", task_id))?;

    Ok(Json(record.into()))
}

pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, detail) = match self.0.downcast_ref::<Error>() {
            Some(Error::NotFound(_)) => (StatusCode::NOT_FOUND, self.0.to_string()),
            Some(Error::Validation(message)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, message.clone())
            }
            _ => {
                error!("API error: {:?}", self.0);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
