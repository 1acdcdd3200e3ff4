use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Extension, Path, Query, Request, rejection::JsonRejection, rejection::QueryRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tower::ServiceBuilder;

use jobs_core::{CorrelationId, JobError, JobId, ListJobsParams, Pagination};

use crate::dto::{CancelJobRequest, JobListResponse, JobView, SubmitJobRequest, SubmitJobResponse};
use crate::errors::{self, job_error_to_response};
use crate::init::AppServices;
use crate::service::ResultsPayload;

pub const CORRELATION_HEADER: &str = "x-correlation-id";
pub const TRACE_HEADER: &str = "traceparent";
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

pub fn router(services: Arc<AppServices>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/results", get(job_results))
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(correlation_middleware))
                .layer(Extension(services)),
        )
}

/// Derive the correlation id from `traceparent` and echo it on the response.
async fn correlation_middleware(mut req: Request, next: Next) -> Response {
    let correlation_id = CorrelationId::from_trace_header(
        req.headers()
            .get(TRACE_HEADER)
            .and_then(|v| v.to_str().ok()),
    );
    req.extensions_mut().insert(correlation_id.clone());

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(correlation_id.as_str()) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

async fn health() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(correlation_id): Extension<CorrelationId>,
    headers: HeaderMap,
    body: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                rejection.body_text(),
            );
        }
    };

    let idempotency_key = match headers.get(IDEMPOTENCY_HEADER).map(|v| v.to_str()) {
        None => None,
        Some(Ok(key)) => Some(key),
        Some(Err(_)) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "Idempotency-Key must be visible ASCII",
            );
        }
    };

    match services
        .producer
        .submit(request, idempotency_key, correlation_id.clone())
        .await
    {
        Ok(submission) => (
            StatusCode::ACCEPTED,
            Json(SubmitJobResponse {
                job_id: submission.job_id,
                status_url: submission.status_url,
            }),
        )
            .into_response(),
        Err(err) => job_error_to_response(err, &correlation_id),
    }
}

async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(correlation_id): Extension<CorrelationId>,
    params: Result<Query<ListJobsParams>, QueryRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                rejection.body_text(),
            );
        }
    };

    match services.jobs.list(&params).await {
        Ok((query, page)) => Json(JobListResponse {
            pagination: Pagination::new(query.page, query.page_size, page.total),
            jobs: page.items.into_iter().map(JobView::from).collect(),
        })
        .into_response(),
        Err(err) => job_error_to_response(err, &correlation_id),
    }
}

async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(correlation_id): Extension<CorrelationId>,
    Path(id): Path<String>,
) -> Response {
    match services.jobs.get(&JobId::from_string(id)).await {
        Ok(job) => Json(JobView::from(job)).into_response(),
        Err(err) => job_error_to_response(err, &correlation_id),
    }
}

async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(correlation_id): Extension<CorrelationId>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let request = if body.is_empty() {
        CancelJobRequest::default()
    } else {
        match serde_json::from_slice::<CancelJobRequest>(&body) {
            Ok(request) => request,
            Err(e) => {
                return job_error_to_response(JobError::Validation(e.to_string()), &correlation_id);
            }
        }
    };

    match services
        .jobs
        .cancel(&JobId::from_string(id), request.reason)
        .await
    {
        Ok(job) => Json(JobView::from(job)).into_response(),
        Err(err) => job_error_to_response(err, &correlation_id),
    }
}

async fn job_results(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(correlation_id): Extension<CorrelationId>,
    Path(id): Path<String>,
) -> Response {
    let id = JobId::from_string(id);
    match services.jobs.results(&id).await {
        Ok(ResultsPayload::Inline(results)) => Json(results).into_response(),
        Ok(ResultsPayload::Stored { reference, bytes }) => {
            let disposition = format!("attachment; filename=\"{id}-results.json\"");
            let content_type = HeaderValue::from_str(&reference.content_type)
                .unwrap_or(HeaderValue::from_static("application/octet-stream"));
            let mut response = bytes.into_response();
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_TYPE, content_type);
            if let Ok(value) = HeaderValue::from_str(&disposition) {
                headers.insert(header::CONTENT_DISPOSITION, value);
            }
            response
        }
        Err(err) => job_error_to_response(err, &correlation_id),
    }
}
