//! HTTP collector: queue jobs with a plain form POST.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::{FormRejection, QueryRejection},
        Query, State,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::post,
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::coordinator::Coordinator;
use crate::error::BuildFarmError;
use crate::scheduler::JobType;

#[derive(Clone)]
pub struct CollectorState {
    pub coordinator: Arc<Coordinator>,
}

#[derive(Deserialize, Default)]
struct CollectForm {
    target: Option<String>,
    #[serde(rename = "type")]
    target_type: Option<String>,
    arch: Option<String>,
}

impl CollectForm {
    /// Fields from the body win over the same fields in the query string.
    fn merge(self, query: CollectForm) -> CollectForm {
        CollectForm {
            target: self.target.or(query.target),
            target_type: self.target_type.or(query.target_type),
            arch: self.arch.or(query.arch),
        }
    }
}

#[derive(Serialize)]
struct CollectResponse {
    success: bool,
    ids: Vec<u64>,
    error: Option<String>,
}

impl CollectResponse {
    fn failure(status: StatusCode, error: String) -> (StatusCode, Json<CollectResponse>) {
        Self::partial(status, error, Vec::new())
    }

    /// Failure after some jobs were already queued; their ids are reported.
    fn partial(
        status: StatusCode,
        error: String,
        ids: Vec<u64>,
    ) -> (StatusCode, Json<CollectResponse>) {
        (
            status,
            Json(CollectResponse {
                success: false,
                ids,
                error: Some(error),
            }),
        )
    }
}

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    let collect = post(collect_handler).fallback(method_not_allowed);
    Router::new()
        .route("/", collect.clone())
        .route("/collect", collect)
        .layer(TraceLayer::new_for_http())
        .with_state(CollectorState { coordinator })
}

pub async fn run_collector(
    addr: SocketAddr,
    coordinator: Arc<Coordinator>,
    shutdown: CancellationToken,
) {
    let app = router(coordinator);

    tracing::info!(addr = %addr, "Starting HTTP collector");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind HTTP collector");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        tracing::error!(error = %e, "HTTP collector failed");
    }
}

async fn method_not_allowed() -> impl IntoResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "POST")],
        "Only POST is allowed\n",
    )
}

fn status_for(err: &BuildFarmError) -> StatusCode {
    match err {
        BuildFarmError::UnknownTarget { .. }
        | BuildFarmError::UnsupportedArchitecture { .. }
        | BuildFarmError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        BuildFarmError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Architectures a request expands to: the one asked for, or every
/// architecture of the target.
fn requested_architectures(
    coordinator: &Coordinator,
    job_type: JobType,
    target: &str,
    arch: Option<String>,
) -> Result<Vec<String>, BuildFarmError> {
    if let Some(arch) = arch.filter(|a| !a.trim().is_empty()) {
        return Ok(vec![arch]);
    }
    let archs = match job_type {
        JobType::Package => coordinator
            .ledger()
            .get_package(target)?
            .map(|p| p.architectures),
        JobType::Image => coordinator.ledger().get_image(target)?.map(|i| i.architectures),
    };
    archs.ok_or_else(|| BuildFarmError::UnknownTarget {
        kind: job_type.as_str(),
        name: target.to_string(),
    })
}

async fn collect_handler(
    State(state): State<CollectorState>,
    query: Result<Query<CollectForm>, QueryRejection>,
    body: Result<Form<CollectForm>, FormRejection>,
) -> impl IntoResponse {
    let query = match query {
        Ok(Query(query)) => query,
        Err(e) => return CollectResponse::failure(StatusCode::BAD_REQUEST, e.body_text()),
    };
    let body = match body {
        Ok(Form(body)) => body,
        // No form body at all, the query string may still carry the fields
        Err(FormRejection::InvalidFormContentType(_)) => CollectForm::default(),
        Err(e) => return CollectResponse::failure(StatusCode::BAD_REQUEST, e.body_text()),
    };
    let form = body.merge(query);

    let Some(target) = form.target.filter(|t| !t.trim().is_empty()) else {
        return CollectResponse::failure(StatusCode::BAD_REQUEST, "target is required".to_string());
    };
    let job_type = match form.target_type.as_deref() {
        None | Some("") => JobType::Package,
        Some(raw) => match raw.parse::<JobType>() {
            Ok(job_type) => job_type,
            Err(e) => return CollectResponse::failure(status_for(&e), e.to_string()),
        },
    };

    let archs = match requested_architectures(&state.coordinator, job_type, &target, form.arch) {
        Ok(archs) => archs,
        Err(e) => return CollectResponse::failure(status_for(&e), e.to_string()),
    };
    // Reject the whole request before any job exists
    for arch in &archs {
        if let Err(e) = state.coordinator.check_target(job_type, &target, arch) {
            tracing::warn!(job_target = %target, arch = %arch, error = %e, "Collect request rejected");
            return CollectResponse::failure(status_for(&e), e.to_string());
        }
    }

    let mut ids = Vec::with_capacity(archs.len());
    for arch in archs {
        match state.coordinator.enqueue(job_type, &target, &arch).await {
            Ok(job) => ids.push(job.id),
            Err(e) => {
                tracing::error!(job_target = %target, arch = %arch, queued = ?ids, error = %e, "Collect request failed part way");
                return CollectResponse::partial(status_for(&e), e.to_string(), ids);
            }
        }
    }

    (
        StatusCode::CREATED,
        Json(CollectResponse {
            success: true,
            ids,
            error: None,
        }),
    )
}
