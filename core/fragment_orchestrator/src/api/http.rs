use actix_web::{web, Error, HttpResponse};
use platform::{record_counter, request_span};
use serde::Serialize;
use shared_types::{
    FetchResponseV1, FetchStatus, PipelineFailure, RequestId, SubmitRequestV1, SubmitResponseV1,
    TerminalState, API_VERSION_CURRENT,
};
use tracing::{info, Instrument};
use uuid::Uuid;

use super::ApiContext;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    providers_configured: usize,
    providers_healthy: usize,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/v1/queries", web::post().to(submit_v1))
        .route("/api/v1/queries/{request_id}", web::get().to(fetch_v1))
        .route("/api/v1/queries/{request_id}", web::delete().to(cancel_v1))
        .route("/api/v1/providers", web::get().to(list_providers))
        .route("/health", web::get().to(health));
}

/// Submit: accepts the query and returns immediately; the coordinator runs
/// asynchronously and publishes progress on the event stream.
async fn submit_v1(
    body: web::Json<SubmitRequestV1>,
    ctx: web::Data<ApiContext>,
) -> Result<HttpResponse, Error> {
    let correlation_id = platform::logging::ensure_correlation_id(body.correlation_id);
    let span = request_span(correlation_id, "submit_v1");

    async move {
        record_counter("http_requests_total_submit_v1", 1);

        let req = body.into_inner();
        let policy = req.policy.unwrap_or_default();
        let request_id = ctx.coordinator.submit(req.query, policy);

        info!(
            %request_id,
            %correlation_id,
            endpoint = "/api/v1/queries",
            "query submitted"
        );

        Ok(HttpResponse::Accepted().json(SubmitResponseV1 {
            api_version: API_VERSION_CURRENT,
            request_id,
            correlation_id,
        }))
    }
    .instrument(span)
    .await
}

/// Fetch: the aggregated response once available, a processing marker
/// before that, and the structured failure after a terminal error.
async fn fetch_v1(
    path: web::Path<Uuid>,
    ctx: web::Data<ApiContext>,
) -> Result<HttpResponse, Error> {
    let request_id: RequestId = path.into_inner();
    let span = request_span(request_id, "fetch_v1");

    async move {
        record_counter("http_requests_total_fetch_v1", 1);

        let Some(record) = ctx.coordinator.record(request_id) else {
            return Ok(HttpResponse::NotFound().json(serde_json::json!({
                "error": "unknown request id",
            })));
        };

        let response = match &record.terminal {
            Some(TerminalState::Complete) => FetchResponseV1 {
                api_version: API_VERSION_CURRENT,
                request_id,
                status: FetchStatus::Complete,
                aggregated: record.aggregated.clone(),
                error: None,
            },
            Some(TerminalState::Failed { kind, message }) => FetchResponseV1 {
                api_version: API_VERSION_CURRENT,
                request_id,
                status: FetchStatus::Failed,
                aggregated: None,
                error: Some(PipelineFailure {
                    kind: *kind,
                    message: message.clone(),
                }),
            },
            None => FetchResponseV1 {
                api_version: API_VERSION_CURRENT,
                request_id,
                status: FetchStatus::Processing,
                aggregated: None,
                error: None,
            },
        };

        Ok(HttpResponse::Ok().json(response))
    }
    .instrument(span)
    .await
}

/// External abort; propagates to every in-flight provider call.
async fn cancel_v1(
    path: web::Path<Uuid>,
    ctx: web::Data<ApiContext>,
) -> Result<HttpResponse, Error> {
    let request_id: RequestId = path.into_inner();
    let span = request_span(request_id, "cancel_v1");

    async move {
        record_counter("http_requests_total_cancel_v1", 1);

        if ctx.coordinator.cancel(request_id) {
            info!(%request_id, "cancellation requested");
            Ok(HttpResponse::Accepted().finish())
        } else {
            Ok(HttpResponse::NotFound().json(serde_json::json!({
                "error": "unknown or already terminal request id",
            })))
        }
    }
    .instrument(span)
    .await
}

async fn list_providers(ctx: web::Data<ApiContext>) -> Result<HttpResponse, Error> {
    record_counter("http_requests_total_providers_v1", 1);
    Ok(HttpResponse::Ok().json(ctx.coordinator.registry.summaries()))
}

async fn health(ctx: web::Data<ApiContext>) -> Result<HttpResponse, Error> {
    record_counter("http_requests_total_health", 1);
    let snapshot = ctx.coordinator.registry.snapshot();
    Ok(HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        providers_configured: snapshot.providers.len(),
        providers_healthy: snapshot.healthy_count(),
    }))
}
