use actix_web::{web, Error, HttpResponse};
use futures_util::stream;
use platform::{record_counter, request_span};
use shared_types::RequestId;
use tracing::Instrument;
use uuid::Uuid;

use super::ApiContext;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route(
        "/api/v1/queries/{request_id}/events",
        web::get().to(stream_events),
    );
}

/// Stream: server-sent events for one request, replaying buffered events
/// for late subscribers and closing after the terminal event. Closing the
/// connection does not cancel the request.
async fn stream_events(
    path: web::Path<Uuid>,
    ctx: web::Data<ApiContext>,
) -> Result<HttpResponse, Error> {
    let request_id: RequestId = path.into_inner();
    let span = request_span(request_id, "stream_events");

    async move {
        record_counter("http_requests_total_stream_v1", 1);

        let Some(subscription) = ctx.coordinator.bus.subscribe(request_id) else {
            return Ok(HttpResponse::NotFound().json(serde_json::json!({
                "error": "unknown request id",
            })));
        };

        let body = stream::unfold(subscription, |mut subscription| async move {
            let event = subscription.recv().await?;
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(_) => return None,
            };
            let frame = web::Bytes::from(format!("data: {json}\n\n"));
            Some((Ok::<_, Error>(frame), subscription))
        });

        Ok(HttpResponse::Ok()
            .content_type("text/event-stream")
            .insert_header(("Cache-Control", "no-cache"))
            .streaming(body))
    }
    .instrument(span)
    .await
}
