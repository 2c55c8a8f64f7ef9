//! Prometheus scrape endpoint (SPEC_FULL.md §7 — `FEED_HEALTH`/Prometheus
//! are the only two observability surfaces the core emits).

use actix_web::{get, web, HttpResponse, Scope};
use metrics_exporter_prometheus::PrometheusHandle;

#[get("")]
async fn render(handle: web::Data<PrometheusHandle>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(handle.render())
}

pub fn metrics_scope() -> Scope {
    web::scope("/metrics").service(render)
}
