use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::MatchedPath,
    http::Request,
    middleware::Next,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tower_http::trace::TraceLayer;

use crate::api::endpoints;
use crate::app_context::AppContext;

pub async fn index() -> &'static str {
    "auction archive service"
}

pub fn router(context: Arc<AppContext>) -> Router {
    let status_router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| std::future::ready("ok")));

    let api_router = Router::new()
        .route(
            "/api/auction/:uuid",
            get(endpoints::get_auction).post(endpoints::get_auction_versions),
        )
        .route(
            "/api/auctions/tag/:tag/recent/overview",
            get(endpoints::recent_overview),
        )
        .route("/api/prices/item/price/:tag", get(endpoints::price_summary))
        .route(
            "/api/prices/item/price/:tag/history",
            get(endpoints::price_history),
        )
        .route(
            "/api/restore/:uuid",
            post(endpoints::restore_auction).delete(endpoints::delete_restored),
        )
        .route("/import/offset", post(endpoints::set_import_offset))
        .route("/api/archive/:tag/months", get(endpoints::archive_months))
        .route(
            "/api/archive/:tag/:year/:month",
            get(endpoints::archive_month),
        )
        .route("/api/archive/migrate", post(endpoints::trigger_migration));

    let router = Router::new()
        .merge(status_router)
        .merge(api_router)
        .layer(TraceLayer::new_for_http())
        .with_state(context);
    setup_metrics_routes(router)
}

/// Adds the prometheus endpoint and the HTTP metrics middleware; called last
/// so the middleware observes every route.
fn setup_metrics_routes(router: Router) -> Router {
    let recorder_handle = setup_metrics_recorder();
    router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

fn setup_metrics_recorder() -> PrometheusHandle {
    const BUCKETS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ];
    PrometheusBuilder::new()
        .set_buckets(BUCKETS)
        .expect("static histogram buckets are valid")
        .install_recorder()
        .expect("failed to install metrics recorder")
}

async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();
    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };
    let method = req.method().clone();

    let response = next.run(req).await;

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    response
}

pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await
}
