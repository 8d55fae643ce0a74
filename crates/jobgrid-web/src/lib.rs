//! Axum trigger surface for the ingestion pipeline.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use jobgrid_ingest::{AppConfig, IngestCoordinator, IngestReport};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::error;

pub const CRATE_NAME: &str = "jobgrid-web";

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<IngestCoordinator>,
}

impl AppState {
    pub fn new(coordinator: Arc<IngestCoordinator>) -> Self {
        Self { coordinator }
    }
}

/// Wire contract with the caller: listing-level failures live inside a 200
/// response; only a run that could not start at all yields a 500.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    pub success: bool,
    pub processed: usize,
    pub errors: usize,
    pub scraped: usize,
    pub message: String,
}

impl From<&IngestReport> for IngestResponse {
    fn from(report: &IngestReport) -> Self {
        Self {
            success: true,
            processed: report.processed,
            errors: report.errors(),
            scraped: report.scraped,
            message: report.message(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/ingest", post(ingest_handler))
        .route("/healthz", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    let coordinator = jobgrid_ingest::coordinator_from_config(&config).await?;
    let _scheduler = match jobgrid_ingest::maybe_build_scheduler(coordinator.clone(), &config).await?
    {
        Some(mut sched) => {
            sched
                .start()
                .await
                .map_err(|e| anyhow::anyhow!("starting scheduler: {e}"))?;
            Some(sched)
        }
        None => None,
    };

    let state = AppState::new(coordinator);
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn ingest_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.run().await {
        Ok(report) => Json(IngestResponse::from(&report)).into_response(),
        Err(err) => {
            error!(error = %err, "ingestion run could not start");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "success": false,
                    "error": err.to_string(),
                })),
            )
                .into_response()
        }
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.ping_catalog().await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use jobgrid_adapters::StaticAdapter;
    use jobgrid_core::RawListing;
    use jobgrid_ingest::IngestOptions;
    use jobgrid_store::MemoryCatalog;
    use tower::ServiceExt;

    fn listing(url: &str) -> RawListing {
        RawListing {
            title: "Software Engineer".into(),
            description: "Build things".into(),
            company_name: "Tech Solutions Pte Ltd".into(),
            location_name: "Singapore".into(),
            category_name: "Technology".into(),
            source_url: url.into(),
            source_site: "static".into(),
            employment_type: Some("Full-time".into()),
            salary_min: Some(4000.0),
            salary_max: Some(6000.0),
            posted_at: None,
        }
    }

    fn test_app(catalog: Arc<MemoryCatalog>) -> Router {
        let adapter: Arc<dyn jobgrid_adapters::SourceAdapter> = Arc::new(StaticAdapter::new(
            "static",
            vec![listing("https://jobs.example/1"), listing("https://jobs.example/2")],
        ));
        let coordinator =
            IngestCoordinator::new(catalog, vec![adapter], IngestOptions::default()).unwrap();
        app(AppState::new(Arc::new(coordinator)))
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn ingest_endpoint_returns_report_counts() {
        let catalog = Arc::new(MemoryCatalog::with_categories(["Technology"]));
        let app = test_app(catalog);

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/ingest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = json_body(resp).await;
        assert_eq!(body["success"], serde_json::json!(true));
        assert_eq!(body["processed"], serde_json::json!(2));
        assert_eq!(body["errors"], serde_json::json!(0));
        assert_eq!(body["scraped"], serde_json::json!(2));
        assert!(body["message"].as_str().unwrap().contains("processed 2 jobs"));
    }

    #[tokio::test]
    async fn repeat_trigger_reports_duplicates_inside_a_200() {
        let catalog = Arc::new(MemoryCatalog::with_categories(["Technology"]));
        let app = test_app(catalog);

        let first = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/ingest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/ingest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        let body = json_body(second).await;
        assert_eq!(body["processed"], serde_json::json!(0));
        assert_eq!(body["scraped"], serde_json::json!(2));
    }

    #[tokio::test]
    async fn unreachable_store_yields_500_with_error_payload() {
        let catalog = Arc::new(MemoryCatalog::unreachable());
        let app = test_app(catalog);

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/ingest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(resp).await;
        assert_eq!(body["success"], serde_json::json!(false));
        assert!(body["error"].as_str().unwrap().contains("unavailable"));
    }

    #[tokio::test]
    async fn healthz_reflects_catalog_reachability() {
        let healthy = test_app(Arc::new(MemoryCatalog::new()));
        let resp = healthy
            .oneshot(axum::http::Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let unhealthy = test_app(Arc::new(MemoryCatalog::unreachable()));
        let resp = unhealthy
            .oneshot(axum::http::Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
