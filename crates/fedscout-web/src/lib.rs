//! JSON HTTP API over the fedscout search and ingestion services.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fedscout_core::{SearchError, Source};
use fedscout_storage::{MemoryCache, PgStore, TracingTelemetry};
use fedscout_sync::{
    build_pipeline, build_scheduler, IngestionService, PipelineConfig, SearchService,
    SourceRegistry,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "fedscout-web";

#[derive(Clone)]
pub struct AppState {
    pub search: Arc<SearchService>,
    pub ingestion: Arc<IngestionService>,
    pub sources: Vec<Source>,
    pub retention_days: i64,
}

#[derive(Debug, Deserialize, Default)]
struct SearchParams {
    query: Option<String>,
    agency: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct IngestRequest {
    #[serde(default)]
    sources: Vec<String>,
    query: Option<String>,
    #[serde(default)]
    force_refresh: bool,
}

#[derive(Debug, Deserialize, Default)]
struct CleanupRequest {
    days_old: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sources: Vec<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/opportunities/search", get(search_handler))
        .route("/api/admin/ingest", post(ingest_handler))
        .route("/api/admin/cleanup", post(cleanup_handler))
        .with_state(Arc::new(state))
}

/// Build the full pipeline from the environment and serve until shutdown.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env();
    let registry = SourceRegistry::load(config.workspace_root.join("sources.yaml"))?;
    let sources = registry.enabled_sources();

    let store = PgStore::connect(&config.database_url).await?;
    store.run_migrations().await?;

    let pipeline = build_pipeline(
        &config,
        sources.clone(),
        Arc::new(store),
        Arc::new(MemoryCache::new()),
        Arc::new(TracingTelemetry),
    )?;

    if let Some(scheduler) = build_scheduler(
        &config,
        sources.clone(),
        pipeline.ingestion.clone(),
        Arc::new(TracingTelemetry),
    )
    .await?
    {
        scheduler.start().await?;
        info!(cron = %config.ingest_cron, "scheduled ingestion enabled");
    }

    let state = AppState {
        search: pipeline.search,
        ingestion: pipeline.ingestion,
        sources,
        retention_days: config.retention_days,
    };

    let port: u16 = std::env::var("FEDSCOUT_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "fedscout api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Response {
    let query = params.query.unwrap_or_default();
    match state.search.search(&query, params.agency.as_deref()).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => search_error(err),
    }
}

async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IngestRequest>,
) -> Response {
    let sources = if request.sources.is_empty() {
        state.sources.clone()
    } else {
        let mut parsed = Vec::with_capacity(request.sources.len());
        for raw in &request.sources {
            match raw.parse::<Source>() {
                Ok(source) => parsed.push(source),
                Err(err) => {
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(ErrorBody {
                            error: err.to_string(),
                            sources: vec![],
                        }),
                    )
                        .into_response();
                }
            }
        }
        parsed
    };

    let query = request.query.unwrap_or_default();
    let summary = state
        .ingestion
        .run(&sources, &query, request.force_refresh)
        .await;
    Json(summary).into_response()
}

async fn cleanup_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CleanupRequest>,
) -> Response {
    let days_old = request.days_old.unwrap_or(state.retention_days).max(0);
    match state.ingestion.cleanup(days_old).await {
        Ok(removed) => Json(serde_json::json!({
            "days_old": days_old,
            "removed": removed,
        }))
        .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error: err.to_string(),
                sources: vec![],
            }),
        )
            .into_response(),
    }
}

/// Search failures map to 503 so callers can tell a degraded backend from a
/// legitimately empty result set.
fn search_error(err: SearchError) -> Response {
    let body = match &err {
        SearchError::LiveDataDisabled => ErrorBody {
            error: err.to_string(),
            sources: vec![],
        },
        SearchError::AllSourcesFailed(failures) => ErrorBody {
            error: "opportunity data temporarily unavailable".to_string(),
            sources: failures
                .iter()
                .map(|f| format!("{}: {}", f.source, f.message))
                .collect(),
        },
    };
    (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use fedscout_adapters::{RawOpportunity, SourceAdapter};
    use fedscout_storage::{
        HttpClientConfig, HttpFetcher, MemoryStore, RecordingTelemetry, RetryPolicy,
        SourceError,
    };
    use fedscout_sync::{Aggregator, IngestionPipeline};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    struct StubAdapter {
        source: Source,
        titles: Vec<(&'static str, &'static str)>,
        fail: bool,
    }

    #[async_trait]
    impl SourceAdapter for StubAdapter {
        fn source(&self) -> Source {
            self.source
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            _query: &str,
        ) -> Result<Vec<RawOpportunity>, SourceError> {
            if self.fail {
                return Err(SourceError::Http {
                    source: self.source,
                    status: 503,
                });
            }
            Ok(self
                .titles
                .iter()
                .map(|(id, title)| RawOpportunity {
                    external_id: Some(id.to_string()),
                    title: Some(title.to_string()),
                    ..Default::default()
                })
                .collect())
        }
    }

    fn test_state(adapters: Vec<Arc<dyn SourceAdapter>>) -> AppState {
        let http =
            Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("http client"));
        let retry = RetryPolicy {
            max_attempts: 1,
            initial_delay: Duration::from_millis(1),
        };
        let telemetry = Arc::new(RecordingTelemetry::default());
        let aggregator = Aggregator::new(
            adapters.clone(),
            http.clone(),
            retry,
            Duration::from_secs(5),
            telemetry.clone(),
            true,
        );
        let search = Arc::new(SearchService::new(
            aggregator,
            Arc::new(MemoryCache::new()),
            Duration::from_secs(60),
            true,
        ));
        let store = Arc::new(MemoryStore::new());
        let pipeline = IngestionPipeline::new(
            store,
            telemetry.clone(),
            Duration::from_secs(24 * 60 * 60),
        );
        let ingestion = Arc::new(IngestionService::new(
            adapters,
            http,
            retry,
            Duration::from_secs(5),
            telemetry,
            pipeline,
        ));
        AppState {
            search,
            ingestion,
            sources: vec![Source::GrantsGov],
            retention_days: 180,
        }
    }

    fn good_adapters() -> Vec<Arc<dyn SourceAdapter>> {
        vec![Arc::new(StubAdapter {
            source: Source::GrantsGov,
            titles: vec![("G-1", "Quantum Sensing Research")],
            fail: false,
        })]
    }

    fn failing_adapters() -> Vec<Arc<dyn SourceAdapter>> {
        vec![Arc::new(StubAdapter {
            source: Source::GrantsGov,
            titles: vec![],
            fail: true,
        })]
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = app(test_state(good_adapters()));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn search_returns_records_as_json() {
        let app = app(test_state(good_adapters()));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/opportunities/search?query=quantum")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["records"].as_array().unwrap().len(), 1);
        assert_eq!(json["partial_data"], false);
    }

    #[tokio::test]
    async fn total_source_failure_maps_to_503() {
        let app = app(test_state(failing_adapters()));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/opportunities/search?query=anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(resp).await;
        assert_eq!(json["error"], "opportunity data temporarily unavailable");
    }

    #[tokio::test]
    async fn ingest_endpoint_returns_run_summary() {
        let app = app(test_state(good_adapters()));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/admin/ingest")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"query": "quantum"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["totals"]["inserted"], 1);
    }

    #[tokio::test]
    async fn ingest_rejects_unknown_source() {
        let app = app(test_state(good_adapters()));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/admin/ingest")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"sources": ["not-real"]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cleanup_endpoint_reports_removed_count() {
        let app = app(test_state(good_adapters()));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/admin/cleanup")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"days_old": 30}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["removed"], 0);
        assert_eq!(json["days_old"], 30);
    }
}
