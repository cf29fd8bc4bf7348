//! Textbook RAG API Gateway
//!
//! The entry point for textbook retrieval requests.
//! Handles:
//! - Caller authentication (JWT bearer tokens)
//! - Rate limiting
//! - Request routing to the retrieval service
//! - Observability (logging, metrics)

mod handlers;
mod middleware;

use axum::{
    extract::FromRef,
    http::StatusCode,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use textbook_rag_common::{
    auth::JwtManager,
    config::{AppConfig, ObservabilityConfig},
    errors::{AppError, Result},
    metrics, Storage,
};
use textbook_rag_search::TextbookService;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tower::{limit::ConcurrencyLimitLayer, ServiceBuilder};
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::middleware::rate_limit::{self, GlobalRateLimiter};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub storage: Storage,
    pub service: TextbookService,
    pub jwt: Arc<JwtManager>,
    pub rate_limiter: Option<Arc<GlobalRateLimiter>>,
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        storage: Storage,
        prometheus: Option<PrometheusHandle>,
    ) -> Result<Self> {
        let secret = config
            .auth
            .jwt_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::Configuration {
                message: "auth.jwt_secret is required".to_string(),
            })?;
        let jwt = Arc::new(JwtManager::new(secret, config.auth.jwt_expiration_secs));
        let rate_limiter = rate_limit::from_config(&config.rate_limit)?;
        let service = TextbookService::from_storage(&storage, &config);

        Ok(Self {
            config: Arc::new(config),
            storage,
            service,
            jwt,
            rate_limiter,
            prometheus,
        })
    }
}

impl FromRef<AppState> for Arc<JwtManager> {
    fn from_ref(state: &AppState) -> Self {
        state.jwt.clone()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load()?;

    // Initialize tracing
    init_tracing(&config.observability);

    info!(
        "Starting {} gateway v{}",
        config.observability.service_name,
        textbook_rag_common::VERSION
    );

    config.validate().inspect_err(|e| {
        error!(error = %e, "Invalid configuration");
    })?;

    // Initialize metrics
    let prometheus = PrometheusBuilder::new()
        .set_buckets(metrics::LATENCY_BUCKETS)?
        .install_recorder()?;
    metrics::register_metrics();

    // Initialize storage
    let storage = Storage::connect(&config).await?;

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let shutdown_timeout = config.shutdown_timeout();
    let state = AppState::new(config, storage, Some(prometheus))?;

    // Build the router
    let app = create_router(state);

    info!("Listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;

    serve_until(listener, app, shutdown_signal(), shutdown_timeout).await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Structured logs: JSON in deployments, human-readable locally
fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    if config.json_logging {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // API routes
    let mut api_routes = Router::new()
        .route("/textbooks", get(handlers::textbooks::list_textbooks))
        .route(
            "/textbooks/{id}",
            get(handlers::textbooks::get_textbook).delete(handlers::textbooks::delete_textbook),
        )
        .route("/textbooks/{id}/status", get(handlers::textbooks::textbook_status))
        .route("/textbooks/{id}/chunks", get(handlers::textbooks::list_chunks))
        .route("/textbooks/{id}/search", post(handlers::search::search));

    if let Some(limiter) = state.rate_limiter.clone() {
        api_routes = api_routes.layer(from_fn_with_state(
            limiter,
            rate_limit::rate_limit_middleware,
        ));
    }

    // Compose the app
    Router::new()
        // Health endpoints (no auth)
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .route("/metrics", get(handlers::health::metrics))
        .nest("/api", api_routes)
        .route_layer(from_fn(middleware::metrics::track_requests))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    state.config.request_timeout(),
                ))
                .layer(ConcurrencyLimitLayer::new(
                    state.config.server.max_concurrent_requests,
                ))
                .layer(cors),
        )
        .with_state(state)
}

/// Serve `app` until `signal` resolves.
///
/// After the signal the listener stops accepting and in-flight requests get
/// `grace` to finish; whatever is still running then is dropped.
async fn serve_until<F>(
    listener: TcpListener,
    app: Router,
    signal: F,
    grace: Duration,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send,
{
    let (drain_tx, drain_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = drain_rx.await;
            })
            .await
    });

    tokio::select! {
        result = &mut server => {
            result??;
            return Ok(());
        }
        _ = signal => {}
    }

    let _ = drain_tx.send(());
    match tokio::time::timeout(grace, &mut server).await {
        Ok(result) => result??,
        Err(_) => {
            warn!(
                grace_secs = grace.as_secs_f64(),
                "Shutdown timeout elapsed, dropping in-flight requests"
            );
            server.abort();
        }
    }
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{header::AUTHORIZATION, header::CONTENT_TYPE, Method, Request, StatusCode},
    };
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use textbook_rag_common::config::StorageBackend;
    use textbook_rag_common::db::models::{NewChunk, NewTextbook, Textbook};
    use textbook_rag_common::db::{ChunkStore, MemoryStore, TextbookStore};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tower::ServiceExt;

    const DIM: usize = 3;

    fn test_config(conceal_forbidden: bool) -> AppConfig {
        let mut config = AppConfig::default();
        config.database.backend = StorageBackend::Memory;
        config.embedding.dimension = DIM;
        config.auth.jwt_secret = Some("test_secret".to_string());
        config.auth.conceal_forbidden = conceal_forbidden;
        config
    }

    struct TestApp {
        router: Router,
        store: Arc<MemoryStore>,
        jwt: Arc<JwtManager>,
    }

    impl TestApp {
        fn new(conceal_forbidden: bool) -> Self {
            let config = test_config(conceal_forbidden);
            let store = Arc::new(MemoryStore::new(DIM));
            let state = AppState::new(config, Storage::from_engine(store.clone()), None).unwrap();
            let jwt = state.jwt.clone();

            Self {
                router: create_router(state),
                store,
                jwt,
            }
        }

        async fn seed(&self, user_id: i64) -> i64 {
            let textbook = self
                .store
                .create_textbook(NewTextbook {
                    user_id,
                    title: "Thermodynamics".into(),
                    s3_key: format!("textbooks/{}/thermo.pdf", user_id),
                    processed: false,
                })
                .await
                .unwrap();

            let chunks = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.6, 0.8, 0.0]]
                .iter()
                .enumerate()
                .map(|(i, e)| NewChunk {
                    content: format!("section {}", i),
                    page_number: i as i32 + 1,
                    chunk_index: i as i32,
                    embedding: e.to_vec(),
                })
                .collect();
            self.store.insert_chunks(textbook.id, chunks).await.unwrap();
            textbook.id
        }

        async fn post_raw(&self, uri: &str, user_id: i64, content_type: Option<&str>, body: &str) -> (StatusCode, Value) {
            let token = self.jwt.generate_token(user_id).unwrap();
            let mut builder = Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header(AUTHORIZATION, format!("Bearer {}", token));
            if let Some(content_type) = content_type {
                builder = builder.header(CONTENT_TYPE, content_type);
            }

            let response = self
                .router
                .clone()
                .oneshot(builder.body(Body::from(body.to_string())).unwrap())
                .await
                .unwrap();
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
        }

        async fn send(&self, method: Method, uri: &str, user_id: Option<i64>, body: Option<Value>) -> (StatusCode, Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(user_id) = user_id {
                let token = self.jwt.generate_token(user_id).unwrap();
                builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
            }
            let request = match body {
                Some(body) => builder
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };

            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, value)
        }
    }

    #[tokio::test]
    async fn test_health_needs_no_token() {
        let app = TestApp::new(false);
        let (status, body) = app.send(Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let (status, body) = app.send(Method::GET, "/ready", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["storage"]["status"], "up");
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let app = TestApp::new(false);
        let id = app.seed(9).await;

        let (status, body) = app.send(Method::GET, "/api/textbooks", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");

        let uri = format!("/api/textbooks/{}", id);
        let (status, _) = app.send(Method::DELETE, &uri, None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(app.store.count_chunks(id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_non_integer_id_is_bad_request() {
        let app = TestApp::new(false);
        let (status, body) = app.send(Method::GET, "/api/textbooks/abc", Some(9), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_list_is_an_array() {
        let app = TestApp::new(false);
        let (status, body) = app.send(Method::GET, "/api/textbooks", Some(9), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        let id = app.seed(9).await;
        let (_, body) = app.send(Method::GET, "/api/textbooks", Some(9), None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["id"], id);
        assert_eq!(body[0]["user_id"], 9);
    }

    #[tokio::test]
    async fn test_non_owner_is_forbidden() {
        let app = TestApp::new(false);
        let id = app.seed(9).await;

        for suffix in ["", "/status", "/chunks"] {
            let uri = format!("/api/textbooks/{}{}", id, suffix);
            let (status, body) = app.send(Method::GET, &uri, Some(3), None).await;
            assert_eq!(status, StatusCode::FORBIDDEN, "{}", uri);
            assert_eq!(body["error"]["code"], "FORBIDDEN");
        }

        let (status, _) = app
            .send(Method::GET, "/api/textbooks/999", Some(3), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_conceal_reports_not_found() {
        let app = TestApp::new(true);
        let id = app.seed(9).await;

        let uri = format!("/api/textbooks/{}", id);
        let (status, body) = app.send(Method::GET, &uri, Some(3), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "TEXTBOOK_NOT_FOUND");

        let (status, _) = app.send(Method::DELETE, &uri, Some(3), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(app.store.count_chunks(id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_status_shape() {
        let app = TestApp::new(false);
        let id = app.seed(9).await;

        let uri = format!("/api/textbooks/{}/status", id);
        let (status, body) = app.send(Method::GET, &uri, Some(9), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["textbook_id"], id);
        assert_eq!(body["title"], "Thermodynamics");
        assert_eq!(body["processed"], false);
        assert_eq!(body["chunk_count"], 3);
        assert!(body["uploaded_at"].is_string());
    }

    #[tokio::test]
    async fn test_search_ranks_exact_match_first() {
        let app = TestApp::new(false);
        let id = app.seed(9).await;

        let uri = format!("/api/textbooks/{}/search", id);
        let request = json!({ "embedding": [0.0, 1.0, 0.0], "top_k": 2 });
        let (status, body) = app.send(Method::POST, &uri, Some(9), Some(request)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["textbook_id"], id);
        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["chunk_index"], 1);
        assert_eq!(results[1]["chunk_index"], 2);
        assert!(results[0]["distance"].as_f64().unwrap().abs() < 1e-9);
        assert!(results[0]["content"].is_string());
        assert!(results[0]["page_number"].is_number());
        assert!(results[0]["chunk_id"].is_number());
    }

    #[tokio::test]
    async fn test_search_defaults_top_k() {
        let app = TestApp::new(false);
        let id = app.seed(9).await;

        let uri = format!("/api/textbooks/{}/search", id);
        let request = json!({ "embedding": [1.0, 0.0, 0.0] });
        let (status, body) = app.send(Method::POST, &uri, Some(9), Some(request)).await;
        assert_eq!(status, StatusCode::OK);
        // default_top_k is 5, the textbook has 3 chunks
        assert_eq!(body["results"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_search_rejects_bad_embeddings() {
        let app = TestApp::new(false);
        let id = app.seed(9).await;
        let uri = format!("/api/textbooks/{}/search", id);

        let (status, body) = app
            .send(Method::POST, &uri, Some(9), Some(json!({ "embedding": [] })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        let (status, body) = app
            .send(Method::POST, &uri, Some(9), Some(json!({ "embedding": [1.0, 0.0] })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_EMBEDDING");
    }

    #[tokio::test]
    async fn test_mistyped_search_body_is_validation_error() {
        let app = TestApp::new(false);
        let id = app.seed(9).await;
        let uri = format!("/api/textbooks/{}/search", id);

        let bodies = [
            json!({ "embedding": ["x", 1.0, 0.0] }),
            json!({ "embedding": [0, 1, 0], "top_k": "two" }),
            json!({ "top_k": 2 }),
        ];
        for request in bodies {
            let (status, body) = app.send(Method::POST, &uri, Some(9), Some(request.clone())).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", request);
            assert_eq!(body["error"]["code"], "VALIDATION_ERROR", "{}", request);
        }
    }

    #[tokio::test]
    async fn test_unparseable_search_body_is_validation_error() {
        let app = TestApp::new(false);
        let id = app.seed(9).await;
        let uri = format!("/api/textbooks/{}/search", id);

        let (status, body) = app
            .post_raw(&uri, 9, Some("application/json"), r#"{"embedding": [1.0, 0.0"#)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        let (status, body) = app
            .post_raw(&uri, 9, None, r#"{"embedding": [1.0, 0.0, 0.0]}"#)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    /// Delegates to a memory store but never finishes listing
    struct StalledTextbooks(Arc<MemoryStore>);

    #[async_trait]
    impl TextbookStore for StalledTextbooks {
        async fn create_textbook(&self, textbook: NewTextbook) -> Result<Textbook> {
            self.0.create_textbook(textbook).await
        }

        async fn get_textbook(&self, id: i64) -> Result<Textbook> {
            self.0.get_textbook(id).await
        }

        async fn list_textbooks(&self, _user_id: i64) -> Result<Vec<Textbook>> {
            std::future::pending().await
        }

        async fn mark_processed(&self, id: i64) -> Result<()> {
            self.0.mark_processed(id).await
        }

        async fn delete_textbook(&self, id: i64, requesting_user_id: i64) -> Result<()> {
            self.0.delete_textbook(id, requesting_user_id).await
        }
    }

    #[tokio::test]
    async fn test_slow_request_times_out_with_408() {
        let mut config = test_config(false);
        config.server.request_timeout_secs = 1;

        let store = Arc::new(MemoryStore::new(DIM));
        let storage = Storage {
            textbooks: Arc::new(StalledTextbooks(store.clone())),
            chunks: store.clone(),
            index: store,
        };
        let state = AppState::new(config, storage, None).unwrap();
        let token = state.jwt.generate_token(9).unwrap();

        let request = Request::builder()
            .uri("/api/textbooks")
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let response = create_router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let app = Router::new().route("/ping", get(|| async { "pong" }));

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            serve_until(listener, app, async {}, Duration::from_secs(30)),
        )
        .await;
        assert!(matches!(result, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_shutdown_drops_requests_past_grace_period() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/stuck",
            get(|| async {
                std::future::pending::<()>().await;
                "unreachable"
            }),
        );

        let (trigger, signal) = oneshot::channel::<()>();
        let server = tokio::spawn(serve_until(
            listener,
            app,
            async {
                let _ = signal.await;
            },
            Duration::from_millis(200),
        ));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /stuck HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), server).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn test_delete_then_gone() {
        let app = TestApp::new(false);
        let id = app.seed(9).await;
        let uri = format!("/api/textbooks/{}", id);

        let (status, _) = app.send(Method::DELETE, &uri, Some(3), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = app.send(Method::DELETE, &uri, Some(9), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "message": "Textbook deleted successfully" }));

        let (status, _) = app.send(Method::GET, &uri, Some(9), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(app.store.count_chunks(id).await.unwrap(), 0);
    }

    #[test]
    fn test_state_requires_secret() {
        let mut config = AppConfig::default();
        config.database.backend = StorageBackend::Memory;
        let storage = Storage::from_engine(Arc::new(MemoryStore::new(DIM)));
        assert!(matches!(
            AppState::new(config, storage, None),
            Err(AppError::Configuration { .. })
        ));
    }
}
