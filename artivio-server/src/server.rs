use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
};

use axum::{Extension, Json, Router, response::IntoResponse, routing::get, serve};
use axum::http::{HeaderValue, StatusCode, header};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use shared::config::server::{Config, DatabaseConfig, LogFormat};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt};
use utoipa::OpenApi;

use crate::{
    app_state::AppState,
    fanout::SseCoordinator,
    middleware::request_context::{self, RequestContextState},
    openapi::ApiDoc,
    repository::{
        ConversationStore, MessageStore, UserStore,
        memory::{InMemoryConversationStore, InMemoryMessageStore, InMemoryUserStore},
        pg::{PgConversationStore, PgMessageStore, PgUserStore},
    },
    routes,
    services::{
        chat_engine::ChatEngine,
        context_cache::ContextCache,
        reply_generator::{GeminiReplyGenerator, ReplyGenerator},
    },
    tracer,
};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn metrics_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

async fn metrics_endpoint(Extension(handle): Extension<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        handle.render(),
    )
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Initializes the tracing subscriber for logging using the provided
/// configuration.
pub fn initialize_tracing(config: &Config) -> String {
    let env_filter = build_env_filter(config);

    let fmt_builder = fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    if matches!(config.logging.format, LogFormat::Json) {
        fmt_builder.json().with_ansi(false).init();
    } else {
        fmt_builder.with_ansi(true).init();
    }

    config.logging.level.clone()
}

fn build_env_filter(config: &Config) -> EnvFilter {
    let default_level = config
        .logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}

/// Creates a database connection pool from the given database settings.
///
/// # Errors
/// Returns an error if the database connection pool cannot be created.
pub async fn create_database_pool(db: &DatabaseConfig) -> Result<sqlx::PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(db.max_connections)
        .connect(&db.url)
        .await?;
    metrics::gauge!("db_pool_max_connections").set(f64::from(db.max_connections));
    Ok(pool)
}

/// Wires the engine and push coordinator from configuration, over Postgres
/// when a pool is supplied and over the in-memory repositories otherwise.
///
/// # Errors
/// Returns an error if the reply-generator HTTP client cannot be built.
pub fn create_app_state(
    config: Arc<Config>,
    pool: Option<sqlx::PgPool>,
) -> anyhow::Result<Arc<AppState>> {
    let (users, conversations, messages): (
        Arc<dyn UserStore>,
        Arc<dyn ConversationStore>,
        Arc<dyn MessageStore>,
    ) = match pool {
        Some(pool) => (
            Arc::new(PgUserStore::new(pool.clone())),
            Arc::new(PgConversationStore::new(pool.clone())),
            Arc::new(PgMessageStore::new(pool)),
        ),
        None => (
            Arc::new(InMemoryUserStore::new()),
            Arc::new(InMemoryConversationStore::new()),
            Arc::new(InMemoryMessageStore::new()),
        ),
    };

    let context = Arc::new(ContextCache::new(config.ai.context_capacity));
    let generator = Arc::new(GeminiReplyGenerator::new(config.ai.clone())?);
    if !generator.is_configured() {
        warn!("Gemini API key not configured; AI replies will be canned responses");
    }
    let coordinator = Arc::new(SseCoordinator::new(config.server.push_channel_capacity));

    let engine = Arc::new(ChatEngine::new(
        users,
        conversations,
        messages,
        context,
        generator,
        coordinator.clone(),
        &config.ai,
    ));

    Ok(Arc::new(AppState {
        engine,
        coordinator,
        config,
    }))
}

/// Creates the CORS layer for the application.
pub fn create_cors_layer() -> CorsLayer {
    use http::Method;

    let methods = vec![
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
    ];

    CorsLayer::new()
        .allow_methods(AllowMethods::list(methods))
        .allow_headers(AllowHeaders::any())
        .allow_origin(AllowOrigin::any())
}

/// Creates the main application router with all middleware and routes.
pub fn create_app_router(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let cors = create_cors_layer();
    let context_state = RequestContextState::from_config(&state.config);

    Router::new()
        .nest("/api/chat", routes::chat::create_chat_router())
        .merge(routes::health::create_health_router())
        .route("/metrics", get(metrics_endpoint))
        .route("/api-docs/openapi.json", get(openapi_json))
        .layer(Extension(metrics_handle))
        .layer(cors)
        .layer(tracer::create_trace_layer())
        .layer(axum::middleware::from_fn_with_state(
            context_state,
            request_context::assign_request_context,
        ))
        .with_state(state)
}

/// Creates the graceful shutdown signal handler.
pub async fn create_shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    info!("Shutting down...");
}

/// Starts the backend server and binds it to the configured port.
///
/// # Errors
/// Returns an error if the server fails to start.
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    initialize_tracing(&config);
    info!("Starting server...");

    let metrics_handle = metrics_handle();
    let config = Arc::new(config);

    let pool = if config.database.url.is_empty() {
        warn!("no database url configured; using in-memory repositories");
        None
    } else {
        let pool = create_database_pool(&config.database).await?;
        crate::db::bootstrap::ensure_liveness(&pool).await?;
        crate::db::bootstrap::run(&pool).await?;
        Some(pool)
    };

    let state = create_app_state(config.clone(), pool)?;
    let app = create_app_router(state, metrics_handle);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    serve(listener, app)
        .with_graceful_shutdown(create_shutdown_signal())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{Body, to_bytes},
        http::Request,
    };
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let config = Arc::new(Config::with_defaults());
        create_app_state(config, None).expect("state builds without a database")
    }

    #[test]
    fn env_filter_falls_back_to_info_for_unknown_levels() {
        let mut config = Config::with_defaults();
        config.logging.level = "definitely-not-a-level".to_string();
        let filter = build_env_filter(&config);
        assert!(filter.to_string().contains("info"));
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let _ = metrics_handle();
        let app = create_app_router(test_state(), metrics_handle());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_payload() {
        let _ = metrics_handle();
        let app = create_app_router(test_state(), metrics_handle());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get(header::CONTENT_TYPE).unwrap();
        assert_eq!(content_type, "text/plain; version=0.0.4");

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8(bytes.to_vec()).is_ok());
    }

    #[tokio::test]
    async fn chat_routes_reject_missing_identity() {
        let _ = metrics_handle();
        let app = create_app_router(test_state(), metrics_handle());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/chat/conversations")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
