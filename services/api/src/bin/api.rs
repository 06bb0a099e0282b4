//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{DbAdapter, MemoryAdapter},
    config::{Config, StorageBackend},
    error::ApiError,
    hub::Hub,
    service::{QuizService, RetryPolicy},
    web::{
        advance_handler, create_game_handler, create_session_handler, get_game_handler,
        join_handler, player_handler, rest::ApiDoc, results_handler, state::AppState,
        stats_handler, submit_answer_handler, ws_handler,
    },
};
use axum::{
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        Method,
    },
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tinyquiz_core::ports::QuizRepository;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Choose the Repository ---
    let repository: Arc<dyn QuizRepository> = match &config.storage {
        StorageBackend::Postgres {
            url,
            max_connections,
        } => {
            info!("Connecting to database...");
            let db_pool = PgPoolOptions::new()
                .max_connections(*max_connections)
                .connect(url)
                .await?;
            let db_adapter = DbAdapter::new(db_pool);
            info!("Running database migrations...");
            db_adapter.run_migrations().await?;
            info!("Database migrations complete.");
            Arc::new(db_adapter)
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage; all data is lost on shutdown.");
            Arc::new(MemoryAdapter::new())
        }
    };

    // --- 3. Start the Hub & Build the Shared AppState ---
    let hub = Hub::spawn(config.subscriber_queue_capacity);
    let retry = RetryPolicy {
        attempts: config.tx_retry_limit,
        ..RetryPolicy::default()
    };
    let shutdown = CancellationToken::new();
    let app_state = Arc::new(AppState {
        service: QuizService::new(repository, hub, retry),
        config: config.clone(),
        shutdown: shutdown.clone(),
    });

    // --- 4. Create the Web Router ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, ACCEPT]);

    let api_router = Router::new()
        .route("/stats", get(stats_handler))
        .route("/games", post(create_game_handler))
        .route("/games/{game_id}", get(get_game_handler))
        .route("/sessions", post(create_session_handler))
        .route("/play/{session_code}", post(join_handler))
        .route("/game/{player_id}", get(player_handler))
        .route("/game/{player_id}/rpc/next", post(advance_handler))
        .route(
            "/game/{player_id}/answers/{choice_id}",
            post(submit_answer_handler),
        )
        .route("/results/{player_id}", get(results_handler))
        .route("/ws/{player_id}", get(ws_handler))
        .layer(cors)
        .with_state(app_state);

    // Merge the API router with the Swagger UI router for a complete application.
    let app = Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 5. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for the shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutting down...");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}
