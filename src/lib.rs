//! boardfed - federation exchange engine for imageboard instances
//!
//! Each board is a `Group` actor; the instance root (`main`) sits at the
//! base URL and follows every local board.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub endpoints (actors, inboxes, collections)     │
//! │  - WebFinger, metrics, health                               │
//! │  - Admin API (boards, follows, posts, reports)              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                            │
//! │  - Board creation, follows, publishing, reports             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Engine                         │
//! │  - Actor directory, HTTP signatures, activity state machine │
//! │  - Delivery queue with retry                                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! │  - Remote actor cache (moka)                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

use federation::{
    ActivityMachine, ActorDirectory, CollectionResolver, Deliverer, DeliveryQueue, HttpTransport,
    RetryPolicy, Transport,
};

/// Request bodies larger than this are refused before parsing
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Local persistence
    pub store: Arc<dyn data::Store>,

    /// Local and remote actor lookup
    pub directory: Arc<ActorDirectory>,

    /// Outbound delivery worker
    pub queue: Arc<DeliveryQueue>,

    /// Board-level workflows
    pub boards: Arc<service::BoardService>,
}

impl AppState {
    /// Initialize application state with the network transport
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        let transport = Arc::new(HttpTransport::new(&config.federation)?);
        Self::with_transport(config, transport).await
    }

    /// Initialize application state over an explicit transport
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build the actor directory and state machine
    /// 3. Start the delivery queue
    /// 4. Ensure the root actor exists
    /// 5. Re-apply the archive window
    pub async fn with_transport(
        config: config::AppConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let store: Arc<dyn data::Store> =
            Arc::new(data::SqliteStore::connect(&config.database.path).await?);

        // 2. Directory and state machine
        let directory = Arc::new(ActorDirectory::new(
            config.server.base_url(),
            config.server.domain.clone(),
            store.clone(),
            transport.clone(),
            data::ActorCache::new(config.boards.actor_cache_capacity),
        ));
        let machine = ActivityMachine::new(
            store.clone(),
            directory.clone(),
            CollectionResolver::new(transport.clone()),
            config.boards.archive_window,
        );

        // 3. Delivery queue
        let queue = Arc::new(DeliveryQueue::start(
            Deliverer::new(transport, RetryPolicy::from_config(&config.federation)),
            directory.clone(),
            &config.federation,
        ));

        let boards = Arc::new(service::BoardService::new(
            &config,
            store.clone(),
            directory.clone(),
            machine,
            queue.clone(),
        ));

        // 4. Root actor
        let main = boards.ensure_main_actor().await?;
        tracing::info!(actor = %main.id, "Root actor ready");

        // 5. Archive window
        let archived = boards.archive_all().await?;
        if archived > 0 {
            tracing::info!(archived, "Archived threads outside the window");
        }

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            store,
            directory,
            queue,
            boards,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{
        compression::CompressionLayer, limit::RequestBodyLimitLayer, trace::TraceLayer,
    };

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .nest("/admin", api::admin_router())
        .merge(api::activitypub_router())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
        .merge(api::metrics_router())
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Invalid CORS origin; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
