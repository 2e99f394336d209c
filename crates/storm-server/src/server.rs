use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use storm_engine::{ConnectionRegistry, CorrelationBroker, ResearchOrchestrator};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::handlers;
use crate::shutdown::ShutdownCoordinator;
use crate::tasks::TaskTracker;
use crate::ws;

/// Shared state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<ConnectionRegistry>,
    pub broker: Arc<CorrelationBroker>,
    pub orchestrator: Arc<ResearchOrchestrator>,
    pub tasks: Arc<TaskTracker>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.max_send_queue));
        let broker = CorrelationBroker::new(Arc::clone(&registry), config.ask_timeout());
        let orchestrator = Arc::new(ResearchOrchestrator::new(
            Arc::clone(&broker),
            config.workflow_config(),
        ));
        Self {
            config: Arc::new(config),
            registry,
            broker,
            orchestrator,
            tasks: Arc::new(TaskTracker::new()),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/{session_id}", get(ws::ws_handler))
        .route(
            "/research/interactive/{session_id}",
            post(handlers::start_interactive_research),
        )
        .route("/research/tasks", get(handlers::list_tasks))
        .route(
            "/research/tasks/{id}",
            get(handlers::get_task).delete(handlers::delete_task),
        )
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. The returned handle owns the server task.
pub async fn start(config: ServerConfig) -> Result<ServerHandle, std::io::Error> {
    let addr = config.bind_addr();
    let state = AppState::new(config);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let router = build_router(state.clone());
    let token = state.shutdown.token();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(token.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    tracing::info!(addr = %local_addr, "STORM server started");
    Ok(ServerHandle {
        port: local_addr.port(),
        state,
        server,
    })
}

pub struct ServerHandle {
    pub port: u16,
    state: AppState,
    server: JoinHandle<()>,
}

impl ServerHandle {
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stop workflows, close every session and drain the listener.
    pub async fn shutdown(self) {
        self.state.orchestrator.shutdown();
        let closed = self.state.registry.shutdown();
        tracing::info!(sessions = closed, "closed sessions");
        self.state
            .shutdown
            .graceful_shutdown(vec![self.server], self.state.config.shutdown_timeout())
            .await;
    }
}
