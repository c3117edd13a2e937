//! HTTP control plane and worker supervision.
//!
//! The REST surface mirrors the deployment's other services: configuration
//! is POSTed as JSON, workers are started and stopped through `/control`,
//! and the registry's derived state is exposed read-only. Worker teardown
//! goes through the command exchange (`stop-<module>`); the supervisor only
//! observes task exit and flips the health status.

use crate::annotator::{self, Annotator};
use crate::config::ServiceConfig;
use crate::detector::{self, Detector};
use crate::fabric::{routing, Fabric, Serializer, COMMAND_EXCHANGE};
use crate::policy::ConfigDoc;
use crate::registry::{ApplyOutcome, SharedRegistry};
use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

// =============================================================================
// Supervisor
// =============================================================================

/// Starts the data workers and tracks their lifetime.
pub struct Supervisor {
    config: Arc<ServiceConfig>,
    registry: Arc<SharedRegistry>,
    fabric: Arc<Fabric>,
}

impl Supervisor {
    pub fn new(
        config: Arc<ServiceConfig>,
        registry: Arc<SharedRegistry>,
        fabric: Arc<Fabric>,
    ) -> Self {
        Self {
            config,
            registry,
            fabric,
        }
    }

    /// Spawn the annotator and detector workers. Idempotent: a second start
    /// while workers are alive reports `already running`.
    pub fn start(&self) -> &'static str {
        if !self.registry.try_start_data_worker() {
            tracing::info!("data worker already running");
            return "already running";
        }

        let annotator = Annotator::new(self.fabric.clone(), self.registry.clone());
        let detector = Detector::new(self.fabric.clone(), self.config.hijack_outdated_secs);
        let registry = self.registry.clone();

        tokio::spawn(async move {
            let annotator_task = tokio::spawn(annotator.run());
            let detector_task = tokio::spawn(detector.run());
            for (module, task) in [
                (annotator::MODULE_NAME, annotator_task),
                (detector::MODULE_NAME, detector_task),
            ] {
                match task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => tracing::error!(module, %error, "data worker failed"),
                    Err(error) => tracing::error!(module, %error, "data worker panicked"),
                }
            }
            registry.set_data_worker_running(false);
        });

        tracing::info!("data worker started");
        "instructed to start"
    }

    /// Publish stop commands for both workers.
    pub async fn stop(&self) -> &'static str {
        for module in [annotator::MODULE_NAME, detector::MODULE_NAME] {
            if let Err(error) = self
                .fabric
                .publish(
                    COMMAND_EXCHANGE,
                    &routing::stop(module),
                    Serializer::Ujson,
                    &"",
                )
                .await
            {
                tracing::warn!(module, %error, "failed to publish stop command");
            }
        }
        "instructed to stop"
    }
}

// =============================================================================
// HTTP surface
// =============================================================================

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct ServiceState {
    pub config: Arc<ServiceConfig>,
    pub registry: Arc<SharedRegistry>,
    pub fabric: Arc<Fabric>,
    pub supervisor: Arc<Supervisor>,
}

impl ServiceState {
    pub fn new(config: ServiceConfig) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(SharedRegistry::new());
        let fabric = Arc::new(Fabric::new());
        let supervisor = Arc::new(Supervisor::new(
            config.clone(),
            registry.clone(),
            fabric.clone(),
        ));
        Self {
            config,
            registry,
            fabric,
            supervisor,
        }
    }
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    success: bool,
    message: String,
}

impl ControlResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }

    fn fail(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            message: message.into(),
        })
    }
}

/// Build the control-plane router.
pub fn create_app(state: ServiceState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/config", post(config_handler))
        .route("/control", post(control_handler))
        .route("/health", get(health_handler))
        .route("/monitors", get(monitors_handler))
        .route("/configuredPrefixCount", get(configured_prefix_count_handler))
        .route("/monitoredPrefixes", get(monitored_prefixes_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn config_handler(
    State(state): State<ServiceState>,
    Json(body): Json<Value>,
) -> Json<ControlResponse> {
    let applied = serde_json::from_value::<ConfigDoc>(body)
        .context("parsing configuration document")
        .and_then(|doc| state.registry.apply(&doc));
    match applied {
        Ok(ApplyOutcome::Installed) => ControlResponse::ok("configured"),
        Ok(ApplyOutcome::Stale) => ControlResponse::ok("no-op"),
        Err(error) => {
            tracing::error!(%error, "configuration rejected");
            ControlResponse::fail(format!(
                "error during {} configuration",
                state.config.module_name
            ))
        }
    }
}

async fn control_handler(
    State(state): State<ServiceState>,
    Json(body): Json<Value>,
) -> Json<ControlResponse> {
    match body.get("command").and_then(Value::as_str) {
        Some("start") => ControlResponse::ok(state.supervisor.start()),
        Some("stop") => ControlResponse::ok(state.supervisor.stop().await),
        Some(_) => ControlResponse::fail("unknown command"),
        None => ControlResponse::fail("error during control"),
    }
}

async fn health_handler(State(state): State<ServiceState>) -> Json<Value> {
    let status = if !state.registry.configured() {
        "unconfigured"
    } else if state.registry.data_worker_running() {
        "running"
    } else {
        "stopped"
    };
    Json(json!({ "status": status }))
}

async fn monitors_handler(State(state): State<ServiceState>) -> Json<Value> {
    Json(json!({ "monitors": state.registry.monitors() }))
}

async fn configured_prefix_count_handler(State(state): State<ServiceState>) -> Json<Value> {
    Json(json!({ "configured_prefix_count": state.registry.configured_prefix_count() }))
}

async fn monitored_prefixes_handler(State(state): State<ServiceState>) -> Json<Value> {
    Json(json!({ "monitored_prefixes": state.registry.monitored_prefixes() }))
}

// =============================================================================
// Startup
// =============================================================================

/// Try one configuration pull from the configuration service. The service
/// may have restarted while a configuration exists; failure just means the
/// configuration will arrive via POST later.
pub async fn fetch_initial_config(state: &ServiceState) {
    let url = state.config.configuration_url();
    let fetched = async {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        let doc: ConfigDoc = client.get(&url).send().await?.json().await?;
        state.registry.apply(&doc)
    }
    .await;
    match fetched {
        Ok(_) => tracing::info!(%url, "configuration pulled on startup"),
        Err(error) => tracing::info!(
            %url,
            %error,
            "could not get configuration upon startup, will get via POST later"
        ),
    }
}

/// Serve the control plane until the process is terminated.
pub async fn start_server(state: ServiceState) -> Result<()> {
    let bind_address = state.config.bind_address();
    let app = create_app(state);
    tracing::info!("REST worker listening on {}", bind_address);
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
