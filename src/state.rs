//! Application state shared by every handler.
//!
//! This module owns:
//!   - the question store (one error book per owner)
//!   - the routing engine, built once from the configured keyword tables
//!   - the prompts struct (from TOML or defaults)
//!   - the backend invoker (HTTP clients in production, fakes in tests)

use std::sync::Arc;

use tracing::{info, instrument};

use crate::backends::{BackendInvoker, HttpBackends};
use crate::config::{load_app_config_from_env, AppConfig, BackendSettings, Prompts};
use crate::error::BackendError;
use crate::routing::RoutingEngine;
use crate::store::QuestionStore;

#[derive(Clone)]
pub struct AppState {
    pub store: QuestionStore,
    pub routing: RoutingEngine,
    pub prompts: Prompts,
    pub backends: Arc<dyn BackendInvoker>,
}

impl AppState {
    /// Build state from env: load TOML config, read backend endpoints, build clients.
    #[instrument(level = "info", skip_all)]
    pub fn new() -> Result<Self, BackendError> {
        let config = load_app_config_from_env();
        let settings = BackendSettings::from_env();
        let backends = HttpBackends::new(settings, config.prompts.clone())?;
        Ok(Self::with_parts(config, Arc::new(backends)))
    }

    /// Assemble state from an already loaded config and any invoker.
    pub fn with_parts(config: AppConfig, backends: Arc<dyn BackendInvoker>) -> Self {
        info!(
            target: "cuotiben_backend",
            subjects = config.routing.subjects.len(),
            math_label = %config.routing.math_label,
            "Routing tables ready"
        );
        Self {
            store: QuestionStore::new(),
            routing: RoutingEngine::new(config.routing),
            prompts: config.prompts,
            backends,
        }
    }
}
