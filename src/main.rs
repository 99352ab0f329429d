//! Cuotiben · error book backend
//!
//! - Axum HTTP API for capturing, de-duplicating and practising wrong questions
//! - Routing of each capture to a general, math or vision model backend
//!
//! Important env variables:
//!   PORT                  : u16 (default 3000)
//!   GENERAL_API_KEY       : general text backend (DeepSeek compatible)
//!   GENERAL_BASE_URL      : default "https://api.deepseek.com"
//!   GENERAL_MODEL         : default "deepseek-chat"
//!   MATH_API_KEY / MATH_BASE_URL / MATH_MODEL       : default qwen-math-turbo on DashScope
//!   VISION_API_KEY / VISION_BASE_URL / VISION_MODEL : default qwen-vl-max on DashScope
//!   BACKEND_TIMEOUT_SECS  : per-call timeout (default 90)
//!   APP_CONFIG_PATH       : path to TOML config (prompts + routing tables)
//!   LOG_LEVEL             : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT            : "pretty" (default) or "json"

mod telemetry;
mod util;
mod domain;
mod error;
mod config;
mod keywords;
mod dedup;
mod routing;
mod flow;
mod backends;
mod store;
mod stats;
mod practice;
mod chat;
mod ingest;
mod state;
mod protocol;
mod routes;

use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{info, instrument};

use crate::routes::build_router;
use crate::state::AppState;

#[instrument(level = "info", skip_all)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  telemetry::init_tracing();

  // Shared state: question store, routing engine, prompts, backend clients.
  let state = Arc::new(AppState::new()?);

  let app = build_router(state.clone());

  let addr = SocketAddr::from(([0, 0, 0, 0], config::port_from_env()));
  let listener = TcpListener::bind(addr).await?;
  info!(target: "cuotiben_backend", %addr, "HTTP server listening");
  axum::serve(listener, app).await?;
  Ok(())
}
