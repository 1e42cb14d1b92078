//! Application state shared across all route handlers.

use std::sync::Arc;
use std::time::Instant;

use civicline_engine::Orchestrator;

/// Shared application state.
///
/// Cloned into every handler task; the orchestrator is behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            start_time: Instant::now(),
        }
    }
}
