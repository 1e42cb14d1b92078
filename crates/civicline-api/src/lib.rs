//! Civicline API crate - axum HTTP surface over the conversation engine.
//!
//! Exposes the inbound turn API, gateway webhooks, conversation lookup
//! and close, explicit user deletion, and a health check.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use state::AppState;
