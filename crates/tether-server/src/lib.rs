//! Axum HTTP + WebSocket server for the sync engine.

pub mod auth;
pub mod connection;
pub mod handlers;
pub mod server;

pub use auth::TokenKeeper;
pub use handlers::EngineState;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
