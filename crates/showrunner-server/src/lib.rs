//! Showrunner API server: authenticated HTTP surface over the dispatch core

pub mod auth;
pub mod config;
pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Settings;
pub use error::{ApiError, ApiResult};
pub use routes::app;
pub use state::AppState;
