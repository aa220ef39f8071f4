pub mod app;
pub mod config;

pub use app::{build_router, AppState, InferenceLogRequest};
pub use config::ServiceConfig;
