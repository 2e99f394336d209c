pub mod config;
pub mod handlers;
pub mod server;
pub mod shutdown;
pub mod tasks;
pub mod ws;

pub use config::ServerConfig;
pub use handlers::pipeline_for_config;
pub use server::{build_router, start, AppState, ServerHandle};
