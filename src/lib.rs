pub mod backend;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod mcp;
pub mod middleware;
pub mod process;
pub mod sanitize;
pub mod server;
pub mod session;
pub mod transport;

// Make test_utils available for both unit tests and integration tests
pub mod test_utils;

use std::sync::Arc;

pub use gateway::Gateway;
pub use server::build_router;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}
