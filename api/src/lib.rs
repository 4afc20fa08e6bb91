mod error;
mod handlers;
mod server;

pub use error::{ApiError, ApiResult};
pub use server::Server;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9013))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}
