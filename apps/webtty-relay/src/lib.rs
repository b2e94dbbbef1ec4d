pub mod config;
pub mod server;

pub use config::RelayConfig;
pub use server::{router, serve, serve_with, RelayState};
