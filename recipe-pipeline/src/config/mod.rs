//! Application configuration.
//!
//! Configuration is read from environment variables (a `.env` file is loaded
//! first when present). Every setting has a default except the service
//! credentials, so a bare environment runs against an in-memory queue.

mod app;
mod env;

pub use app::{
    AppConfig, DatabaseConfig, LogConfig, PublisherConfig, QueueConfig, ServiceEndpoint,
    StorageConfig,
};
pub use env::EnvSource;
