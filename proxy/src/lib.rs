pub mod api;
pub mod blockchain;
pub mod config;
pub mod metrics;
pub mod orchestrator;
pub mod policy;
pub mod shares;

pub use config::{Config, ConfigError};
pub use orchestrator::{BackgroundTasks, Orchestrator, ProxyHealth};
