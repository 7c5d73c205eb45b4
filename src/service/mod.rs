pub use app_error::{AppError, AppResult};
pub use config::{BrokerConfig, CommitLogConfig, TopicConfig};
pub use tracing_config::setup_local_tracing;

mod app_error;
mod config;
mod tracing_config;
