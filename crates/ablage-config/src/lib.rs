pub mod loader;
pub mod model;

pub use loader::ConfigLoader;
pub use model::{
    AblageConfig, EvaluationConfig, LogFormat, LoggingConfig, NotifyConfig, ServerConfig,
    ShutdownConfig, StorageConfig, WebhookChannel,
};
