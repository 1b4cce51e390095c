use ablage_config::{LogFormat, LoggingConfig};
use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// 初始化全局日志，`RUST_LOG` 优先于配置中的级别
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| anyhow!("invalid log level {:?}: {}", config.level, e))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    match config.format {
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
        LogFormat::Pretty => builder.try_init(),
    }
    .map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}
