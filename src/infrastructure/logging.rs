//! 日志系统配置模块
//! 结构化日志（JSON）或文本日志，级别由 RUST_LOG 或配置决定

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::LoggingConfig;

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// 初始化日志系统（只能调用一次）
pub fn init_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = build_filter(config);

    if config.format == "json" {
        Registry::default()
            .with(filter)
            .with(fmt::layer().json().with_current_span(false))
            .try_init()?;
    } else {
        Registry::default()
            .with(filter)
            .with(fmt::layer().with_target(true).with_ansi(true))
            .try_init()?;
    }

    Ok(())
}

/// 测试和工具使用：已初始化时静默忽略
pub fn init_default_logging() {
    let config = LoggingConfig::default();
    if let Err(e) = init_logging(&config) {
        tracing::debug!(error = %e, "logging already initialised");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_falls_back_to_config_level() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            format: "json".to_string(),
        };
        let filter = build_filter(&config);
        if std::env::var("RUST_LOG").is_err() {
            assert_eq!(filter.to_string(), "debug");
        }
    }

    #[test]
    fn test_second_init_is_harmless() {
        init_default_logging();
        init_default_logging();
    }
}
