//! SQLx Postgres 连接池初始化与健康检查
//!
//! 用法：
//! let pool = init_pool(&config.database).await?;
//! health_check(&pool).await?;

use std::time::Duration;

use crate::config::DatabaseConfig;

pub type PgPool = sqlx::Pool<sqlx::Postgres>;

/// 初始化连接池
///
/// - max_connections: 来自配置，超出 1..=200 时回落到 16
/// - idle_timeout / max_lifetime 避免连接泄漏
pub async fn init_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let max_conns = Some(config.max_connections)
        .filter(|&n| n > 0 && n <= 200)
        .unwrap_or(16);
    let min_conns = Some(config.min_connections)
        .filter(|&n| n <= max_conns)
        .unwrap_or(2.min(max_conns));

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(max_conns)
        .min_connections(min_conns)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(1800))
        .test_before_acquire(true)
        .connect(&config.url)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to address registry database");
            e
        })?;

    health_check(&pool).await?;

    Ok(pool)
}

/// 健康检查
pub async fn health_check(pool: &PgPool) -> Result<(), sqlx::Error> {
    let _: (chrono::DateTime<chrono::Utc>,) = sqlx::query_as("SELECT CURRENT_TIMESTAMP")
        .fetch_one(pool)
        .await?;
    Ok(())
}
