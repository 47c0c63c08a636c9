//! 地址注册表迁移工具
//! 只负责建表，不依赖种子与 RPC 配置

use anyhow::{Context, Result};
use ironcore_engine::{
    config::Config,
    infrastructure::{db, logging::init_logging},
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config_path = std::env::var("CONFIG_PATH").ok();
    let config = Config::from_env_and_file(config_path.as_deref())?;
    init_logging(&config.logging).map_err(|e| anyhow::anyhow!("Failed to init logging: {}", e))?;

    let pool = db::init_pool(&config.database)
        .await
        .context("Failed to connect to address registry database")?;

    let migrator = sqlx::migrate!("./migrations");
    match migrator.run(&pool).await {
        Ok(()) => {}
        Err(sqlx::migrate::MigrateError::VersionMismatch(version)) => {
            anyhow::bail!(
                "migration {version} was modified after it was applied; restore the original file"
            );
        }
        Err(e) => return Err(e.into()),
    }

    for migration in migrator.iter() {
        tracing::info!(
            version = migration.version,
            description = %migration.description,
            "Migration applied"
        );
    }
    tracing::info!("Address registry migrations finished");
    Ok(())
}
