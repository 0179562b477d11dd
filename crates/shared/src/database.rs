//! PostgreSQL 只读连接池
//!
//! 网关只查询社交服务的用户、帖子和关注关系，不做写入与迁移。

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, instrument};

use crate::config::DatabaseConfig;
use crate::error::{NotifyError, Result};

/// 就绪探针单次检查的超时，避免数据库卡顿拖住探针请求
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// 连接池句柄，克隆共享同一个池
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    #[instrument(skip_all, fields(max_connections = config.max_connections))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = pool_options(config).connect(&config.url).await?;

        info!("数据库连接池已建立");
        Ok(Self { pool })
    }

    /// 只解析连接串，首次查询时才建立连接
    pub fn connect_lazy(config: &DatabaseConfig) -> Result<Self> {
        let pool = pool_options(config)
            .min_connections(0)
            .connect_lazy(&config.url)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 执行 `SELECT 1`，超时视为失败
    pub async fn health_check(&self) -> Result<()> {
        let probe = sqlx::query("SELECT 1").execute(&self.pool);

        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, probe).await {
            Ok(result) => result.map(|_| ()).map_err(NotifyError::from),
            Err(_) => Err(NotifyError::Database(sqlx::Error::PoolTimedOut)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// 关闭连接池，等待借出的连接归还
    pub async fn close(&self) {
        self.pool.close().await;
        info!("数据库连接池已关闭");
    }
}

fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
        .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
}
