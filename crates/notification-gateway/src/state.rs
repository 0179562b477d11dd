//! 应用状态定义

use std::sync::Arc;
use std::time::Duration;

use notify_shared::database::Database;

use crate::lifecycle::ShutdownSignal;
use crate::registry::ConnectionRegistry;

/// Axum 应用共享状态
#[derive(Clone)]
pub struct AppState {
    /// 在线连接注册表，与分发引擎共享
    pub registry: Arc<ConnectionRegistry>,
    /// 就绪探针使用的数据库连接
    pub db: Database,
    /// 服务关闭时通知所有连接的读循环退出
    pub shutdown: ShutdownSignal,
    /// 新连接的写超时
    pub write_timeout: Duration,
}

impl AppState {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        db: Database,
        shutdown: ShutdownSignal,
        write_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            db,
            shutdown,
            write_timeout,
        }
    }
}
