//! 可观测性初始化
//!
//! 单一入口同时配置结构化日志与 Prometheus 指标，
//! 返回的 Guard 持有指标服务，进程退出前随 Guard 一起停止。

pub mod metrics;
pub mod tracing;

use ::tracing::info;
use anyhow::Result;

pub use crate::config::ObservabilityConfig;

/// 可观测性资源守卫
///
/// 必须在 main 中保持存活；drop 时停止指标 HTTP 服务。
pub struct ObservabilityGuard {
    metrics: Option<metrics::MetricsHandle>,
}

impl ObservabilityGuard {
    /// 不持有任何资源的 Guard（指标关闭时使用）
    pub fn empty() -> Self {
        Self { metrics: None }
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.metrics.take() {
            handle.shutdown();
        }
        info!("可观测性组件已关闭");
    }
}

/// 初始化日志，然后按配置启动指标服务
///
/// ```ignore
/// let config = AppConfig::load("notification-gateway")?;
/// let obs = config.observability.clone().with_service_name(&config.service_name);
/// let _guard = observability::init(&obs).await?;
/// ```
pub async fn init(config: &ObservabilityConfig) -> Result<ObservabilityGuard> {
    tracing::init(config)?;

    let guard = if config.metrics_enabled {
        ObservabilityGuard {
            metrics: Some(metrics::init(config).await?),
        }
    } else {
        ObservabilityGuard::empty()
    };

    info!(
        service = %config.service_name,
        metrics_enabled = guard.metrics_enabled(),
        metrics_port = config.metrics_port,
        "可观测性组件已初始化"
    );

    Ok(guard)
}
