//! Prometheus 指标
//!
//! 记录端通过 metrics facade 写入，导出端在独立端口提供 `/metrics` 供 Prometheus 抓取。
//! 未安装 recorder 时（如单元测试）所有记录函数都是空操作。

use std::net::SocketAddr;
use std::sync::OnceLock;

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::ObservabilityConfig;

pub const EVENTS_TOTAL: &str = "notify_events_total";
pub const DISPATCH_DURATION_SECONDS: &str = "notify_dispatch_duration_seconds";
pub const DELIVERIES_TOTAL: &str = "notify_deliveries_total";
pub const SESSION_RESTARTS_TOTAL: &str = "notify_session_restarts_total";
pub const CONNECTIONS_ACTIVE: &str = "notify_connections_active";

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// 指标 HTTP 服务句柄
pub struct MetricsHandle {
    server: JoinHandle<()>,
}

impl MetricsHandle {
    /// 停止指标 HTTP 服务
    pub fn shutdown(self) {
        self.server.abort();
    }
}

/// 安装全局 recorder 并在 `metrics_port` 上启动导出服务
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    describe_metrics();
    metrics::counter!("service_starts_total", "service" => config.service_name.clone())
        .increment(1);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "指标服务已监听");

    let app = Router::new().route("/metrics", get(move || std::future::ready(handle.render())));
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "指标服务异常退出");
        }
    });

    Ok(MetricsHandle { server })
}

/// HELP 注释
fn describe_metrics() {
    metrics::describe_counter!(
        EVENTS_TOTAL,
        "Activity events consumed, labelled by topic and outcome"
    );
    metrics::describe_histogram!(
        DISPATCH_DURATION_SECONDS,
        "Time spent decoding and dispatching one activity event"
    );
    metrics::describe_counter!(DELIVERIES_TOTAL, "Notification writes to live connections");
    metrics::describe_counter!(
        SESSION_RESTARTS_TOTAL,
        "Consumer group sessions that ended with an error and were rejoined"
    );
    metrics::describe_gauge!(CONNECTIONS_ACTIVE, "Currently registered duplex connections");
}

/// 全局 Prometheus handle，未初始化时为 None
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 记录函数
// ============================================================================

/// 记录一次事件处理
///
/// outcome 取值：ok / decode_error / resolve_error / delivery_error
#[inline]
pub fn record_event(topic: &str, outcome: &str, duration_secs: f64) {
    metrics::counter!(
        EVENTS_TOTAL,
        "topic" => topic.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    metrics::histogram!(DISPATCH_DURATION_SECONDS, "topic" => topic.to_string())
        .record(duration_secs);
}

/// 记录一次连接写入
#[inline]
pub fn record_delivery(success: bool) {
    let status = if success { "success" } else { "failed" };
    metrics::counter!(DELIVERIES_TOTAL, "status" => status).increment(1);
}

#[inline]
pub fn record_session_restart(topic: &str) {
    metrics::counter!(SESSION_RESTARTS_TOTAL, "topic" => topic.to_string()).increment(1);
}

#[inline]
pub fn set_active_connections(count: usize) {
    metrics::gauge!(CONNECTIONS_ACTIVE).set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_without_recorder_is_noop() {
        record_event("like", "ok", 0.01);
        record_delivery(true);
        record_delivery(false);
        record_session_restart("post");
        set_active_connections(3);
        assert!(get_handle().is_none());
    }
}
