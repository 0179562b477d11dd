//! 实时通知网关
//!
//! 消费社交活动事件，通过 WebSocket 推送给在线用户。

use std::sync::Arc;

use notification_gateway::consumer::{ConsumerGroup, KafkaSessionFactory};
use notification_gateway::lifecycle::{Lifecycle, wait_for_termination_signal};
use notification_gateway::resolver::PgRecipientResolver;
use notification_gateway::state::AppState;
use notification_gateway::{ConnectionRegistry, Dispatcher, SERVICE_NAME, routes};
use notify_shared::{
    config::AppConfig, database::Database, observability, retry::BackoffPolicy,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 统一加载配置：config/default.toml -> 环境配置 -> 服务配置 -> NOTIFY_ 环境变量
    let config = AppConfig::load(SERVICE_NAME)?;

    let mut obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    // 生产环境统一输出 JSON 日志，便于日志平台采集
    obs_config.json_logs |= config.is_production();
    let _guard = observability::init(&obs_config).await?;

    info!(
        environment = %config.environment,
        addr = %config.server_addr(),
        "Starting notification-gateway..."
    );

    // 初始化基础设施
    let db = Database::connect(&config.database).await?;
    let resolver = Arc::new(PgRecipientResolver::new(db.pool().clone()));
    let registry = Arc::new(ConnectionRegistry::new());
    let dispatcher = Dispatcher::new(registry.clone(), resolver);

    let lifecycle = Lifecycle::new(config.shutdown.grace_period());

    // 启动消费 worker
    let group = ConsumerGroup::from_config(
        KafkaSessionFactory::new(config.kafka.clone()),
        dispatcher,
        &config.kafka,
        BackoffPolicy::from(&config.backoff),
    )?;
    let workers = group.spawn(&lifecycle.signal());

    // 启动 WebSocket 接入
    let app = routes::router(AppState::new(
        registry,
        db.clone(),
        lifecycle.signal(),
        config.server.write_timeout(),
    ));
    let listener = TcpListener::bind(config.server_addr()).await?;
    info!("Listening on {}", config.server_addr());

    let mut server_shutdown = lifecycle.signal();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    // 收到终止信号，或 HTTP 服务提前退出时开始关闭
    let early_exit = tokio::select! {
        _ = wait_for_termination_signal() => None,
        result = &mut server => {
            error!("HTTP 服务提前退出，开始关闭");
            Some(result)
        }
    };

    let drained = lifecycle.shutdown(workers).await;
    if !drained {
        warn!("部分消费 worker 未在宽限期内退出");
    }

    let server_result = match early_exit {
        Some(result) => result,
        None => match tokio::time::timeout(lifecycle.grace_period(), server).await {
            Ok(result) => result,
            Err(_) => {
                warn!("HTTP 服务未在宽限期内关闭");
                Ok(Ok(()))
            }
        },
    };

    db.close().await;
    info!("notification-gateway shutdown complete");

    server_result??;
    Ok(())
}
