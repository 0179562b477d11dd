//! 在线连接注册表
//!
//! 维护 用户 ID -> 双工连接 的映射，是整个网关唯一的共享可变状态。
//! 查找和广播都在读锁内克隆句柄后立即释放锁，网络写入发生在锁外。
//! 每次写入与关闭都受写超时约束，不读数据的客户端不会拖住调用方。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify_shared::observability::metrics;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DeliveryError;

/// 双工连接的写端
///
/// 生产环境由 WebSocket 实现，测试中可替换为记录写入内容的假连接。
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    /// 发送一个文本帧
    async fn send_text(&self, text: &str) -> Result<(), DeliveryError>;

    /// 主动关闭连接，重复调用无副作用
    async fn close(&self);
}

/// 未单独配置时的写超时
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// 连接句柄
///
/// 克隆成本为一次 Arc 计数。`connection_id` 区分同一用户先后建立的不同连接。
#[derive(Clone)]
pub struct ConnectionHandle {
    connection_id: Uuid,
    sink: Arc<dyn ConnectionSink>,
    write_timeout: Duration,
}

impl ConnectionHandle {
    pub fn new(sink: Arc<dyn ConnectionSink>) -> Self {
        Self {
            connection_id: Uuid::now_v7(),
            sink,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// 写入一个文本帧，超过写超时返回 `DeliveryError::Timeout`
    pub async fn send_text(&self, text: &str) -> Result<(), DeliveryError> {
        match timeout(self.write_timeout, self.sink.send_text(text)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.write_timeout)),
        }
    }

    /// 关闭连接，对端迟迟不响应时放弃等待
    pub async fn close(&self) {
        if timeout(self.write_timeout, self.sink.close()).await.is_err() {
            debug!(connection_id = %self.connection_id, "关闭连接超时");
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

/// 在线连接注册表
#[derive(Default)]
pub struct ConnectionRegistry {
    clients: RwLock<HashMap<String, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册连接，同一用户已有连接时覆盖（后写者胜）
    ///
    /// 被顶替的旧连接在释放写锁后关闭，旧连接的读循环随之退出。
    pub async fn register(&self, recipient_id: impl Into<String>, handle: ConnectionHandle) {
        let recipient_id = recipient_id.into();
        let connection_id = handle.connection_id();

        let (superseded, count) = {
            let mut clients = self.clients.write().await;
            let superseded = clients.insert(recipient_id.clone(), handle);
            (superseded, clients.len())
        };
        metrics::set_active_connections(count);

        info!(recipient_id = %recipient_id, %connection_id, "连接已注册");

        if let Some(old) = superseded {
            info!(
                recipient_id = %recipient_id,
                superseded = %old.connection_id(),
                "同一用户建立了新连接，关闭旧连接"
            );
            old.close().await;
        }
    }

    /// 移除用户的连接，不存在时为空操作
    pub async fn unregister(&self, recipient_id: &str) {
        let mut clients = self.clients.write().await;
        if clients.remove(recipient_id).is_some() {
            debug!(recipient_id, "连接已移除");
        }
        metrics::set_active_connections(clients.len());
    }

    /// 仅当映射仍指向指定连接时才移除
    ///
    /// 连接读循环退出时调用，防止被顶替的旧连接误删新连接。返回是否发生了移除。
    pub async fn unregister_connection(&self, recipient_id: &str, connection_id: Uuid) -> bool {
        let mut clients = self.clients.write().await;
        let owned = clients
            .get(recipient_id)
            .is_some_and(|h| h.connection_id() == connection_id);

        if owned {
            clients.remove(recipient_id);
            debug!(recipient_id, %connection_id, "连接已移除");
        }
        metrics::set_active_connections(clients.len());
        owned
    }

    /// 查找用户当前的连接
    pub async fn lookup(&self, recipient_id: &str) -> Option<ConnectionHandle> {
        self.clients.read().await.get(recipient_id).cloned()
    }

    /// 向所有在线连接写入同一条消息
    ///
    /// 尽力而为，单个连接写入失败只记录日志。写入前先取出当前快照，
    /// 广播期间注册或注销的连接不受影响。
    pub async fn broadcast(&self, payload: &str) {
        let snapshot: Vec<(String, ConnectionHandle)> = self
            .clients
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();

        let writes = snapshot.iter().map(|(recipient_id, handle)| async move {
            if let Err(e) = handle.send_text(payload).await {
                warn!(recipient_id = %recipient_id, error = %e, "广播写入失败");
            }
        });
        futures::future::join_all(writes).await;
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}
