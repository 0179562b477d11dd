//! 事件分发引擎
//!
//! 对每条解码后的事件执行：解析接收者 -> 查找在线连接 -> 渲染文本 -> 写入连接。
//! 引擎本身不持有可变状态，可被多个消费 worker 并发调用。
//!
//! 失败语义：
//! - 接收者不在线是正常情况，不算错误；
//! - 接收者解析失败（记录不存在或查询出错）直接返回错误；
//! - 扇出推送时单个连接写入失败不影响其他接收者，所有失败汇总为一个错误返回。

use std::sync::Arc;

use notify_shared::observability::metrics;
use tracing::{debug, info, warn};

use crate::error::{DeliveryFailure, DispatchError};
use crate::events::{ActivityEvent, Topic};
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::resolver::RecipientResolver;
use crate::templates;

/// 单条事件的分发结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchReport {
    /// 解析出的接收者数量
    pub recipients: usize,
    /// 成功写入的连接数量
    pub delivered: usize,
}

/// 事件分发引擎
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    resolver: Arc<dyn RecipientResolver>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, resolver: Arc<dyn RecipientResolver>) -> Self {
        Self { registry, resolver }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// 分发一条事件
    pub async fn dispatch(&self, event: &ActivityEvent) -> Result<DispatchReport, DispatchError> {
        debug!(topic = %event.topic(), actor_id = event.actor_id(), "开始分发事件");

        match *event {
            ActivityEvent::Like { actor_id, post_id } => self.dispatch_like(actor_id, post_id).await,
            ActivityEvent::Post { actor_id, .. } => self.dispatch_post(actor_id).await,
            ActivityEvent::Follow {
                actor_id,
                target_id,
            }
            | ActivityEvent::Unfollow {
                actor_id,
                target_id,
            } => {
                self.dispatch_relation(event.topic(), actor_id, target_id)
                    .await
            }
        }
    }

    /// 点赞：通知帖子作者
    async fn dispatch_like(
        &self,
        actor_id: i64,
        post_id: i64,
    ) -> Result<DispatchReport, DispatchError> {
        let owner_id = self.resolver.resolve_like_owner(post_id).await?;

        let Some(conn) = self.registry.lookup(&owner_id.to_string()).await else {
            debug!(recipient_id = owner_id, post_id, "帖子作者不在线，跳过");
            return Ok(DispatchReport {
                recipients: 1,
                delivered: 0,
            });
        };

        let actor_name = self.resolver.resolve_display_name(actor_id).await?;
        let text = templates::render(Topic::Like, &actor_name);

        deliver_single(owner_id, &conn, &text).await
    }

    /// 发帖：扇出通知所有在线关注者
    async fn dispatch_post(&self, actor_id: i64) -> Result<DispatchReport, DispatchError> {
        let followers = self.resolver.resolve_followers(actor_id).await?;

        let mut connected: Vec<(usize, String, ConnectionHandle)> = Vec::new();
        for (index, follower_id) in followers.iter().enumerate() {
            let recipient_id = follower_id.to_string();
            match self.registry.lookup(&recipient_id).await {
                Some(conn) => connected.push((index, recipient_id, conn)),
                None => debug!(recipient_id = %recipient_id, "关注者不在线，跳过"),
            }
        }

        if connected.is_empty() {
            debug!(actor_id, followers = followers.len(), "没有在线关注者");
            return Ok(DispatchReport {
                recipients: followers.len(),
                delivered: 0,
            });
        }

        let actor_name = self.resolver.resolve_display_name(actor_id).await?;
        let text = templates::render(Topic::Post, &actor_name);

        // 并行写入，单个慢连接或坏连接不阻塞其他关注者
        let writes = connected.iter().map(|(index, recipient_id, conn)| {
            let text = &text;
            async move {
                let result = conn.send_text(text).await;
                metrics::record_delivery(result.is_ok());
                result.map_err(|error| DeliveryFailure {
                    index: *index,
                    recipient_id: recipient_id.clone(),
                    error,
                })
            }
        });

        let results = futures::future::join_all(writes).await;
        let attempted = results.len();
        let failures: Vec<DeliveryFailure> = results.into_iter().filter_map(Result::err).collect();
        let delivered = attempted - failures.len();

        for failure in &failures {
            warn!(
                index = failure.index,
                recipient_id = %failure.recipient_id,
                error = %failure.error,
                "推送到关注者失败"
            );
        }

        info!(
            actor_id,
            followers = followers.len(),
            connected = attempted,
            delivered,
            "发帖通知扇出完成"
        );

        if failures.is_empty() {
            Ok(DispatchReport {
                recipients: followers.len(),
                delivered,
            })
        } else {
            Err(DispatchError::PartialDelivery {
                failures,
                delivered,
            })
        }
    }

    /// 关注 / 取消关注：通知被关注者
    async fn dispatch_relation(
        &self,
        topic: Topic,
        actor_id: i64,
        target_id: i64,
    ) -> Result<DispatchReport, DispatchError> {
        let Some(conn) = self.registry.lookup(&target_id.to_string()).await else {
            debug!(recipient_id = target_id, %topic, "被关注者不在线，跳过");
            return Ok(DispatchReport {
                recipients: 1,
                delivered: 0,
            });
        };

        let actor_name = self.resolver.resolve_relation_name(actor_id).await?;
        let text = templates::render(topic, &actor_name);

        deliver_single(target_id, &conn, &text).await
    }
}

/// 向单个接收者写入
async fn deliver_single(
    recipient_id: i64,
    conn: &ConnectionHandle,
    text: &str,
) -> Result<DispatchReport, DispatchError> {
    let result = conn.send_text(text).await;
    metrics::record_delivery(result.is_ok());

    match result {
        Ok(()) => {
            debug!(recipient_id, "通知已推送");
            Ok(DispatchReport {
                recipients: 1,
                delivered: 1,
            })
        }
        Err(source) => Err(DispatchError::Delivery {
            recipient_id: recipient_id.to_string(),
            source,
        }),
    }
}
