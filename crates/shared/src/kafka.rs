//! Kafka 消费端封装
//!
//! 把 rdkafka 的借用消息转换为可跨 await 传递的拥有型消息，
//! 并把位点确认收敛为"处理完成后显式 mark"这一种语义。

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use tracing::info;

use crate::config::KafkaConfig;
use crate::error::NotifyError;

/// 上游社交服务发布的活动事件 topic，名称由生产者约定，不可更改
pub mod topics {
    pub const LIKE: &str = "like";
    pub const POST: &str = "post";
    pub const FOLLOW: &str = "follow";
    pub const UNFOLLOW: &str = "unfollow";
}

/// 拥有所有权的 Kafka 消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
    /// 生产者写入时间（毫秒），broker 未提供时为 None
    pub timestamp: Option<i64>,
}

impl From<&BorrowedMessage<'_>> for ConsumerMessage {
    fn from(msg: &BorrowedMessage<'_>) -> Self {
        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            // 空负载（tombstone）保留为空字节，交给解码阶段报错
            payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            timestamp: msg.timestamp().to_millis(),
        }
    }
}

/// 消费组成员
///
/// 关闭 `enable.auto.offset.store`：只有被 [`KafkaConsumer::mark`] 过的位点才会由后台自动提交，
/// 处理到一半崩溃的消息在重新加入后会再次投递。
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    group_id: String,
}

impl KafkaConsumer {
    /// 创建消费者，`group_id` 为 `{consumer_group}.{suffix}`
    ///
    /// 只创建客户端，不连接 broker；加入消费组发生在首次拉取时。
    pub fn new(config: &KafkaConfig, group_id_suffix: Option<&str>) -> Result<Self, NotifyError> {
        let group_id = group_id_suffix.map_or_else(
            || config.consumer_group.clone(),
            |suffix| format!("{}.{suffix}", config.consumer_group),
        );

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .create()
            .map_err(|e| NotifyError::Kafka(format!("创建消费者失败: {e}")))?;

        Ok(Self { consumer, group_id })
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn subscribe(&self, topics: &[&str]) -> Result<(), NotifyError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| NotifyError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, group_id = %self.group_id, "已加入消费组");
        Ok(())
    }

    /// 拉取下一条消息
    ///
    /// 再均衡与心跳在 rdkafka 后台线程完成，这里只在拿到消息或出错时返回。
    pub async fn recv(&self) -> Result<ConsumerMessage, NotifyError> {
        match self.consumer.recv().await {
            Ok(msg) => Ok(ConsumerMessage::from(&msg)),
            Err(e) => Err(NotifyError::Kafka(format!("接收消息失败: {e}"))),
        }
    }

    /// 确认消息已处理，存储 offset + 1（下一条待读位点）
    pub fn mark(&self, msg: &ConsumerMessage) -> Result<(), NotifyError> {
        self.consumer
            .store_offset(&msg.topic, msg.partition, msg.offset + 1)
            .map_err(|e| NotifyError::Kafka(format!("存储位点失败: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_consumer_creation_is_lazy() {
        // 地址不可达也能构造成功
        let config = KafkaConfig {
            brokers: "127.0.0.1:1".to_string(),
            ..KafkaConfig::default()
        };
        let consumer = KafkaConsumer::new(&config, Some(topics::LIKE)).unwrap();
        assert_eq!(consumer.group_id(), "notification-gateway.like");

        let shared = KafkaConsumer::new(&config, None).unwrap();
        assert_eq!(shared.group_id(), "notification-gateway");
    }
}
