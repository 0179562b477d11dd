//! 通知网关错误类型
//!
//! 按故障阶段划分：解码、接收者解析、连接写入。
//! 三类错误都只记录日志并确认消息，不会触发重新投递。

use std::fmt;

use thiserror::Error;

use crate::events::Topic;

/// 消息负载无法解码
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("事件反序列化失败: topic={topic}, 原因={source}")]
    Malformed {
        topic: Topic,
        #[source]
        source: serde_json::Error,
    },

    #[error("未知的 topic: {0}")]
    UnknownTopic(String),
}

/// 接收者解析失败
#[derive(Debug, Error)]
pub enum ResolveError {
    /// 引用的实体不存在（如帖子已删除），重试也不会成功
    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: &'static str, id: i64 },

    #[error("查询失败: {0}")]
    Backend(#[from] sqlx::Error),
}

impl ResolveError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// 向单个连接写入失败
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    #[error("连接已关闭")]
    Closed,

    #[error("写入连接失败: {0}")]
    Write(String),

    /// 对端长时间不读取，写缓冲区已满
    #[error("写入连接超时: {0:?}")]
    Timeout(std::time::Duration),
}

/// 扇出推送中单个接收者的失败记录
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    /// 接收者在解析结果中的下标
    pub index: usize,
    pub recipient_id: String,
    pub error: DeliveryError,
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({}): {}", self.index, self.recipient_id, self.error)
    }
}

fn join_failures(failures: &[DeliveryFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// 单条事件分发失败
///
/// `PartialDelivery` 表示部分接收者已经收到通知，调用方不能把它当作"未送达"。
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("解析接收者失败: {0}")]
    Resolve(#[from] ResolveError),

    #[error("推送失败: recipient={recipient_id}, 原因={source}")]
    Delivery {
        recipient_id: String,
        #[source]
        source: DeliveryError,
    },

    #[error("{} 个接收者推送失败（已送达 {}）: {}", .failures.len(), .delivered, join_failures(.failures))]
    PartialDelivery {
        failures: Vec<DeliveryFailure>,
        delivered: usize,
    },
}

/// 消费 worker 处理单条消息的错误
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl GatewayError {
    /// 指标中的 outcome 标签
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode_error",
            Self::Dispatch(DispatchError::Resolve(_)) => "resolve_error",
            Self::Dispatch(_) => "delivery_error",
        }
    }
}
