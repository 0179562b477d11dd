//! 社交活动实时通知网关
//!
//! 从 Kafka 消费 like / post / follow / unfollow 事件，解析需要通知的用户，
//! 通过 WebSocket 将纯文本通知推送给在线用户。
//!
//! ## 模块结构
//!
//! - `events`: 事件类型与按 topic 解码
//! - `resolver`: 接收者解析（PostgreSQL）
//! - `registry`: 在线连接注册表
//! - `dispatch`: 事件分发引擎
//! - `consumer`: 按 topic 并行的消费 worker 与会话重连
//! - `lifecycle`: 关闭信号与宽限期
//! - `ws` / `routes`: WebSocket 接入与探针路由

pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod registry;
pub mod resolver;
pub mod routes;
pub mod state;
pub mod templates;
pub mod test_utils;
pub mod ws;

pub use dispatch::{DispatchReport, Dispatcher};
pub use error::{DecodeError, DeliveryError, DispatchError, GatewayError, ResolveError};
pub use events::{ActivityEvent, Topic};
pub use registry::{ConnectionHandle, ConnectionRegistry};

/// 服务名，用于配置加载、日志与探针响应
pub const SERVICE_NAME: &str = "notification-gateway";
