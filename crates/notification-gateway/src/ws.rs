//! WebSocket 接入
//!
//! 客户端通过 `GET /ws/{user_id}` 建立长连接，连接注册到注册表后只用于下行推送，
//! 客户端发来的帧一律丢弃。连接在客户端关闭、读写出错或服务关闭时注销。

use async_trait::async_trait;
use axum::{
    Json,
    extract::{
        Path, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::DeliveryError;
use crate::registry::{ConnectionHandle, ConnectionSink};
use crate::state::AppState;

/// WebSocket 连接的写端
///
/// 分发 worker 与读循环可能同时写入，写端用异步互斥锁串行化。
/// 写超时由 `ConnectionHandle` 施加，超时后写入 future 被丢弃，锁随之释放。
pub struct WsConnection {
    sender: Mutex<SplitSink<WebSocket, Message>>,
    closed: AtomicBool,
}

impl WsConnection {
    pub fn new(sender: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sender: Mutex::new(sender),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ConnectionSink for WsConnection {
    async fn send_text(&self, text: &str) -> Result<(), DeliveryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DeliveryError::Closed);
        }

        self.sender
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| DeliveryError::Write(e.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut sender = self.sender.lock().await;
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        };
        // 对端可能已经断开，关闭失败无需处理
        let _ = sender.send(Message::Close(Some(frame))).await;
        let _ = sender.close().await;
    }
}

/// 校验并规范化用户 ID，空白 ID 返回 None
pub fn validate_user_id(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// GET /ws/{user_id}
pub async fn ws_upgrade(
    Path(user_id): Path<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(user_id) = validate_user_id(&user_id).map(str::to_owned) else {
        warn!("拒绝连接：用户 ID 为空");
        return bad_request("user_id 不能为空");
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

pub(crate) fn bad_request(message: &str) -> Response {
    let body = json!({
        "success": false,
        "code": "INVALID_USER_ID",
        "message": message,
    });
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

/// 连接生命周期：注册 -> 读循环 -> 注销 -> 关闭
async fn handle_socket(socket: WebSocket, state: AppState, user_id: String) {
    let (sender, receiver) = socket.split();
    let handle = ConnectionHandle::new(Arc::new(WsConnection::new(sender)))
        .with_write_timeout(state.write_timeout);
    let connection_id = handle.connection_id();

    state.registry.register(user_id.clone(), handle.clone()).await;

    read_until_closed(receiver, state.clone(), &user_id).await;

    // 若已被同一用户的新连接顶替，这里不会误删新连接
    state
        .registry
        .unregister_connection(&user_id, connection_id)
        .await;
    handle.close().await;

    info!(user_id = %user_id, %connection_id, "连接已断开");
}

/// 丢弃客户端发来的帧，直到对端关闭、出错或服务关闭
async fn read_until_closed(mut receiver: SplitStream<WebSocket>, state: AppState, user_id: &str) {
    let mut shutdown = state.shutdown;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(user_id, "服务关闭，断开连接");
                break;
            }
            frame = receiver.next() => match frame {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(user_id, error = %e, "读取连接失败");
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_user_id() {
        assert_eq!(validate_user_id("42"), Some("42"));
        assert_eq!(validate_user_id("  42 "), Some("42"));
        assert_eq!(validate_user_id(""), None);
        assert_eq!(validate_user_id("   "), None);
    }

    #[test]
    fn test_bad_request_status() {
        let response = bad_request("user_id 不能为空");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
