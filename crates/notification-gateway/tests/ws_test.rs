//! WebSocket 接入集成测试
//!
//! 在随机端口启动真实路由，用 WebSocket 客户端验证连接的注册、推送、注销与顶替。
//! 数据库连接池按需连接，这些用例不会触发查询。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use notification_gateway::lifecycle::Lifecycle;
use notification_gateway::routes;
use notification_gateway::state::AppState;
use notification_gateway::ConnectionRegistry;
use notify_shared::config::DatabaseConfig;
use notify_shared::database::Database;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    lifecycle: Lifecycle,
}

async fn start_server() -> TestServer {
    let registry = Arc::new(ConnectionRegistry::new());
    let lifecycle = Lifecycle::new(Duration::from_secs(1));
    let db = Database::connect_lazy(&DatabaseConfig::default()).expect("lazy pool");

    let state = AppState::new(
        registry.clone(),
        db,
        lifecycle.signal(),
        Duration::from_secs(1),
    );
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        registry,
        lifecycle,
    }
}

async fn connect(addr: SocketAddr, user_id: &str) -> Client {
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/{user_id}"))
        .await
        .expect("ws connect");
    client
}

/// 等待注册表中该用户的连接满足条件，返回当时的连接 ID
async fn wait_for_connection(
    registry: &ConnectionRegistry,
    user_id: &str,
    accept: impl Fn(Option<Uuid>) -> bool,
) -> Option<Uuid> {
    for _ in 0..500 {
        let current = registry.lookup(user_id).await.map(|h| h.connection_id());
        if accept(current) {
            return current;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("等待注册表状态超时: user_id={user_id}");
}

async fn next_frame(client: &mut Client) -> Message {
    time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timeout waiting for frame")
        .expect("stream ended")
        .expect("ws read error")
}

/// 读完剩余帧直到连接结束
async fn drain(client: &mut Client) {
    let _ = time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(_)) = client.next().await {}
    })
    .await;
}

#[tokio::test]
async fn test_connection_receives_push_and_unregisters_on_close() {
    let server = start_server().await;
    let mut client = connect(server.addr, "3").await;

    wait_for_connection(&server.registry, "3", |id| id.is_some()).await;
    let handle = server.registry.lookup("3").await.unwrap();
    handle.send_text("ann liked your post").await.unwrap();

    let frame = next_frame(&mut client).await;
    assert_eq!(frame.into_text().unwrap().as_str(), "ann liked your post");

    // 客户端发出的帧被忽略，连接保持注册
    client
        .send(Message::Text("hello".into()))
        .await
        .unwrap();
    client.close(None).await.unwrap();
    drain(&mut client).await;

    wait_for_connection(&server.registry, "3", |id| id.is_none()).await;
    assert!(server.registry.is_empty().await);
}

#[tokio::test]
async fn test_shutdown_closes_open_connections() {
    let server = start_server().await;
    let mut client = connect(server.addr, "5").await;
    wait_for_connection(&server.registry, "5", |id| id.is_some()).await;

    server.lifecycle.cancel();

    match next_frame(&mut client).await {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
        other => panic!("期望关闭帧，实际为 {other:?}"),
    }
    drain(&mut client).await;

    wait_for_connection(&server.registry, "5", |id| id.is_none()).await;
}

#[tokio::test]
async fn test_second_connection_supersedes_first() {
    let server = start_server().await;

    let mut first = connect(server.addr, "3").await;
    let first_id = wait_for_connection(&server.registry, "3", |id| id.is_some())
        .await
        .unwrap();

    let mut second = connect(server.addr, "3").await;
    let second_id = wait_for_connection(&server.registry, "3", |id| {
        id.is_some_and(|id| id != first_id)
    })
    .await
    .unwrap();

    // 旧连接被服务端关闭
    assert!(matches!(next_frame(&mut first).await, Message::Close(_)));
    drain(&mut first).await;

    // 旧连接退出后不会移除新连接
    time::sleep(Duration::from_millis(100)).await;
    let current = server.registry.lookup("3").await.unwrap();
    assert_eq!(current.connection_id(), second_id);
    assert_eq!(server.registry.len().await, 1);

    current.send_text("bob followed you").await.unwrap();
    let frame = next_frame(&mut second).await;
    assert_eq!(frame.into_text().unwrap().as_str(), "bob followed you");
}

#[tokio::test]
async fn test_blank_user_id_is_rejected() {
    let server = start_server().await;

    let err = tokio_tungstenite::connect_async(format!("ws://{}/ws/%20", server.addr))
        .await
        .unwrap_err();

    match err {
        tungstenite::Error::Http(response) => assert_eq!(response.status(), 400),
        other => panic!("期望 HTTP 400，实际为 {other:?}"),
    }
    assert!(server.registry.is_empty().await);
}
