//! 路由配置模块

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;

use crate::SERVICE_NAME;
use crate::state::AppState;
use crate::ws;

/// 构建网关的全部路由
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/{user_id}", get(ws::ws_upgrade))
        // 空路径段不会匹配 {user_id}，单独返回 400
        .route("/ws", get(missing_user_id))
        .route("/ws/", get(missing_user_id))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .with_state(state)
}

async fn missing_user_id() -> Response {
    ws::bad_request("user_id 不能为空")
}

/// 存活探针：服务进程正常即返回 ok
async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME
    }))
}

/// 就绪探针：检查数据库连接，并报告当前在线连接数
async fn readiness_check(State(state): State<AppState>) -> Response {
    // 关闭阶段连接池已关闭，直接报告未就绪
    let db_ok = !state.db.is_closed() && state.db.health_check().await.is_ok();
    let connections = state.registry.len().await;

    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if db_ok { "ok" } else { "degraded" },
            "service": SERVICE_NAME,
            "connections": connections,
            "checks": {
                "database": if db_ok { "ok" } else { "fail" }
            }
        })),
    )
        .into_response()
}
