//! 通知模板
//!
//! 每种事件类型对应一个固定的纯文本模板，客户端直接展示，不携带结构化数据。

use crate::events::Topic;

/// 根据事件类型和触发者昵称渲染通知文本
pub fn render(topic: Topic, actor_name: &str) -> String {
    match topic {
        Topic::Like => format!("{actor_name} liked your post"),
        Topic::Post => format!("{actor_name} published a new post"),
        Topic::Follow => format!("{actor_name} followed you"),
        Topic::Unfollow => format!("{actor_name} unfollowed you"),
    }
}
