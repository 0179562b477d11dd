//! 测试工具模块
//!
//! 提供不依赖网络与数据库的内存实现：假连接、假解析器和脚本化的消费会话，
//! 供单元测试与集成测试驱动完整的 消费 -> 分发 -> 推送 流程。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use notify_shared::error::NotifyError;
use notify_shared::kafka::ConsumerMessage;

use crate::consumer::{ConsumerSession, SessionFactory};
use crate::error::{DeliveryError, ResolveError};
use crate::events::Topic;
use crate::registry::{ConnectionHandle, ConnectionSink};
use crate::resolver::RecipientResolver;

// ==================== 假连接 ====================

/// 记录所有写入内容的假连接
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<String>>,
    closed: AtomicBool,
    fail_writes: bool,
}

impl RecordingSink {
    /// 创建正常连接，返回注册用句柄和用于断言的连接本身
    pub fn handle() -> (ConnectionHandle, Arc<RecordingSink>) {
        Self::build(false)
    }

    /// 创建每次写入都失败的连接
    pub fn failing_handle() -> (ConnectionHandle, Arc<RecordingSink>) {
        Self::build(true)
    }

    fn build(fail_writes: bool) -> (ConnectionHandle, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink {
            fail_writes,
            ..Default::default()
        });
        (ConnectionHandle::new(sink.clone()), sink)
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionSink for RecordingSink {
    async fn send_text(&self, text: &str) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        if self.fail_writes {
            return Err(DeliveryError::Write("broken pipe".to_string()));
        }
        self.messages
            .lock()
            .map_err(|e| DeliveryError::Write(e.to_string()))?
            .push(text.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// 写入永不完成的连接，模拟停止读取数据的客户端
#[derive(Default)]
pub struct StalledSink {
    attempts: AtomicUsize,
}

impl StalledSink {
    pub fn handle() -> (ConnectionHandle, Arc<StalledSink>) {
        let sink = Arc::new(StalledSink::default());
        (ConnectionHandle::new(sink.clone()), sink)
    }

    /// 已发起的写入次数
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionSink for StalledSink {
    async fn send_text(&self, _text: &str) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }

    async fn close(&self) {
        std::future::pending::<()>().await
    }
}

// ==================== 假解析器 ====================

/// 基于内存表的接收者解析器
#[derive(Debug, Clone, Default)]
pub struct FakeResolver {
    usernames: HashMap<i64, String>,
    post_owners: HashMap<i64, i64>,
    followers: HashMap<i64, Vec<i64>>,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: i64, username: &str) -> Self {
        self.usernames.insert(user_id, username.to_string());
        self
    }

    pub fn with_post(mut self, post_id: i64, owner_id: i64) -> Self {
        self.post_owners.insert(post_id, owner_id);
        self
    }

    /// 记录 follower_id 关注了 user_id
    pub fn with_follower(mut self, user_id: i64, follower_id: i64) -> Self {
        self.followers.entry(user_id).or_default().push(follower_id);
        self
    }

    fn username(&self, user_id: i64, entity: &'static str) -> Result<String, ResolveError> {
        self.usernames
            .get(&user_id)
            .cloned()
            .ok_or(ResolveError::NotFound {
                entity,
                id: user_id,
            })
    }
}

#[async_trait]
impl RecipientResolver for FakeResolver {
    async fn resolve_display_name(&self, user_id: i64) -> Result<String, ResolveError> {
        self.username(user_id, "users")
    }

    async fn resolve_like_owner(&self, post_id: i64) -> Result<i64, ResolveError> {
        self.post_owners
            .get(&post_id)
            .copied()
            .ok_or(ResolveError::NotFound {
                entity: "post",
                id: post_id,
            })
    }

    async fn resolve_followers(&self, user_id: i64) -> Result<Vec<i64>, ResolveError> {
        Ok(self.followers.get(&user_id).cloned().unwrap_or_default())
    }

    async fn resolve_relation_name(&self, user_id: i64) -> Result<String, ResolveError> {
        self.username(user_id, "follower")
    }
}

// ==================== 脚本化消费会话 ====================

/// 构造一条测试消息
pub fn message(topic: Topic, offset: i64, payload: &str) -> ConsumerMessage {
    ConsumerMessage {
        topic: topic.as_str().to_string(),
        partition: 0,
        offset,
        payload: payload.as_bytes().to_vec(),
        timestamp: None,
    }
}

/// 按脚本依次返回消息或错误的消费会话
///
/// 脚本耗尽后 `next_message` 永久挂起，模拟没有新消息的空闲会话。
pub struct ScriptedSession {
    script: VecDeque<Result<ConsumerMessage, NotifyError>>,
    marked: Arc<Mutex<Vec<i64>>>,
}

#[async_trait]
impl ConsumerSession for ScriptedSession {
    async fn next_message(&mut self) -> Result<ConsumerMessage, NotifyError> {
        match self.script.pop_front() {
            Some(step) => step,
            None => std::future::pending().await,
        }
    }

    fn mark(&mut self, msg: &ConsumerMessage) -> Result<(), NotifyError> {
        self.marked
            .lock()
            .map_err(|e| NotifyError::Internal(e.to_string()))?
            .push(msg.offset);
        Ok(())
    }
}

/// 每次 join 取出下一段脚本的会话工厂
///
/// 脚本段用完后返回空会话。
#[derive(Default)]
pub struct ScriptedFactory {
    sessions: Mutex<VecDeque<Vec<Result<ConsumerMessage, NotifyError>>>>,
    joins: AtomicUsize,
    marked: Arc<Mutex<Vec<i64>>>,
}

impl ScriptedFactory {
    pub fn new(sessions: Vec<Vec<Result<ConsumerMessage, NotifyError>>>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into()),
            ..Default::default()
        }
    }

    /// 已加入会话的次数
    pub fn joins(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }

    /// 所有会话中已确认的 offset，按确认顺序排列
    pub fn marked(&self) -> Vec<i64> {
        self.marked.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    type Session = ScriptedSession;

    async fn join(&self, _topic: Topic) -> Result<ScriptedSession, NotifyError> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        let script = self
            .sessions
            .lock()
            .map_err(|e| NotifyError::Internal(e.to_string()))?
            .pop_front()
            .unwrap_or_default();

        Ok(ScriptedSession {
            script: script.into(),
            marked: self.marked.clone(),
        })
    }
}
