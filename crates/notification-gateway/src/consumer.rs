//! 活动事件消费组
//!
//! 每个 topic 启动若干并行 worker，每个 worker 独立加入消费组会话，
//! 按顺序执行 解码 -> 分发 -> 确认。会话失败后按退避策略等待并重新加入，
//! 直到收到关闭信号。
//!
//! 确认发生在分发之后：分发成功与否都会确认，处理中途崩溃的消息会被重新投递，
//! 因此可能重复推送，但不会丢失。

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use notify_shared::config::KafkaConfig;
use notify_shared::error::NotifyError;
use notify_shared::kafka::{ConsumerMessage, KafkaConsumer};
use notify_shared::observability::metrics;
use notify_shared::retry::BackoffPolicy;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatch::{DispatchReport, Dispatcher};
use crate::error::{DecodeError, DispatchError, GatewayError};
use crate::events::{ActivityEvent, Topic};
use crate::lifecycle::ShutdownSignal;

// ---------------------------------------------------------------------------
// 会话抽象
// ---------------------------------------------------------------------------

/// 一次消费组会话
#[async_trait]
pub trait ConsumerSession: Send {
    /// 等待下一条消息，出错表示会话已失效
    async fn next_message(&mut self) -> Result<ConsumerMessage, NotifyError>;

    /// 确认消息已处理
    fn mark(&mut self, msg: &ConsumerMessage) -> Result<(), NotifyError>;
}

/// 创建消费组会话
#[async_trait]
pub trait SessionFactory: Send + Sync {
    type Session: ConsumerSession + 'static;

    async fn join(&self, topic: Topic) -> Result<Self::Session, NotifyError>;
}

#[async_trait]
impl ConsumerSession for KafkaConsumer {
    async fn next_message(&mut self) -> Result<ConsumerMessage, NotifyError> {
        self.recv().await
    }

    fn mark(&mut self, msg: &ConsumerMessage) -> Result<(), NotifyError> {
        KafkaConsumer::mark(self, msg)
    }
}

/// 基于 rdkafka 的会话工厂
///
/// 每次 join 创建独立的 `StreamConsumer`，同一 topic 的 worker 使用同一个消费组，
/// 由 broker 在它们之间分配分区。
pub struct KafkaSessionFactory {
    config: KafkaConfig,
}

impl KafkaSessionFactory {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionFactory for KafkaSessionFactory {
    type Session = KafkaConsumer;

    async fn join(&self, topic: Topic) -> Result<KafkaConsumer, NotifyError> {
        let consumer = KafkaConsumer::new(&self.config, Some(topic.as_str()))?;
        consumer.subscribe(&[topic.as_str()])?;
        debug!(%topic, group_id = consumer.group_id(), "消费者已订阅");
        Ok(consumer)
    }
}

// ---------------------------------------------------------------------------
// 单条消息处理
// ---------------------------------------------------------------------------

/// 处理单条消息：按 worker 所属 topic 解码，然后分发
///
/// 拆分为独立函数，便于在测试中直接调用而无需启动 worker。
pub async fn handle_message(
    dispatcher: &Dispatcher,
    topic: Topic,
    msg: &ConsumerMessage,
) -> Result<DispatchReport, GatewayError> {
    let started = Instant::now();

    let result = match ActivityEvent::decode(topic, &msg.payload) {
        Ok(event) => dispatcher.dispatch(&event).await.map_err(GatewayError::from),
        Err(e) => Err(GatewayError::from(e)),
    };

    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => e.outcome(),
    };
    metrics::record_event(topic.as_str(), outcome, started.elapsed().as_secs_f64());

    result
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// 会话结束原因
enum SessionEnd {
    Cancelled,
    Failed { error: NotifyError, processed: u64 },
}

/// 单个 topic 的消费 worker
pub struct TopicWorker<F: SessionFactory> {
    worker_id: usize,
    topic: Topic,
    factory: Arc<F>,
    dispatcher: Dispatcher,
    backoff: BackoffPolicy,
}

impl<F: SessionFactory> TopicWorker<F> {
    pub fn new(
        worker_id: usize,
        topic: Topic,
        factory: Arc<F>,
        dispatcher: Dispatcher,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            worker_id,
            topic,
            factory,
            dispatcher,
            backoff,
        }
    }

    /// 运行直到收到关闭信号
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        info!(topic = %self.topic, worker_id = self.worker_id, "消费 worker 已启动");

        // 连续失败次数，会话期间处理过消息则清零
        let mut attempt: u32 = 0;

        while !shutdown.is_cancelled() {
            let (error, processed) = match self.run_session(&mut shutdown).await {
                SessionEnd::Cancelled => break,
                SessionEnd::Failed { error, processed } => (error, processed),
            };

            metrics::record_session_restart(self.topic.as_str());
            if processed > 0 {
                attempt = 0;
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);

            warn!(
                topic = %self.topic,
                worker_id = self.worker_id,
                code = error.code(),
                retryable = error.is_retryable(),
                error = %error,
                processed,
                delay_ms = delay.as_millis() as u64,
                "消费会话中断，等待后重新加入"
            );

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(topic = %self.topic, worker_id = self.worker_id, "消费 worker 已退出");
    }

    async fn run_session(&self, shutdown: &mut ShutdownSignal) -> SessionEnd {
        let joined = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return SessionEnd::Cancelled,
            joined = self.factory.join(self.topic) => joined,
        };
        let mut session = match joined {
            Ok(session) => session,
            Err(error) => return SessionEnd::Failed { error, processed: 0 },
        };
        debug!(topic = %self.topic, worker_id = self.worker_id, "已加入消费组会话");

        let mut processed: u64 = 0;
        loop {
            // 只在等待消息时响应取消，已取到的消息总会处理完并确认
            let msg = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return SessionEnd::Cancelled,
                next = session.next_message() => match next {
                    Ok(msg) => msg,
                    Err(error) => return SessionEnd::Failed { error, processed },
                },
            };

            self.process(&msg).await;

            if let Err(e) = session.mark(&msg) {
                warn!(
                    topic = %self.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    error = %e,
                    "确认消息失败"
                );
            }
            processed += 1;
        }
    }

    async fn process(&self, msg: &ConsumerMessage) {
        match handle_message(&self.dispatcher, self.topic, msg).await {
            Ok(report) => debug!(
                topic = %self.topic,
                partition = msg.partition,
                offset = msg.offset,
                timestamp = ?msg.timestamp,
                delivered = report.delivered,
                "事件处理完成"
            ),
            // 引用的帖子或用户已被删除，属于正常的数据竞争
            Err(GatewayError::Dispatch(DispatchError::Resolve(e))) if e.is_not_found() => warn!(
                topic = %self.topic,
                partition = msg.partition,
                offset = msg.offset,
                error = %e,
                "事件引用的记录不存在，跳过"
            ),
            Err(e) => error!(
                topic = %self.topic,
                partition = msg.partition,
                offset = msg.offset,
                outcome = e.outcome(),
                error = %e,
                "处理事件失败，消息将被确认并丢弃"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// ConsumerGroup
// ---------------------------------------------------------------------------

/// 所有 topic 的 worker 集合
pub struct ConsumerGroup<F: SessionFactory> {
    factory: Arc<F>,
    dispatcher: Dispatcher,
    topics: Vec<Topic>,
    workers_per_topic: usize,
    backoff: BackoffPolicy,
}

impl<F: SessionFactory + 'static> ConsumerGroup<F> {
    pub fn new(
        factory: F,
        dispatcher: Dispatcher,
        topics: Vec<Topic>,
        workers_per_topic: usize,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            factory: Arc::new(factory),
            dispatcher,
            topics,
            workers_per_topic: workers_per_topic.max(1),
            backoff,
        }
    }

    /// 按配置中的 topic 名称构造，未知 topic 视为配置错误
    ///
    /// 未配置任何 topic 时消费全部四个 topic。
    pub fn from_config(
        factory: F,
        dispatcher: Dispatcher,
        config: &KafkaConfig,
        backoff: BackoffPolicy,
    ) -> Result<Self, DecodeError> {
        let mut topics = Vec::with_capacity(config.topics.len());
        for name in &config.topics {
            let topic: Topic = name.parse()?;
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }
        if topics.is_empty() {
            topics.extend(Topic::ALL);
        }

        Ok(Self::new(
            factory,
            dispatcher,
            topics,
            config.workers_per_topic,
            backoff,
        ))
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    /// 启动所有 worker，返回任务句柄供关闭时等待
    pub fn spawn(&self, shutdown: &ShutdownSignal) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.topics.len() * self.workers_per_topic);

        for &topic in &self.topics {
            for worker_id in 0..self.workers_per_topic {
                let worker = TopicWorker::new(
                    worker_id,
                    topic,
                    self.factory.clone(),
                    self.dispatcher.clone(),
                    self.backoff.clone(),
                );
                handles.push(tokio::spawn(worker.run(shutdown.clone())));
            }
        }

        info!(
            topics = ?self.topics,
            workers_per_topic = self.workers_per_topic,
            total = handles.len(),
            "消费组已启动"
        );
        handles
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::lifecycle::Lifecycle;
    use crate::registry::ConnectionRegistry;
    use crate::resolver::MockRecipientResolver;
    use crate::test_utils::{FakeResolver, RecordingSink, ScriptedFactory, message};
    use tokio_test::assert_ok;

    fn worker(
        topic: Topic,
        factory: Arc<ScriptedFactory>,
        dispatcher: Dispatcher,
    ) -> TopicWorker<ScriptedFactory> {
        TopicWorker::new(0, topic, factory, dispatcher, BackoffPolicy::default())
    }

    fn kafka_error() -> NotifyError {
        NotifyError::Kafka("broker transport failure".to_string())
    }

    #[tokio::test]
    async fn test_handle_message_rejects_malformed_payload() {
        let mut resolver = MockRecipientResolver::new();
        resolver.expect_resolve_like_owner().never();
        let dispatcher = Dispatcher::new(Arc::new(ConnectionRegistry::new()), Arc::new(resolver));

        let result = handle_message(&dispatcher, Topic::Like, &message(Topic::Like, 0, "{")).await;

        assert!(matches!(result, Err(GatewayError::Decode(_))));
    }

    #[tokio::test]
    async fn test_handle_message_decodes_by_worker_topic() {
        let resolver = FakeResolver::new().with_user(5, "bob");
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, sink) = RecordingSink::handle();
        registry.register("3", handle).await;
        let dispatcher = Dispatcher::new(registry, Arc::new(resolver));

        let payload = r#"{"follower_id":5,"following_id":3}"#;
        let report = assert_ok!(
            handle_message(&dispatcher, Topic::Follow, &message(Topic::Follow, 0, payload)).await
        );

        assert_eq!(report.delivered, 1);
        assert_eq!(sink.messages(), vec!["bob followed you"]);
    }

    #[tokio::test]
    async fn test_malformed_message_is_marked_without_dispatch() {
        let mut resolver = MockRecipientResolver::new();
        resolver.expect_resolve_like_owner().never();
        resolver.expect_resolve_display_name().never();
        let dispatcher = Dispatcher::new(Arc::new(ConnectionRegistry::new()), Arc::new(resolver));

        let factory = Arc::new(ScriptedFactory::new(vec![vec![
            Ok(message(Topic::Like, 10, "not json")),
            Ok(message(Topic::Like, 11, r#"{"post_id":1}"#)),
        ]]));

        let lifecycle = Lifecycle::new(Duration::from_secs(1));
        let task = tokio::spawn(worker(Topic::Like, factory.clone(), dispatcher).run(lifecycle.signal()));

        for _ in 0..100 {
            if factory.marked().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(factory.marked(), vec![10, 11]);

        assert!(lifecycle.shutdown(vec![task]).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_error_backs_off_then_rejoins() {
        let resolver = FakeResolver::new();
        let dispatcher = Dispatcher::new(Arc::new(ConnectionRegistry::new()), Arc::new(resolver));

        let factory = Arc::new(ScriptedFactory::new(vec![
            vec![Err(kafka_error())],
            vec![Ok(message(Topic::Post, 7, r#"{"user_id":5,"post_id":1}"#))],
        ]));

        let lifecycle = Lifecycle::new(Duration::from_secs(1));
        let task = tokio::spawn(worker(Topic::Post, factory.clone(), dispatcher).run(lifecycle.signal()));

        // 第一次会话失败后进入 5 秒退避，期间不会重新加入
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(factory.joins(), 1);
        assert!(factory.marked().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(factory.joins(), 2);
        assert_eq!(factory.marked(), vec![7]);

        assert!(lifecycle.shutdown(vec![task]).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_exits_promptly() {
        let dispatcher = Dispatcher::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(FakeResolver::new()),
        );
        let factory = Arc::new(ScriptedFactory::new(vec![vec![Err(kafka_error())]]));

        let lifecycle = Lifecycle::new(Duration::from_secs(1));
        let task = tokio::spawn(worker(Topic::Like, factory.clone(), dispatcher).run(lifecycle.signal()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(factory.joins(), 1);

        let started = tokio::time::Instant::now();
        assert!(lifecycle.shutdown(vec![task]).await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(factory.joins(), 1);
    }

    #[tokio::test]
    async fn test_from_config_rejects_unknown_topic() {
        let dispatcher = Dispatcher::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(FakeResolver::new()),
        );
        let config = KafkaConfig {
            topics: vec!["like".to_string(), "comment".to_string()],
            ..KafkaConfig::default()
        };

        let result = ConsumerGroup::from_config(
            ScriptedFactory::default(),
            dispatcher,
            &config,
            BackoffPolicy::default(),
        );

        assert!(matches!(result, Err(DecodeError::UnknownTopic(t)) if t == "comment"));
    }

    #[test]
    fn test_from_config_without_topics_consumes_all() {
        let dispatcher = Dispatcher::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(FakeResolver::new()),
        );
        let config = KafkaConfig {
            topics: vec![],
            ..KafkaConfig::default()
        };

        let group = ConsumerGroup::from_config(
            ScriptedFactory::default(),
            dispatcher,
            &config,
            BackoffPolicy::default(),
        )
        .unwrap();

        assert_eq!(group.topics(), Topic::ALL.as_slice());
    }

    #[tokio::test]
    async fn test_spawn_starts_workers_per_topic() {
        let dispatcher = Dispatcher::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(FakeResolver::new()),
        );
        let config = KafkaConfig {
            topics: vec!["like".to_string(), "post".to_string(), "like".to_string()],
            workers_per_topic: 2,
            ..KafkaConfig::default()
        };
        let group = ConsumerGroup::from_config(
            ScriptedFactory::default(),
            dispatcher,
            &config,
            BackoffPolicy::default(),
        )
        .unwrap();
        assert_eq!(group.topics(), &[Topic::Like, Topic::Post]);

        let lifecycle = Lifecycle::new(Duration::from_secs(1));
        let handles = group.spawn(&lifecycle.signal());
        assert_eq!(handles.len(), 4);

        assert!(lifecycle.shutdown(handles).await);
    }
}
