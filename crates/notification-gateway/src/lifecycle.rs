//! 进程生命周期
//!
//! 持有唯一的取消源，向 worker 与 WebSocket 连接广播关闭信号，
//! 并在关闭时给它们一个有限的宽限期完成手头的工作。

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// 关闭信号的接收端
///
/// 可任意克隆，每个 worker 持有一份。发送端被丢弃同样视为已取消。
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// 等待取消，已取消时立即返回
    pub async fn cancelled(&mut self) {
        // wait_for 只在发送端被丢弃时返回 Err，此时同样视为取消
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// 生命周期控制器
pub struct Lifecycle {
    tx: watch::Sender<bool>,
    grace_period: Duration,
}

impl Lifecycle {
    pub fn new(grace_period: Duration) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx, grace_period }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// 触发取消，重复调用无副作用
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// 触发取消并等待任务退出，最多等待宽限期
    ///
    /// 返回宽限期内是否所有任务都已退出。超时后不再等待，剩余任务随进程退出。
    pub async fn shutdown(&self, tasks: Vec<JoinHandle<()>>) -> bool {
        info!(
            tasks = tasks.len(),
            grace_period_ms = self.grace_period.as_millis() as u64,
            "开始关闭，等待任务退出"
        );
        self.cancel();

        match tokio::time::timeout(self.grace_period, futures::future::join_all(tasks)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "任务异常退出");
                    }
                }
                info!("所有任务已退出");
                true
            }
            Err(_) => {
                warn!("宽限期内仍有任务未退出，放弃等待");
                false
            }
        }
    }
}

/// 监听进程终止信号
///
/// K8s 通过 SIGTERM 通知 Pod 停止；本地开发通过 Ctrl+C。
/// 注册信号处理器失败时只记录日志，对应的分支永不触发。
pub async fn wait_for_termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到 Ctrl+C，开始优雅关闭"),
        _ = terminate => info!("收到 SIGTERM，开始优雅关闭"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_wakes_all_signals() {
        let lifecycle = Lifecycle::new(Duration::from_secs(1));
        let mut a = lifecycle.signal();
        let mut b = a.clone();
        assert!(!a.is_cancelled());

        lifecycle.cancel();

        a.cancelled().await;
        b.cancelled().await;
        assert!(b.is_cancelled());
        assert!(lifecycle.is_cancelled());
    }

    #[tokio::test]
    async fn test_signal_taken_after_cancel_is_already_cancelled() {
        let lifecycle = Lifecycle::new(Duration::from_secs(1));
        lifecycle.cancel();
        lifecycle.cancel();

        let mut late = lifecycle.signal();
        assert!(late.is_cancelled());
        late.cancelled().await;
    }

    #[tokio::test]
    async fn test_dropped_controller_counts_as_cancelled() {
        let lifecycle = Lifecycle::new(Duration::from_secs(1));
        let mut signal = lifecycle.signal();
        drop(lifecycle);

        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("控制器被丢弃后应立即返回");
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_cooperative_tasks() {
        let lifecycle = Lifecycle::new(Duration::from_secs(1));
        let tasks = (0..3)
            .map(|_| {
                let mut signal = lifecycle.signal();
                tokio::spawn(async move { signal.cancelled().await })
            })
            .collect();

        assert!(lifecycle.shutdown(tasks).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_gives_up_after_grace_period() {
        let lifecycle = Lifecycle::new(Duration::from_secs(1));
        let stuck = tokio::spawn(std::future::pending::<()>());

        let started = tokio::time::Instant::now();
        assert!(!lifecycle.shutdown(vec![stuck]).await);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
