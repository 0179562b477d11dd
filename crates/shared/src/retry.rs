//! 退避策略
//!
//! 消费会话断开（再均衡、连接丢失）后不立即重连，而是按策略等待一段时间。
//! 默认固定 5 秒；调大 multiplier 即为带上限的指数退避。

use std::time::Duration;

use crate::config::BackoffConfig;

/// 配置允许的最小等待时间，持续失败时不会空转重连
pub const MIN_DELAY: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// BackoffPolicy
// ---------------------------------------------------------------------------

/// 退避策略配置
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// 首次重试前的等待时间
    pub initial_delay: Duration,
    /// 退避时间上限，防止等待过长
    pub max_delay: Duration,
    /// 每次重试的退避倍数
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        let initial_delay = Duration::from_millis(config.initial_delay_ms).max(MIN_DELAY);
        Self {
            initial_delay,
            // 上限小于初始值时按初始值处理，避免配置错误导致零等待
            max_delay: Duration::from_millis(config.max_delay_ms).max(initial_delay),
            multiplier: config.multiplier.max(1.0),
        }
    }
}

impl BackoffPolicy {
    /// 固定间隔策略
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    /// 计算第 N 次连续失败后的等待时间（attempt 从 0 开始）
    ///
    /// 公式: initial_delay * multiplier^attempt，结果不超过 max_delay。
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
