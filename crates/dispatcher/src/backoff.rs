//! 重试退避策略
//!
//! 指数退避：第n次尝试失败后的延迟为 base * 2^(n-1)，封顶后再加
//! 一段均匀分布的随机抖动，避免同批失败的作业在同一时刻重新涌入。

use std::time::Duration;

use rand::Rng;

/// 抖动范围上限（毫秒），延迟在 [计算值, 计算值 + 500ms) 内均匀分布
const JITTER_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 基础延迟（毫秒）
    base_delay_ms: u64,
    /// 延迟上限（毫秒），不含抖动
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
        }
    }

    /// 第 attempt 次尝试失败后，到下一次投递的延迟
    ///
    /// attempt 从1开始计数。指数部分用饱和运算防止溢出。
    pub fn delay(&self, attempt: i32) -> Duration {
        let exponent = attempt.max(1) as u32 - 1;
        let multiplier = 2u64.saturating_pow(exponent.min(32));
        let backoff = self
            .base_delay_ms
            .saturating_mul(multiplier)
            .min(self.max_delay_ms);

        let jitter = rand::rng().random_range(0..JITTER_MS);
        Duration::from_millis(backoff + jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1000, 300_000)
    }
}
