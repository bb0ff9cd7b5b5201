use std::time::Duration;

/// 轮询间隔策略
///
/// `attempt` 从 0 开始计数，`remaining` 是距离截止时间的剩余时间。
/// 返回值超过 `remaining` 时，轮询直接超时而不再睡眠。
pub trait Backoff: Send + Sync {
    fn delay(&self, attempt: u32, remaining: Duration) -> Duration;
}

impl<F> Backoff for F
where
    F: Fn(u32, Duration) -> Duration + Send + Sync,
{
    fn delay(&self, attempt: u32, remaining: Duration) -> Duration {
        self(attempt, remaining)
    }
}

/// 固定间隔
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff(pub Duration);

impl Backoff for FixedBackoff {
    fn delay(&self, _attempt: u32, _remaining: Duration) -> Duration {
        self.0
    }
}

/// 指数增长间隔，封顶 `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub factor: u32,
    pub max: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            factor: 2,
            max,
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempt: u32, _remaining: Duration) -> Duration {
        let multiplier = self.factor.max(1).saturating_pow(attempt);
        self.initial.saturating_mul(multiplier).min(self.max)
    }
}
