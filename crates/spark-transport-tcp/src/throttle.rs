use std::time::{Duration, Instant};

/// 连接写路径的限速状态。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 为单条连接提供简单的“按节拍放行”写出限速，避免大批量推送挤占共享链路；
/// - 不做拥塞控制：只限制本端主动写出的节奏，内核发送缓冲的背压仍由 `WouldBlock` 表达。
///
/// ## 逻辑 (How)
/// - `rate` 为字节/秒，每个节拍 (`tick`) 的额度为 `rate × tick`，至少 1 字节；
/// - 额度不跨节拍累积：空闲若干节拍后不会一次性爆发；
/// - Dispatcher 每次写出前调用 [`budget`](Self::budget) 取得当前额度，写出后以 [`consume`](Self::consume) 扣减；
///   额度耗尽且仍有待发字节时，Dispatcher 在下一个节拍再次尝试。
///
/// ## 契约 (What)
/// - 未设置速率时 `budget` 返回 `usize::MAX`，`consume` 为空操作；
/// - `set_rate` 立即生效并重置当前节拍。
///
/// ## 注意事项 (Trade-offs)
/// - 节拍粒度决定了限速精度；节拍越短越平滑，但 Dispatcher 唤醒越频繁；
/// - 由于使用 `Instant` 做时间窗口，系统暂停（如休眠）后首个节拍会立即放行。
#[derive(Debug)]
pub(crate) struct WriteThrottle {
    rate: Option<u64>,
    tick: Duration,
    allowance: u64,
    window_start: Option<Instant>,
}

impl WriteThrottle {
    /// 创建限速器；`rate` 为 `None` 表示不限速。
    pub(crate) fn new(rate: Option<u64>, tick: Duration) -> Self {
        Self {
            rate,
            tick,
            allowance: 0,
            window_start: None,
        }
    }

    /// 当前速率（字节/秒）。
    pub(crate) fn rate(&self) -> Option<u64> {
        self.rate
    }

    /// 是否启用了限速。
    pub(crate) fn is_limited(&self) -> bool {
        self.rate.is_some()
    }

    /// 调整速率。
    pub(crate) fn set_rate(&mut self, rate: Option<u64>) {
        self.rate = rate;
        self.allowance = 0;
        self.window_start = None;
    }

    /// 返回当前节拍剩余可写字节数。
    pub(crate) fn budget(&mut self, now: Instant) -> usize {
        let Some(rate) = self.rate else {
            return usize::MAX;
        };
        let fresh = match self.window_start {
            Some(start) => now.duration_since(start) >= self.tick,
            None => true,
        };
        if fresh {
            self.window_start = Some(now);
            self.allowance = self.per_tick(rate);
        }
        usize::try_from(self.allowance).unwrap_or(usize::MAX)
    }

    /// 扣减已写出的字节。
    pub(crate) fn consume(&mut self, written: usize) {
        if self.rate.is_some() {
            self.allowance = self.allowance.saturating_sub(written as u64);
        }
    }

    fn per_tick(&self, rate: u64) -> u64 {
        let per_tick = u128::from(rate) * self.tick.as_micros() / 1_000_000;
        u64::try_from(per_tick).unwrap_or(u64::MAX).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_throttle_never_restricts() {
        let mut throttle = WriteThrottle::new(None, Duration::from_millis(100));
        assert_eq!(throttle.budget(Instant::now()), usize::MAX);
        throttle.consume(1 << 20);
        assert_eq!(throttle.budget(Instant::now()), usize::MAX);
        assert!(!throttle.is_limited());
    }

    #[test]
    fn allowance_is_rate_times_tick_and_does_not_accumulate() {
        let tick = Duration::from_millis(100);
        let mut throttle = WriteThrottle::new(Some(1_000), tick);
        let start = Instant::now();
        assert_eq!(throttle.budget(start), 100);
        throttle.consume(60);
        assert_eq!(throttle.budget(start + Duration::from_millis(50)), 40);
        throttle.consume(40);
        assert_eq!(throttle.budget(start + Duration::from_millis(99)), 0);
        // 空闲多个节拍后额度仍只有一个节拍的量。
        assert_eq!(throttle.budget(start + Duration::from_secs(5)), 100);
    }

    #[test]
    fn tiny_rates_release_at_least_one_byte_per_tick() {
        let mut throttle = WriteThrottle::new(Some(1), Duration::from_millis(10));
        assert_eq!(throttle.budget(Instant::now()), 1);
    }
}
