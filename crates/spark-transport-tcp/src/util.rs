use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// 由可选时长推导截止时间点；`None` 表示无限等待。
pub(crate) fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|timeout| Instant::now() + timeout)
}

/// 连接级“状态已变化”通知器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 阻塞门面的读取、同步 flush、阻塞关闭与 `wait_connected` 都需要在非 Dispatcher 线程上等待
///   “某件事发生”：数据到达、写队列排空、状态迁移。
/// - 使用单调递增的序号而不是布尔标志，等待方先记录序号、再检查谓词、最后等待序号变化，
///   检查与等待之间发生的通知不会丢失。
///
/// ## 契约 (What)
/// - [`notify`](Self::notify) 可在任意线程调用，调用时不得持有连接的其他锁；
/// - [`wait_past`](Self::wait_past) 返回 `false` 表示截止时间已到且序号未变化。
#[derive(Debug, Default)]
pub(crate) struct Notifier {
    sequence: Mutex<u64>,
    changed: Condvar,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 当前序号。
    pub(crate) fn current(&self) -> u64 {
        *self.sequence.lock()
    }

    /// 推进序号并唤醒所有等待方。
    pub(crate) fn notify(&self) {
        let mut sequence = self.sequence.lock();
        *sequence = sequence.wrapping_add(1);
        self.changed.notify_all();
    }

    /// 等待序号离开 `seen`，或直到 `deadline`。
    pub(crate) fn wait_past(&self, seen: u64, deadline: Option<Instant>) -> bool {
        let mut sequence = self.sequence.lock();
        while *sequence == seen {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut sequence, deadline).timed_out() {
                        return *sequence != seen;
                    }
                }
                None => self.changed.wait(&mut sequence),
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn notification_between_snapshot_and_wait_is_not_lost() {
        let notifier = Notifier::new();
        let seen = notifier.current();
        notifier.notify();
        assert!(notifier.wait_past(seen, deadline_after(Some(Duration::from_millis(10)))));
    }

    #[test]
    fn wait_times_out_without_notification() {
        let notifier = Notifier::new();
        let seen = notifier.current();
        let started = Instant::now();
        assert!(!notifier.wait_past(seen, deadline_after(Some(Duration::from_millis(20)))));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn cross_thread_notify_wakes_waiter() {
        let notifier = Arc::new(Notifier::new());
        let seen = notifier.current();
        let remote = Arc::clone(&notifier);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.notify();
        });
        assert!(notifier.wait_past(seen, None));
        handle.join().expect("通知线程正常退出");
    }

    #[test]
    fn deadline_is_unbounded_without_timeout() {
        assert_eq!(deadline_after(None), None);
        let deadline = deadline_after(Some(Duration::from_secs(1))).expect("有限时长得到截止时间");
        assert!(deadline > Instant::now());
    }
}
