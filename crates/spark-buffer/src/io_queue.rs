use alloc::{collections::VecDeque, vec::Vec};

use bytes::Bytes;

/// 写方向的字节段队列，支持“租借/提交”两阶段消费。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 套接字在非阻塞模式下每次只能接受部分字节。Dispatcher 先通过 [`lease`](Self::lease)
///   预留队首最多 N 字节，写入套接字后再按实际写出量提交，避免“先出队、写失败再塞回去”的往返。
/// - 限速写出同样依赖该能力：每个调度节拍仅租借令牌允许的字节数。
///
/// ## 逻辑 (How)
/// - 以 `VecDeque<Bytes>` 保存字节段，`len` 缓存总字节数；
/// - 租借时沿队首遍历，必要时对边界段执行 `Bytes::slice`（零拷贝）；
/// - `leased` 记录最近一次租借的字节数，提交时从队首精确移除这些字节。
///
/// ## 契约 (What)
/// - 字节严格按 FIFO 顺序、以字节粒度出队；
/// - `lease(n)` 返回的字节数不超过 `n`；队列为空或 `n == 0` 时返回 `None`；
/// - `remove_leased` 与 `lease` 组合等价于同长度的破坏性读取；
/// - 租借与提交之间的 `append` 只会追加到租借区之后，不影响租借内容；
/// - `drain` 清空队列并作废尚未提交的租借。
///
/// ## 注意事项 (Trade-offs)
/// - 再次调用 `lease` 会覆盖前一次租借，调用方必须在同一临界区内完成“租借→写出→提交”；
/// - 队列本身不加锁，跨线程共享时由连接层的互斥量保护。
#[derive(Debug, Default)]
pub struct IoQueue {
    segments: VecDeque<Bytes>,
    len: usize,
    leased: Option<usize>,
}

impl IoQueue {
    /// 创建空队列。
    pub fn new() -> Self {
        Self::default()
    }

    /// 队列中待发送的总字节数（含已租借未提交部分）。
    pub fn len(&self) -> usize {
        self.len
    }

    /// 是否没有待发送字节。
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 当前队列中的字节段数量。
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// 在队尾追加一个字节段；空段被忽略。
    pub fn append(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.len += segment.len();
        self.segments.push_back(segment);
    }

    /// 依序追加多个字节段。
    pub fn append_all<I>(&mut self, segments: I)
    where
        I: IntoIterator<Item = Bytes>,
    {
        for segment in segments {
            self.append(segment);
        }
    }

    /// 租借队首最多 `max_len` 字节，不移除。
    ///
    /// 跨越多个字节段时返回多个视图；边界段被零拷贝切分。
    pub fn lease(&mut self, max_len: usize) -> Option<Vec<Bytes>> {
        if self.len == 0 || max_len == 0 {
            self.leased = None;
            return None;
        }

        let mut remaining = max_len;
        let mut leased = Vec::new();
        for segment in &self.segments {
            if remaining == 0 {
                break;
            }
            if segment.len() <= remaining {
                remaining -= segment.len();
                leased.push(segment.clone());
            } else {
                leased.push(segment.slice(..remaining));
                remaining = 0;
            }
        }

        self.leased = Some(max_len - remaining);
        Some(leased)
    }

    /// 最近一次租借的字节数。
    pub fn leased_len(&self) -> usize {
        self.leased.unwrap_or(0)
    }

    /// 提交最近一次租借的全部字节，返回移除的字节数。
    pub fn remove_leased(&mut self) -> usize {
        let leased = self.leased_len();
        self.commit_lease(leased)
    }

    /// 只提交租借区的前 `written` 字节，剩余部分留在队首等待下次写出。
    ///
    /// `written` 超过租借长度时按租借长度截断；调用后租借失效。
    pub fn commit_lease(&mut self, written: usize) -> usize {
        let Some(leased) = self.leased.take() else {
            return 0;
        };
        let mut remaining = written.min(leased);
        let removed = remaining;
        while remaining > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                self.segments.pop_front();
            } else {
                // 部分写出：推进队首段的读游标。
                let _ = front.split_to(remaining);
                remaining = 0;
            }
        }
        self.len -= removed - remaining;
        removed - remaining
    }

    /// 取出全部待发送字节。
    pub fn drain(&mut self) -> Option<Vec<Bytes>> {
        self.leased = None;
        if self.segments.is_empty() {
            return None;
        }
        self.len = 0;
        Some(self.segments.drain(..).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concat(segments: &[Bytes]) -> Vec<u8> {
        segments.iter().flat_map(|s| s.iter().copied()).collect()
    }

    #[test]
    fn lease_splits_boundary_segment_without_copy() {
        let mut queue = IoQueue::new();
        queue.append(Bytes::from_static(b"hello"));
        queue.append(Bytes::from_static(b"world"));

        let lease = queue.lease(7).expect("非空队列应可租借");
        assert_eq!(concat(&lease), b"hellowo");
        assert_eq!(queue.len(), 10, "租借不应移除字节");

        assert_eq!(queue.remove_leased(), 7);
        assert_eq!(queue.len(), 3);
        assert_eq!(concat(&queue.drain().expect("剩余字节")), b"rld");
    }

    #[test]
    fn append_between_lease_and_commit_lands_after_leased_region() {
        let mut queue = IoQueue::new();
        queue.append(Bytes::from_static(b"abc"));
        let lease = queue.lease(10).expect("租借");
        queue.append(Bytes::from_static(b"def"));
        assert_eq!(concat(&lease), b"abc");
        assert_eq!(queue.remove_leased(), 3);
        assert_eq!(concat(&queue.drain().expect("追加的字节仍在")), b"def");
    }

    #[test]
    fn partial_commit_keeps_unwritten_tail() {
        let mut queue = IoQueue::new();
        queue.append(Bytes::from_static(b"0123456789"));
        queue.lease(8).expect("租借");
        assert_eq!(queue.commit_lease(3), 3);
        assert_eq!(queue.len(), 7);
        assert_eq!(queue.leased_len(), 0, "提交后租借失效");
        assert_eq!(concat(&queue.lease(100).expect("租借")), b"3456789");
    }

    #[test]
    fn empty_queue_and_zero_length_lease_return_none() {
        let mut queue = IoQueue::new();
        assert!(queue.lease(16).is_none());
        assert!(queue.drain().is_none());
        queue.append(Bytes::from_static(b"x"));
        assert!(queue.lease(0).is_none());
        assert_eq!(queue.remove_leased(), 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn drain_discards_outstanding_lease() {
        let mut queue = IoQueue::new();
        queue.append(Bytes::from_static(b"abc"));
        queue.lease(2).expect("租借");
        queue.drain().expect("drain");
        assert_eq!(queue.remove_leased(), 0);
        assert!(queue.is_empty());
    }
}
