//! `ReadQueue` 契约测试：以外部 crate 视角验证结构化读取。
//!
//! # 测试目标（Why）
//! - 失败的读取不得消费字节，否则 Handler 在 `Underflow` 后重试会丢帧；
//! - 分隔符可能被任意切分到多个字节段，查找结果必须与“拼成一整块再查找”一致；
//! - `unread` 与读标记复位必须严格恢复先前可读内容。
//!
//! # 结构安排（How）
//! - 固定用例覆盖跨段分隔符与标记复位；
//! - proptest 随机切分负载，与 `windows().position()` 的朴素实现对比。

use bytes::Bytes;
use proptest::prelude::*;
use spark_buffer::{QueueError, ReadQueue};

/// 将负载按 `cuts` 给出的位置切成多个字节段后追加进队列。
fn split_into_queue(payload: &[u8], cuts: &[usize]) -> ReadQueue {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (payload.len() + 1)).collect();
    points.sort_unstable();
    points.dedup();
    let mut queue = ReadQueue::new();
    let mut start = 0;
    for point in points.into_iter().chain(std::iter::once(payload.len())) {
        queue.append(Bytes::copy_from_slice(&payload[start..point]));
        start = point;
    }
    queue
}

#[test]
fn straddling_delimiter_is_consumed_with_its_prefix() {
    let mut queue = ReadQueue::new();
    queue.append(Bytes::from_static(b"AB"));
    queue.append(Bytes::from_static(b"CD"));
    let prefix = queue.read_by_delimiter(b"BC", 16).expect("分隔符横跨两个字节段");
    assert_eq!(&prefix[..], b"A");
    assert_eq!(queue.available(), 1, "分隔符本身也应被消费");
}

#[test]
fn underflow_keeps_available_unchanged() {
    let mut queue = ReadQueue::new();
    queue.append(Bytes::from_static(b"12345"));
    let before = queue.available();
    assert!(matches!(
        queue.read_by_length(before + 1),
        Err(QueueError::Underflow { .. })
    ));
    assert_eq!(queue.available(), before);
}

#[test]
fn mark_reset_reproduces_same_bytes() {
    let mut queue = ReadQueue::new();
    queue.append(Bytes::from_static(b"line-1\nline-2\n"));
    queue.mark_read_position();
    let first = queue.read_by_delimiter(b"\n", 64).expect("第一行");
    let second = queue.read_by_delimiter(b"\n", 64).expect("第二行");
    queue.reset_to_read_mark().expect("存在读标记");
    assert_eq!(queue.read_by_delimiter(b"\n", 64).expect("重读第一行"), first);
    assert_eq!(queue.read_by_delimiter(b"\n", 64).expect("重读第二行"), second);
}

proptest! {
    #[test]
    fn prop_delimiter_search_matches_contiguous_search(
        payload in prop::collection::vec(0u8..4, 0..128),
        cuts in prop::collection::vec(any::<usize>(), 0..8),
        delimiter in prop::collection::vec(0u8..4, 1..4),
    ) {
        let expected = payload.windows(delimiter.len()).position(|w| w == &delimiter[..]);
        let mut queue = split_into_queue(&payload, &cuts);
        prop_assert_eq!(queue.index_of(&delimiter), expected);

        match expected {
            Some(index) => {
                let prefix = queue.read_by_delimiter(&delimiter, usize::MAX).expect("存在分隔符");
                prop_assert_eq!(&prefix[..], &payload[..index]);
                prop_assert_eq!(queue.available(), payload.len() - index - delimiter.len());
            }
            None => {
                prop_assert!(queue.read_by_delimiter(&delimiter, usize::MAX).is_err());
                prop_assert_eq!(queue.available(), payload.len());
            }
        }
    }

    #[test]
    fn prop_unread_restores_readable_bytes(
        payload in prop::collection::vec(any::<u8>(), 1..128),
        cuts in prop::collection::vec(any::<usize>(), 0..8),
        take in any::<usize>(),
    ) {
        let mut queue = split_into_queue(&payload, &cuts);
        let take = take % (payload.len() + 1);
        let read = queue.read_by_length(take).expect("长度不超过可读字节");
        queue.unread(read).expect("未设置读标记");
        prop_assert_eq!(queue.available(), payload.len());
        prop_assert_eq!(&queue.read_available()[..], &payload[..]);
    }
}
