use alloc::{collections::VecDeque, vec, vec::Vec};

use bytes::{Bytes, BytesMut};

use crate::error::QueueError;

/// 读方向的字节段队列，提供跨段的结构化读取。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - Dispatcher 把套接字读到的字节原样追加到队尾，业务 Handler 则以“定长”“分隔符”等帧语义从队首提取。
///   两侧节奏完全解耦：数据可能分多次到达，帧也可能横跨多个字节段。
/// - 失败必须是“无副作用”的：`Underflow` 之后队列保持原状，Handler 在下一次数据到达时重试即可。
///
/// ## 逻辑 (How)
/// - `segments` 保存未消费的 `Bytes`，`available` 缓存总长度；
/// - 读取通过内部 `take` 从队首摘取字节，若设置了读标记，同时把摘下的视图记入 `mark`，
///   以便 [`reset_to_read_mark`](Self::reset_to_read_mark) 原样放回；
/// - 分隔符查找使用 KMP，跨段匹配时无需拼接；`scan` 保存“低水位扫描标记”，
///   数据分批到达时只扫描新增部分，避免对同一前缀反复扫描。
///
/// ## 契约 (What)
/// - `available()` 始终等于队列中剩余字节总数；
/// - 所有读取失败均不消费任何字节；
/// - 读标记为单槽、不可嵌套；未设置标记时 `reset_to_read_mark` 返回 `InvalidState`；
/// - 设置读标记期间禁止 `unread`，否则标记保存的位置将失去意义。
///
/// ## 注意事项 (Trade-offs)
/// - 读标记通过保留已消费段的引用实现，标记存续期间这些段不会被释放；长时间持有标记会放大内存占用；
/// - 跨段的定长读取需要一次拷贝以产出连续 `Bytes`，需要零拷贝时改用 `read_segments_*` 系列。
#[derive(Debug, Default)]
pub struct ReadQueue {
    segments: VecDeque<Bytes>,
    available: usize,
    mark: Option<Vec<Bytes>>,
    scan: Option<ScanMark>,
}

/// 低水位扫描标记：对 `delimiter` 而言，偏移 `< clear_until` 处不可能开始一次匹配。
#[derive(Debug)]
struct ScanMark {
    delimiter: Vec<u8>,
    clear_until: usize,
}

impl ReadQueue {
    /// 创建空队列。
    pub fn new() -> Self {
        Self::default()
    }

    /// 可读字节总数。
    pub fn available(&self) -> usize {
        self.available
    }

    /// 队列是否为空。
    pub fn is_empty(&self) -> bool {
        self.available == 0
    }

    /// 当前字节段数量。
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// 在队尾追加字节段；空段被忽略。
    pub fn append(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.available += segment.len();
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

    /// 读取恰好 `len` 字节并返回连续视图。
    ///
    /// 数据位于单个字节段内时零拷贝，否则拼接为新缓冲。
    pub fn read_by_length(&mut self, len: usize) -> Result<Bytes, QueueError> {
        let pieces = self.read_segments_by_length(len)?;
        Ok(coalesce(pieces))
    }

    /// 读取恰好 `len` 字节并以字节段列表返回，不做拷贝。
    pub fn read_segments_by_length(&mut self, len: usize) -> Result<Vec<Bytes>, QueueError> {
        if len > self.available {
            return Err(QueueError::Underflow {
                available: self.available,
            });
        }
        Ok(self.take(len))
    }

    /// 读取首个 `delimiter` 之前的全部字节，并消费分隔符本身。
    ///
    /// # 契约 (What)
    /// - 分隔符可以横跨任意字节段边界，按最早出现位置匹配；
    /// - 当前可读字节中不存在分隔符时返回 `Underflow`；
    /// - 分隔符之前的数据超过 `max_len`（或已可断定分隔符不可能在 `max_len` 内出现）时返回
    ///   `MaxSizeExceeded`，此时不消费任何字节，调用方可改用按长度读取原始数据；
    /// - 空分隔符视为非法参数，返回 `InvalidState`。
    pub fn read_by_delimiter(
        &mut self,
        delimiter: &[u8],
        max_len: usize,
    ) -> Result<Bytes, QueueError> {
        let pieces = self.read_segments_by_delimiter(delimiter, max_len)?;
        Ok(coalesce(pieces))
    }

    /// 与 [`read_by_delimiter`](Self::read_by_delimiter) 相同，但以字节段列表返回。
    pub fn read_segments_by_delimiter(
        &mut self,
        delimiter: &[u8],
        max_len: usize,
    ) -> Result<Vec<Bytes>, QueueError> {
        let index = self.locate(delimiter, max_len)?;
        let data = self.take(index);
        // 分隔符本身同样经过 `take`，以便读标记能完整复原。
        let _ = self.take(delimiter.len());
        Ok(data)
    }

    /// 非消费式查找分隔符，返回其起始偏移。
    pub fn index_of(&self, delimiter: &[u8]) -> Option<usize> {
        if delimiter.is_empty() {
            return Some(0);
        }
        self.find(delimiter, 0)
    }

    /// 读取全部可读字节。
    pub fn read_available(&mut self) -> Bytes {
        let len = self.available;
        coalesce(self.take(len))
    }

    /// 以字节段列表形式取出全部可读字节。
    pub fn drain(&mut self) -> Vec<Bytes> {
        let len = self.available;
        self.take(len)
    }

    /// 丢弃全部未读字节与读标记。
    pub fn clear(&mut self) {
        self.segments.clear();
        self.available = 0;
        self.mark = None;
        self.scan = None;
    }

    /// 在当前读位置设置读标记；已有标记时以新位置替换。
    pub fn mark_read_position(&mut self) {
        self.mark = Some(Vec::new());
    }

    /// 是否设置了读标记。
    pub fn has_read_mark(&self) -> bool {
        self.mark.is_some()
    }

    /// 将读位置恢复到读标记处。
    ///
    /// 标记之后追加的字节保持在原位；标记本身继续有效，可再次复位。
    pub fn reset_to_read_mark(&mut self) -> Result<(), QueueError> {
        let Some(consumed) = self.mark.as_mut() else {
            return Err(QueueError::InvalidState("no read mark set"));
        };
        let consumed = core::mem::take(consumed);
        for segment in consumed.into_iter().rev() {
            self.available += segment.len();
            self.segments.push_front(segment);
        }
        self.scan = None;
        Ok(())
    }

    /// 移除读标记，释放标记期间保留的已消费字节段。
    pub fn remove_read_mark(&mut self) {
        self.mark = None;
    }

    /// 将字节放回队首，逻辑上撤销一次读取。
    pub fn unread(&mut self, data: Bytes) -> Result<(), QueueError> {
        if self.mark.is_some() {
            return Err(QueueError::InvalidState(
                "unread is not permitted while a read mark is set",
            ));
        }
        if data.is_empty() {
            return Ok(());
        }
        self.available += data.len();
        self.segments.push_front(data);
        self.scan = None;
        Ok(())
    }

    /// 定位分隔符并校验上限，失败时更新低水位扫描标记。
    fn locate(&mut self, delimiter: &[u8], max_len: usize) -> Result<usize, QueueError> {
        if delimiter.is_empty() {
            return Err(QueueError::InvalidState("delimiter must not be empty"));
        }

        let start = match &self.scan {
            Some(scan) if scan.delimiter == delimiter => scan.clear_until,
            _ => 0,
        };

        match self.find(delimiter, start) {
            Some(index) if index > max_len => Err(QueueError::MaxSizeExceeded { limit: max_len }),
            Some(index) => Ok(index),
            None => {
                let clear_until = self.available.saturating_sub(delimiter.len() - 1);
                self.scan = Some(ScanMark {
                    delimiter: delimiter.to_vec(),
                    clear_until,
                });
                if clear_until > max_len {
                    Err(QueueError::MaxSizeExceeded { limit: max_len })
                } else {
                    Err(QueueError::Underflow {
                        available: self.available,
                    })
                }
            }
        }
    }

    /// 从偏移 `start` 起以 KMP 查找 `delimiter`，支持跨段匹配。
    fn find(&self, delimiter: &[u8], start: usize) -> Option<usize> {
        if start >= self.available {
            return None;
        }
        let table = failure_table(delimiter);
        let mut matched = 0usize;
        let mut offset = 0usize;

        for segment in &self.segments {
            let seg_len = segment.len();
            if offset + seg_len <= start {
                offset += seg_len;
                continue;
            }
            let from = start.saturating_sub(offset);
            for (i, &byte) in segment[from..].iter().enumerate() {
                while matched > 0 && byte != delimiter[matched] {
                    matched = table[matched - 1];
                }
                if byte == delimiter[matched] {
                    matched += 1;
                    if matched == delimiter.len() {
                        return Some(offset + from + i + 1 - delimiter.len());
                    }
                }
            }
            offset += seg_len;
        }
        None
    }

    /// 从队首摘取 `len` 字节；调用方保证 `len <= available`。
    fn take(&mut self, len: usize) -> Vec<Bytes> {
        let mut remaining = len;
        let mut pieces = Vec::new();
        while remaining > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                if let Some(segment) = self.segments.pop_front() {
                    pieces.push(segment);
                }
            } else {
                pieces.push(front.split_to(remaining));
                remaining = 0;
            }
        }

        let taken = len - remaining;
        self.available -= taken;
        if let Some(scan) = self.scan.as_mut() {
            scan.clear_until = scan.clear_until.saturating_sub(taken);
        }
        if let Some(mark) = self.mark.as_mut() {
            mark.extend(pieces.iter().cloned());
        }
        pieces
    }
}

fn coalesce(mut pieces: Vec<Bytes>) -> Bytes {
    match pieces.len() {
        0 => Bytes::new(),
        1 => pieces.pop().unwrap_or_default(),
        _ => {
            let total = pieces.iter().map(Bytes::len).sum();
            let mut joined = BytesMut::with_capacity(total);
            for piece in &pieces {
                joined.extend_from_slice(piece);
            }
            joined.freeze()
        }
    }
}

fn failure_table(pattern: &[u8]) -> Vec<usize> {
    let mut table = vec![0usize; pattern.len()];
    let mut k = 0usize;
    for i in 1..pattern.len() {
        while k > 0 && pattern[i] != pattern[k] {
            k = table[k - 1];
        }
        if pattern[i] == pattern[k] {
            k += 1;
        }
        table[i] = k;
    }
    table
}
