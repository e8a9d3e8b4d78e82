use bytes::{Bytes, BytesMut};

/// 写标记缓冲：标记存续期间暂存出站字节，支持回到标记处覆写。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 长度前缀帧的典型写法是“先写占位长度 → 写负载 → 回到占位处补写真实长度”。
///   在字节已进入 `IoQueue` 之后再修改是不可能的，因此标记之后的写入先落在本缓冲中。
///
/// ## 逻辑 (How)
/// - `buffer` 保存标记之后写入的全部字节，`cursor` 为下一次写入的位置；
/// - [`reset`](Self::reset) 将 `cursor` 归零，之后的写入逐字节覆盖旧内容，越过末尾的部分追加；
/// - [`finish`](Self::finish) 冻结缓冲并交还给调用方，由连接层提交进 `IoQueue`。
///
/// ## 契约 (What)
/// - 覆写永远不会缩短缓冲：写入长度小于原内容时，未覆盖的尾部保持原值；
/// - `finish` 返回的字节顺序等同于“把最终内容一次性写入”。
#[derive(Debug, Default)]
pub struct WriteMark {
    buffer: BytesMut,
    cursor: usize,
}

impl WriteMark {
    /// 创建空的写标记缓冲。
    pub fn new() -> Self {
        Self::default()
    }

    /// 标记之后暂存的字节数。
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// 是否没有暂存字节。
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// 下一次写入的偏移。
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// 在游标处写入，必要时覆写既有字节。
    pub fn write(&mut self, data: &[u8]) {
        let overlap = self.buffer.len().saturating_sub(self.cursor).min(data.len());
        if overlap > 0 {
            self.buffer[self.cursor..self.cursor + overlap].copy_from_slice(&data[..overlap]);
        }
        if overlap < data.len() {
            self.buffer.extend_from_slice(&data[overlap..]);
        }
        self.cursor += data.len();
    }

    /// 游标回到标记处。
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// 冻结暂存内容，结束标记。
    pub fn finish(self) -> Bytes {
        self.buffer.freeze()
    }
}
