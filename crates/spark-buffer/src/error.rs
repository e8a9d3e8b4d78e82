use thiserror::Error;

/// 队列级错误的稳定错误码。
///
/// 与 `spark-transport-tcp` 的错误码表保持同一命名空间，便于日志检索时按前缀聚合。
pub mod codes {
    /// 结构化读取暂时无法满足。
    pub const UNDERFLOW: &str = "spark.buffer.underflow";
    /// 带上限的结构化读取在找到终止条件前触达上限。
    pub const MAX_SIZE_EXCEEDED: &str = "spark.buffer.max_size_exceeded";
    /// 在当前标记状态下不允许的操作。
    pub const INVALID_STATE: &str = "spark.buffer.invalid_state";
}

/// `ReadQueue`/`IoQueue`/`WriteMark` 的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：结构化读取失败并不等于连接异常。`Underflow` 表示“数据还没到齐”，调用方应在下一次
///   数据到达回调时重试；`MaxSizeExceeded` 表示对端发送的帧超出预算，由调用方决定改用按长度读取或直接关闭。
/// - **契约 (What)**：
///   - 所有失败路径都保证队列内容不变，调用方可以安全重试；
///   - `Underflow::available` 为失败时刻队列中可读字节数，便于日志排障；
///   - `InvalidState` 携带静态描述，指出违反的是哪条标记约束。
/// - **设计权衡 (Trade-offs)**：错误类型保持 `Copy`，在热路径（每次回调可能多次探测 `Underflow`）上不产生分配。
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// 可读字节不足以满足请求。
    #[error("buffer underflow: {available} byte(s) available")]
    Underflow { available: usize },

    /// 在 `limit` 字节内未找到分隔符。
    #[error("delimiter not found within {limit} byte(s)")]
    MaxSizeExceeded { limit: usize },

    /// 当前标记状态禁止该操作。
    #[error("invalid queue state: {0}")]
    InvalidState(&'static str),
}

impl QueueError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::Underflow { .. } => codes::UNDERFLOW,
            QueueError::MaxSizeExceeded { .. } => codes::MAX_SIZE_EXCEEDED,
            QueueError::InvalidState(_) => codes::INVALID_STATE,
        }
    }

    /// 是否为“等待更多数据”类失败。
    pub fn is_underflow(&self) -> bool {
        matches!(self, QueueError::Underflow { .. })
    }
}
