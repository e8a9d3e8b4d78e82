use std::{error::Error as StdError, fmt, io, sync::Arc};

use spark_buffer::QueueError;
use thiserror::Error;

use crate::charset::Charset;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

impl fmt::Debug for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code)
    }
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "spark.transport.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.transport.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.transport.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.transport.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE_VECTORED: OperationKind = OperationKind {
    code: "spark.transport.tcp.writev_failed",
    message: "tcp write_vectored",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.transport.tcp.configure_failed",
    message: "tcp configure",
};
pub(crate) const REGISTER: OperationKind = OperationKind {
    code: "spark.transport.tcp.register_failed",
    message: "tcp register",
};
pub(crate) const TRANSFORM: OperationKind = OperationKind {
    code: "spark.transport.tcp.transform_failed",
    message: "tcp stream transform",
};
pub(crate) const TRANSFER: OperationKind = OperationKind {
    code: "spark.transport.tcp.transfer_failed",
    message: "tcp transfer",
};
pub(crate) const SPAWN: OperationKind = OperationKind {
    code: "spark.transport.tcp.spawn_failed",
    message: "spawn reactor thread",
};

/// 连接级错误码。
pub mod codes {
    pub const UNDERFLOW: &str = "spark.transport.tcp.underflow";
    pub const MAX_SIZE_EXCEEDED: &str = "spark.transport.tcp.max_size_exceeded";
    pub const INVALID_STATE: &str = "spark.transport.tcp.invalid_state";
    pub const CLOSED_CHANNEL: &str = "spark.transport.tcp.closed_channel";
    pub const TIMEOUT: &str = "spark.transport.tcp.timeout";
    pub const DECODE: &str = "spark.transport.tcp.decode_failed";
}

/// 连接 API 的统一错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：非阻塞读取的“数据未到齐”、阻塞读取的“等待超时”与真正的传输故障需要被调用方区分对待：
///   前两者是流程信号，后者意味着连接已不可用。
/// - **契约 (What)**：
///   - 所有变体均为 `Clone + Send + Sync`，可同时投递给连接异常回调与阻塞等待方；
///   - [`code`](Self::code) 返回稳定错误码，命名空间 `spark.transport.tcp.*`；
///   - [`is_io_kind`](Self::is_io_kind) 为真的错误在 Handler 中返回时视为断线，静默关闭连接。
/// - **设计权衡 (Trade-offs)**：`io::Error` 不实现 `Clone`，因此以 `Arc` 包装；代价是一次额外分配，
///   只发生在失败路径上。
#[derive(Clone, Debug, Error)]
pub enum ConnectionError {
    /// 非阻塞读取时可读字节不足，调用方应等待下一次数据到达。
    #[error("not enough data: {available} byte(s) available")]
    Underflow { available: usize },

    /// 在上限内未找到分隔符。
    ///
    /// - **契约 (What)**：不消费任何字节，调用方可以改用按长度读取来取走原始数据。
    #[error("delimiter not found within {limit} byte(s)")]
    MaxSizeExceeded { limit: usize },

    /// 在当前状态下不允许的操作，例如在无读标记时复位。
    #[error("invalid connection state: {0}")]
    InvalidState(&'static str),

    /// 连接已关闭：写入总是失败；读取在已排队字节不足以满足请求时失败。
    #[error("connection is closed")]
    ClosedChannel,

    /// 阻塞操作或建连在时限内未完成。
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    /// 底层套接字操作失败。
    #[error("{}: {source}", .kind.message)]
    Io {
        kind: OperationKind,
        #[source]
        source: Arc<io::Error>,
    },

    /// 字节无法按连接字符集解码。
    #[error("bytes are not valid {charset}: {detail}")]
    Decode { charset: Charset, detail: String },
}

impl ConnectionError {
    /// 构造超时错误。
    pub(crate) fn timeout(operation: &'static str) -> Self {
        ConnectionError::Timeout { operation }
    }

    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            ConnectionError::Underflow { .. } => codes::UNDERFLOW,
            ConnectionError::MaxSizeExceeded { .. } => codes::MAX_SIZE_EXCEEDED,
            ConnectionError::InvalidState(_) => codes::INVALID_STATE,
            ConnectionError::ClosedChannel => codes::CLOSED_CHANNEL,
            ConnectionError::Timeout { .. } => codes::TIMEOUT,
            ConnectionError::Io { kind, .. } => kind.code,
            ConnectionError::Decode { .. } => codes::DECODE,
        }
    }

    /// 是否为“连接已不可用”类错误。
    pub fn is_io_kind(&self) -> bool {
        matches!(
            self,
            ConnectionError::ClosedChannel
                | ConnectionError::Timeout { .. }
                | ConnectionError::Io { .. }
        )
    }

    /// 是否为“等待更多数据”信号。
    pub fn is_underflow(&self) -> bool {
        matches!(self, ConnectionError::Underflow { .. })
    }
}

impl From<QueueError> for ConnectionError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::Underflow { available } => ConnectionError::Underflow { available },
            QueueError::MaxSizeExceeded { limit } => ConnectionError::MaxSizeExceeded { limit },
            QueueError::InvalidState(reason) => ConnectionError::InvalidState(reason),
        }
    }
}

/// 将 IO 错误映射为连接错误，并附带稳定错误码。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> ConnectionError {
    ConnectionError::Io {
        kind,
        source: Arc::new(error),
    }
}

/// Handler 回调的失败类型。
///
/// # 教案式说明
/// - **意图 (Why)**：引擎需要区分“连接层面的失败”（静默关闭即可）与“业务代码缺陷”（需要上报）。
/// - **契约 (What)**：
///   - `Connection`：来自连接 API 的错误；`Underflow` 在数据回调中被吞掉，I/O 类错误导致静默关闭；
///   - `Io`：业务自行执行 I/O 时得到的错误，按断线处理；
///   - `Fault`：业务故障，关闭连接并交给 [`FaultSink`](crate::FaultSink)。
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("handler fault: {0}")]
    Fault(Box<dyn StdError + Send + Sync>),
}

impl HandlerError {
    /// 以任意错误构造业务故障。
    pub fn fault<E>(error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        HandlerError::Fault(error.into())
    }
}

/// 配置加载失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML 语法或字段类型错误。
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// 字段取值不合法。
    #[error("invalid configuration value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}
