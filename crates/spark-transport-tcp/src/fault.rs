use std::fmt;

use crate::{connection::ConnectionId, handler::CallbackKind};

/// 一次业务故障的描述。
#[derive(Clone, Debug)]
pub struct HandlerFault {
    pub connection: ConnectionId,
    pub callback: CallbackKind,
    pub message: String,
    /// 故障是否来自 panic。
    pub panicked: bool,
}

impl fmt::Display for HandlerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} handler for {} {}: {}",
            self.callback,
            self.connection,
            if self.panicked { "panicked" } else { "failed" },
            self.message
        )
    }
}

/// 业务故障的上报出口。
///
/// # 教案式说明
/// - **意图 (Why)**：Handler 的 panic 或 `HandlerError::Fault` 代表业务缺陷，连接被关闭之外还需要让运维看到；
///   出口由 [`Reactor`](crate::Reactor) 显式持有，测试可以注入记录型实现。
/// - **契约 (What)**：在执行回调的线程上同步调用，实现不得阻塞过久，也不得 panic。
pub trait FaultSink: Send + Sync + 'static {
    fn report(&self, fault: &HandlerFault);
}

/// 默认出口：以 `error` 级别写入 tracing。
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingFaultSink;

impl FaultSink for TracingFaultSink {
    fn report(&self, fault: &HandlerFault) {
        tracing::error!(
            connection = %fault.connection,
            callback = %fault.callback,
            panicked = fault.panicked,
            message = %fault.message,
            "handler fault; closing connection"
        );
    }
}
