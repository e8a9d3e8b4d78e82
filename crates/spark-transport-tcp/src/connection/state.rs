use std::fmt;

use crate::error::ConnectionError;

/// 连接生命周期状态。
///
/// ```text
/// Connecting ──► Open ──► Closing ──► Closed
///     │            └───────────────────▲
///     ├──► Failed（建连失败，终态，不再有任何回调）
///     └──► Closed（建连期间被关闭，不投递断开回调）
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    /// 是否为终态。
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// 是否仍可写入（建连中写入的字节在建连成功后发送）。
    pub fn accepts_writes(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `close()` 请求的处理方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CloseAction {
    /// 已在关闭或已终止。
    Noop,
    /// 已进入 `Closing`，等待写队列排空。
    Drain,
    /// 可以立即完成关闭。
    Finish,
}

/// 受“状态锁”保护的生命周期字段。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 状态迁移的判定集中在这里，连接的其余部分只根据返回值执行副作用（释放套接字、投递回调），
///   保证“断开回调恰好一次”“`Failed` 后不再有回调”等约束只需要在一处验证。
///
/// ## 契约 (What)
/// - 所有方法都是纯状态迁移，不做 I/O、不加其他锁；
/// - 锁顺序：状态锁 → 写侧锁 → 套接字锁。
#[derive(Debug)]
pub(crate) struct StateCell {
    state: ConnectionState,
    suspended: bool,
    connect_error: Option<ConnectionError>,
}

impl StateCell {
    pub(crate) fn new(initial: ConnectionState) -> Self {
        Self {
            state: initial,
            suspended: false,
            connect_error: None,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub(crate) fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }

    pub(crate) fn connect_error(&self) -> Option<&ConnectionError> {
        self.connect_error.as_ref()
    }

    /// `Connecting → Open`；返回是否发生迁移。
    pub(crate) fn open(&mut self) -> bool {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Open;
            true
        } else {
            false
        }
    }

    /// `Connecting → Failed`；返回是否发生迁移。
    pub(crate) fn fail(&mut self, error: ConnectionError) -> bool {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Failed;
            self.connect_error = Some(error);
            true
        } else {
            false
        }
    }

    /// 处理关闭请求。`pending_output` 表示写队列中仍有待发送字节。
    pub(crate) fn request_close(&mut self, pending_output: bool) -> CloseAction {
        match self.state {
            ConnectionState::Connecting => CloseAction::Finish,
            ConnectionState::Open if pending_output => {
                self.state = ConnectionState::Closing;
                CloseAction::Drain
            }
            ConnectionState::Open => CloseAction::Finish,
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed => {
                CloseAction::Noop
            }
        }
    }

    /// 迁移到 `Closed`。返回 `None` 表示已是终态；`Some(true)` 表示连接曾经打开，需要投递断开回调。
    pub(crate) fn finish_close(&mut self) -> Option<bool> {
        let was_open = match self.state {
            ConnectionState::Open | ConnectionState::Closing => true,
            ConnectionState::Connecting => false,
            ConnectionState::Closed | ConnectionState::Failed => return None,
        };
        self.state = ConnectionState::Closed;
        self.suspended = false;
        Some(was_open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_connection_with_pending_output_drains_before_closing() {
        let mut cell = StateCell::new(ConnectionState::Open);
        assert_eq!(cell.request_close(true), CloseAction::Drain);
        assert_eq!(cell.state(), ConnectionState::Closing);
        assert!(!cell.state().accepts_writes());
        assert_eq!(cell.request_close(true), CloseAction::Noop, "重复关闭幂等");
        assert_eq!(cell.finish_close(), Some(true));
        assert_eq!(cell.finish_close(), None, "断开只发生一次");
    }

    #[test]
    fn closing_while_connecting_skips_disconnect() {
        let mut cell = StateCell::new(ConnectionState::Connecting);
        assert_eq!(cell.request_close(true), CloseAction::Finish);
        assert_eq!(cell.finish_close(), Some(false));
        assert_eq!(cell.state(), ConnectionState::Closed);
        assert!(!cell.open(), "终态不可再打开");
    }

    #[test]
    fn failed_is_terminal_and_keeps_error() {
        let mut cell = StateCell::new(ConnectionState::Connecting);
        assert!(cell.fail(ConnectionError::timeout("connect")));
        assert_eq!(cell.state(), ConnectionState::Failed);
        assert!(cell.state().is_terminal());
        assert!(matches!(cell.connect_error(), Some(ConnectionError::Timeout { .. })));
        assert_eq!(cell.request_close(false), CloseAction::Noop);
        assert_eq!(cell.finish_close(), None);
        assert!(!cell.fail(ConnectionError::ClosedChannel));
    }

    #[test]
    fn fail_only_applies_while_connecting() {
        let mut cell = StateCell::new(ConnectionState::Connecting);
        assert!(cell.open());
        assert!(!cell.fail(ConnectionError::ClosedChannel));
        assert_eq!(cell.state(), ConnectionState::Open);
    }
}
