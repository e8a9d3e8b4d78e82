use std::sync::Arc;

use super::{CallbackKind, Capabilities, ExecutionMode, Handler, HandlerResult};
use crate::{connection::Connection, error::ConnectionError};

/// 有序的 Handler 组合。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把横切逻辑（审计、鉴权）与协议处理拆成独立 Handler，再按顺序串起来；
///
/// ## 逻辑 (How)
/// - 每个事件按插入顺序只派发给声明了该能力的成员；首个 `Ok(true)` 终止传播；
/// - 成员返回错误时立即停止并把错误交给连接处理；
/// - 链的能力集是成员能力的并集；某事件只要有一个成员要求多线程执行，整条链就按多线程执行。
#[derive(Clone, Default)]
pub struct HandlerChain {
    members: Vec<Arc<dyn Handler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加成员，返回自身以便链式调用。
    pub fn with<H: Handler>(mut self, handler: H) -> Self {
        self.members.push(Arc::new(handler));
        self
    }

    /// 追加共享成员。
    pub fn push(&mut self, handler: Arc<dyn Handler>) {
        self.members.push(handler);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn propagate<F>(&self, kind: CallbackKind, mut call: F) -> HandlerResult
    where
        F: FnMut(&dyn Handler) -> HandlerResult,
    {
        for member in &self.members {
            if !member.capabilities().supports(kind) {
                continue;
            }
            if call(member.as_ref())? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Handler for HandlerChain {
    fn capabilities(&self) -> Capabilities {
        self.members
            .iter()
            .fold(Capabilities::NONE, |caps, member| caps | member.capabilities())
    }

    fn execution_mode(&self, kind: CallbackKind) -> ExecutionMode {
        let any_threaded = self.members.iter().any(|member| {
            member.capabilities().supports(kind)
                && member.execution_mode(kind) == ExecutionMode::Multithreaded
        });
        if any_threaded || self.members.is_empty() {
            ExecutionMode::Multithreaded
        } else {
            ExecutionMode::NonThreaded
        }
    }

    fn on_connect(&self, connection: &Connection) -> HandlerResult {
        self.propagate(CallbackKind::Connect, |h| h.on_connect(connection))
    }

    fn on_data(&self, connection: &Connection) -> HandlerResult {
        self.propagate(CallbackKind::Data, |h| h.on_data(connection))
    }

    fn on_disconnect(&self, connection: &Connection) -> HandlerResult {
        self.propagate(CallbackKind::Disconnect, |h| h.on_disconnect(connection))
    }

    fn on_idle_timeout(&self, connection: &Connection) -> HandlerResult {
        self.propagate(CallbackKind::IdleTimeout, |h| h.on_idle_timeout(connection))
    }

    fn on_connection_timeout(&self, connection: &Connection) -> HandlerResult {
        self.propagate(CallbackKind::ConnectionTimeout, |h| {
            h.on_connection_timeout(connection)
        })
    }

    fn on_connect_exception(&self, connection: &Connection, error: &ConnectionError) -> HandlerResult {
        self.propagate(CallbackKind::ConnectException, |h| {
            h.on_connect_exception(connection, error)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Declares(Capabilities, ExecutionMode);

    impl Handler for Declares {
        fn capabilities(&self) -> Capabilities {
            self.0
        }

        fn execution_mode(&self, _kind: CallbackKind) -> ExecutionMode {
            self.1
        }
    }

    #[test]
    fn chain_capabilities_are_union_of_members() {
        let chain = HandlerChain::new()
            .with(Declares(Capabilities::CONNECT, ExecutionMode::NonThreaded))
            .with(Declares(Capabilities::DATA, ExecutionMode::NonThreaded));
        let caps = chain.capabilities();
        assert!(caps.supports(CallbackKind::Connect));
        assert!(caps.supports(CallbackKind::Data));
        assert!(!caps.supports(CallbackKind::Disconnect));
        assert_eq!(chain.execution_mode(CallbackKind::Data), ExecutionMode::NonThreaded);
    }

    #[test]
    fn any_threaded_member_makes_event_threaded() {
        let chain = HandlerChain::new()
            .with(Declares(Capabilities::DATA, ExecutionMode::NonThreaded))
            .with(Declares(Capabilities::DATA, ExecutionMode::Multithreaded));
        assert_eq!(chain.execution_mode(CallbackKind::Data), ExecutionMode::Multithreaded);
        assert_eq!(
            HandlerChain::new().execution_mode(CallbackKind::Data),
            ExecutionMode::Multithreaded
        );
    }
}
