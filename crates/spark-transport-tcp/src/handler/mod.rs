//! Handler 契约：连接生命周期与数据到达的业务回调。
//!
//! # 设计动机（Why）
//! - 连接引擎只负责搬运与分帧，所有协议语义都落在 Handler 中；
//! - 一个 Handler 可以只关心部分事件，[`Capabilities`] 在绑定时探测一次，
//!   之后的派发只是一次直接的可选调用，不做运行期类型检查。
//!
//! # 结构安排（How）
//! - [`Handler`]：回调 trait，全部方法都有默认实现（返回“未处理”）；
//! - [`HandlerChain`]：有序组合，首个返回 `Ok(true)` 的成员终止传播；
//! - [`FnHandler`]：以闭包拼装 Handler，能力集由注册了哪些闭包自动推导；
//! - [`HandlerSource`]：共享实例或“每连接一个实例”的工厂。

mod builder;
mod chain;

use std::{fmt, sync::Arc};

pub use builder::{FnHandler, FnHandlerBuilder};
pub use chain::HandlerChain;

use crate::{
    connection::Connection,
    error::{ConnectionError, HandlerError},
};

/// 回调结果：`Ok(true)` 表示已处理。
pub type HandlerResult = Result<bool, HandlerError>;

/// 回调种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    Connect,
    Data,
    Disconnect,
    IdleTimeout,
    ConnectionTimeout,
    ConnectException,
}

impl CallbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackKind::Connect => "on_connect",
            CallbackKind::Data => "on_data",
            CallbackKind::Disconnect => "on_disconnect",
            CallbackKind::IdleTimeout => "on_idle_timeout",
            CallbackKind::ConnectionTimeout => "on_connection_timeout",
            CallbackKind::ConnectException => "on_connect_exception",
        }
    }
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handler 声明的回调能力集合。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Self = Self(0);
    pub const CONNECT: Self = Self(1 << 0);
    pub const DATA: Self = Self(1 << 1);
    pub const DISCONNECT: Self = Self(1 << 2);
    pub const IDLE_TIMEOUT: Self = Self(1 << 3);
    pub const CONNECTION_TIMEOUT: Self = Self(1 << 4);
    pub const CONNECT_EXCEPTION: Self = Self(1 << 5);
    pub const ALL: Self = Self(0b0011_1111);

    /// 某一回调种类对应的能力位。
    pub const fn of(kind: CallbackKind) -> Self {
        match kind {
            CallbackKind::Connect => Self::CONNECT,
            CallbackKind::Data => Self::DATA,
            CallbackKind::Disconnect => Self::DISCONNECT,
            CallbackKind::IdleTimeout => Self::IDLE_TIMEOUT,
            CallbackKind::ConnectionTimeout => Self::CONNECTION_TIMEOUT,
            CallbackKind::ConnectException => Self::CONNECT_EXCEPTION,
        }
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// 是否具备处理 `kind` 的能力。
    pub const fn supports(self, kind: CallbackKind) -> bool {
        self.contains(Self::of(kind))
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for Capabilities {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const KINDS: [CallbackKind; 6] = [
            CallbackKind::Connect,
            CallbackKind::Data,
            CallbackKind::Disconnect,
            CallbackKind::IdleTimeout,
            CallbackKind::ConnectionTimeout,
            CallbackKind::ConnectException,
        ];
        f.debug_set()
            .entries(KINDS.iter().filter(|kind| self.supports(**kind)))
            .finish()
    }
}

/// 回调执行方式。
///
/// - `Multithreaded`（默认）：回调在工作池线程上执行；
/// - `NonThreaded`：回调在触发事件的线程上就地执行，适合极短的非阻塞逻辑：
///   连接与数据回调在 Dispatcher 线程上执行；超时回调在超时巡检线程上执行；
///   由应用线程 `close()` 引起的断开回调在该应用线程上执行。
///   若触发时该连接已有回调正在执行，新回调排队，由正在执行的线程随后执行。
///
/// 无论哪种方式，同一连接的回调都严格串行。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    #[default]
    Multithreaded,
    NonThreaded,
}

/// 连接事件回调。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 统一描述建连、数据到达、断开、空闲超时、连接超时与建连失败六类事件；
/// - 方法全部带默认实现，实现方只覆写关心的事件，并在 [`capabilities`](Self::capabilities) 中声明。
///
/// ## 契约 (What)
/// - 返回 `Ok(true)` 表示已处理；在 [`HandlerChain`] 中会终止向后传播；
/// - `on_data` 返回 `Underflow` 被视为“等待更多数据”并被吞掉；
/// - 返回 I/O 类错误时连接被静默关闭；`HandlerError::Fault` 或 panic 会关闭连接并上报故障；
/// - 超时回调返回后，若 Handler 未通过 `reset()` 或重新设置超时来“续期”，连接被关闭；
/// - 同一连接上的回调从不并发。
///
/// ## 注意事项 (Trade-offs)
/// - `capabilities` 默认声明全部能力：未覆写的超时回调返回 `Ok(false)`，连接随后被关闭，
///   这与“未声明超时能力”的行为一致；
/// - `capabilities` 与 `execution_mode` 只在绑定时探测一次，运行期修改不会生效。
pub trait Handler: Send + Sync + 'static {
    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    fn execution_mode(&self, _kind: CallbackKind) -> ExecutionMode {
        ExecutionMode::Multithreaded
    }

    fn on_connect(&self, _connection: &Connection) -> HandlerResult {
        Ok(false)
    }

    fn on_data(&self, _connection: &Connection) -> HandlerResult {
        Ok(false)
    }

    fn on_disconnect(&self, _connection: &Connection) -> HandlerResult {
        Ok(false)
    }

    fn on_idle_timeout(&self, _connection: &Connection) -> HandlerResult {
        Ok(false)
    }

    fn on_connection_timeout(&self, _connection: &Connection) -> HandlerResult {
        Ok(false)
    }

    fn on_connect_exception(
        &self,
        _connection: &Connection,
        _error: &ConnectionError,
    ) -> HandlerResult {
        Ok(false)
    }
}

/// 不处理任何事件的 Handler，供阻塞门面等无需回调的场景使用。
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl Handler for NoopHandler {
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }
}

/// Handler 的来源：共享实例，或为每条连接调用一次的工厂。
#[derive(Clone)]
pub enum HandlerSource {
    Shared(Arc<dyn Handler>),
    PerConnection(Arc<dyn Fn() -> Arc<dyn Handler> + Send + Sync>),
}

impl HandlerSource {
    pub fn shared<H: Handler>(handler: H) -> Self {
        HandlerSource::Shared(Arc::new(handler))
    }

    pub fn per_connection<F>(factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Handler> + Send + Sync + 'static,
    {
        HandlerSource::PerConnection(Arc::new(factory))
    }

    pub(crate) fn resolve(&self) -> Arc<dyn Handler> {
        match self {
            HandlerSource::Shared(handler) => Arc::clone(handler),
            HandlerSource::PerConnection(factory) => factory(),
        }
    }
}

impl fmt::Debug for HandlerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerSource::Shared(_) => f.write_str("HandlerSource::Shared"),
            HandlerSource::PerConnection(_) => f.write_str("HandlerSource::PerConnection"),
        }
    }
}

impl From<Arc<dyn Handler>> for HandlerSource {
    fn from(handler: Arc<dyn Handler>) -> Self {
        HandlerSource::Shared(handler)
    }
}

impl From<HandlerChain> for HandlerSource {
    fn from(chain: HandlerChain) -> Self {
        HandlerSource::shared(chain)
    }
}

impl From<FnHandler> for HandlerSource {
    fn from(handler: FnHandler) -> Self {
        HandlerSource::shared(handler)
    }
}

/// 绑定到连接上的 Handler 及其在绑定时探测到的能力与执行方式。
#[derive(Clone)]
pub(crate) struct BoundHandler {
    handler: Arc<dyn Handler>,
    capabilities: Capabilities,
    modes: [ExecutionMode; 6],
}

impl BoundHandler {
    pub(crate) fn bind(handler: Arc<dyn Handler>) -> Self {
        let capabilities = handler.capabilities();
        let modes = [
            CallbackKind::Connect,
            CallbackKind::Data,
            CallbackKind::Disconnect,
            CallbackKind::IdleTimeout,
            CallbackKind::ConnectionTimeout,
            CallbackKind::ConnectException,
        ]
        .map(|kind| handler.execution_mode(kind));
        Self {
            handler,
            capabilities,
            modes,
        }
    }

    pub(crate) fn supports(&self, kind: CallbackKind) -> bool {
        self.capabilities.supports(kind)
    }

    pub(crate) fn mode(&self, kind: CallbackKind) -> ExecutionMode {
        self.modes[kind as usize]
    }

    pub(crate) fn handler(&self) -> &dyn Handler {
        self.handler.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DataOnly;

    impl Handler for DataOnly {
        fn capabilities(&self) -> Capabilities {
            Capabilities::DATA
        }

        fn execution_mode(&self, kind: CallbackKind) -> ExecutionMode {
            if kind == CallbackKind::Data {
                ExecutionMode::NonThreaded
            } else {
                ExecutionMode::Multithreaded
            }
        }
    }

    #[test]
    fn binding_probes_capabilities_and_modes_once() {
        let bound = BoundHandler::bind(Arc::new(DataOnly));
        assert!(bound.supports(CallbackKind::Data));
        assert!(!bound.supports(CallbackKind::IdleTimeout));
        assert_eq!(bound.mode(CallbackKind::Data), ExecutionMode::NonThreaded);
        assert_eq!(bound.mode(CallbackKind::Connect), ExecutionMode::Multithreaded);
    }

    #[test]
    fn capability_set_operations() {
        let caps = Capabilities::CONNECT | Capabilities::DISCONNECT;
        assert!(caps.supports(CallbackKind::Connect));
        assert!(!caps.supports(CallbackKind::Data));
        assert!(Capabilities::ALL.contains(caps));
        assert!(Capabilities::NONE.is_empty());
        assert_eq!(format!("{caps:?}"), "{Connect, Disconnect}");
    }

    #[test]
    fn per_connection_source_builds_fresh_instances() {
        let source = HandlerSource::per_connection(|| Arc::new(NoopHandler) as Arc<dyn Handler>);
        let first = source.resolve();
        let second = source.resolve();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
