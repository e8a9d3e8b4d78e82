use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use crate::{
    config::ReactorConfig,
    connection::ConnectionId,
    dispatcher::DispatcherPool,
    error::ConnectionError,
    executor::WorkerPool,
    fault::{FaultSink, TracingFaultSink},
    timeout::TimeoutManager,
};

/// Reactor 的共享内核：Dispatcher 池、Handler 工作池、超时巡检与故障出口。
pub(crate) struct ReactorCore {
    config: ReactorConfig,
    pub(crate) dispatchers: DispatcherPool,
    pub(crate) workers: WorkerPool,
    pub(crate) timeouts: TimeoutManager,
    pub(crate) fault_sink: Arc<dyn FaultSink>,
    next_id: AtomicU64,
    shutdown: AtomicBool,
}

impl ReactorCore {
    pub(crate) fn config(&self) -> &ReactorConfig {
        &self.config
    }

    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_running(&self) -> Result<(), ConnectionError> {
        if self.is_shutdown() {
            Err(ConnectionError::InvalidState("reactor is shut down"))
        } else {
            Ok(())
        }
    }

    /// 按“超时巡检 → Dispatcher → 工作池”的顺序停止。
    ///
    /// Dispatcher 退出时关闭名下连接并投递断开回调，工作池随后排空这些回调。
    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("reactor shutting down");
        self.timeouts.shutdown();
        self.dispatchers.shutdown();
        self.workers.shutdown();
        tracing::debug!("reactor stopped");
    }
}

/// 最后一个 [`Reactor`] 句柄释放时关闭内核。
struct ShutdownGuard {
    core: Arc<ReactorCore>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}

/// 连接引擎的入口：持有 I/O 线程、工作线程与超时线程。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把原本的进程级全局状态（默认故障出口、线程池）收拢为一个显式构造的值，
///   测试可以为每个用例构造并丢弃独立的 Reactor；
/// - 句柄可克隆；服务器、连接池只借用内核，不延长 Reactor 的生命周期。
///
/// ## 契约 (What)
/// - [`shutdown`](Self::shutdown) 幂等：关闭全部连接（投递断开回调）并停止全部线程；
///   在 Handler 回调内调用时不会等待当前线程自身；
/// - 最后一个句柄被丢弃时自动关闭；
/// - 关闭之后发起的建连与监听返回 `InvalidState`。
#[derive(Clone)]
pub struct Reactor {
    core: Arc<ReactorCore>,
    _guard: Arc<ShutdownGuard>,
}

impl Reactor {
    /// 以默认配置启动。
    pub fn new() -> Result<Self, ConnectionError> {
        Self::builder().build()
    }

    pub fn with_config(config: ReactorConfig) -> Result<Self, ConnectionError> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> ReactorBuilder {
        ReactorBuilder::default()
    }

    pub(crate) fn core(&self) -> &Arc<ReactorCore> {
        &self.core
    }

    pub fn config(&self) -> &ReactorConfig {
        self.core.config()
    }

    pub fn shutdown(&self) {
        self.core.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.core.is_shutdown()
    }

    /// 各 Dispatcher 当前负责的连接数。
    pub fn dispatcher_loads(&self) -> Vec<usize> {
        self.core.dispatchers.loads()
    }

    /// 超时巡检表中的连接数。
    pub fn watched_connections(&self) -> usize {
        self.core.timeouts.watched()
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("config", self.core.config())
            .field("shutdown", &self.core.is_shutdown())
            .finish()
    }
}

/// [`Reactor`] 构造器。
#[derive(Default)]
pub struct ReactorBuilder {
    config: ReactorConfig,
    fault_sink: Option<Arc<dyn FaultSink>>,
}

impl ReactorBuilder {
    pub fn config(mut self, config: ReactorConfig) -> Self {
        self.config = config;
        self
    }

    /// 指定业务故障出口；默认写入 tracing。
    pub fn fault_sink(mut self, sink: Arc<dyn FaultSink>) -> Self {
        self.fault_sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Reactor, ConnectionError> {
        let config = self.config;
        config
            .validate()
            .map_err(|_| ConnectionError::InvalidState("invalid reactor configuration"))?;

        let workers = WorkerPool::new(config.workers, config.worker_queue_capacity)?;
        let timeouts = match TimeoutManager::start(config.timeout_sweep_interval) {
            Ok(timeouts) => timeouts,
            Err(error) => {
                workers.shutdown();
                return Err(error);
            }
        };
        let dispatchers = match DispatcherPool::start(&config) {
            Ok(dispatchers) => dispatchers,
            Err(error) => {
                timeouts.shutdown();
                workers.shutdown();
                return Err(error);
            }
        };
        tracing::debug!(
            dispatchers = config.dispatchers,
            workers = config.workers,
            "reactor started"
        );

        let core = Arc::new(ReactorCore {
            config,
            dispatchers,
            workers,
            timeouts,
            fault_sink: self
                .fault_sink
                .unwrap_or_else(|| Arc::new(TracingFaultSink)),
            next_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        });
        Ok(Reactor {
            _guard: Arc::new(ShutdownGuard {
                core: Arc::clone(&core),
            }),
            core,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reactor_shutdown_is_idempotent() {
        let reactor = Reactor::with_config(ReactorConfig::new().with_dispatchers(2).with_workers(2))
            .expect("启动 Reactor");
        assert_eq!(reactor.dispatcher_loads(), vec![0, 0]);
        reactor.shutdown();
        reactor.shutdown();
        assert!(reactor.is_shutdown());
        assert!(reactor.core().ensure_running().is_err());
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let result = Reactor::with_config(ReactorConfig::new().with_dispatchers(0));
        assert!(matches!(result, Err(ConnectionError::InvalidState(_))));
    }

    #[test]
    fn connection_ids_are_unique_and_increasing() {
        let reactor = Reactor::new().expect("启动 Reactor");
        let first = reactor.core().next_connection_id();
        let second = reactor.core().next_connection_id();
        assert!(second > first);
    }
}
