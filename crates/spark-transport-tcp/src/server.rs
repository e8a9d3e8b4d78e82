use std::{
    collections::HashMap,
    fmt, io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use mio::{Events, Interest, Poll, Token, Waker, net::TcpListener};
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};

use crate::{
    config::{ConnectionDefaults, ServerConfig},
    connection::{Connection, ConnectionId, ConnectionState, inner::ConnectionInner},
    error::{ACCEPT, BIND, ConnectionError, REGISTER, SPAWN, map_io_error},
    handler::{Handler, HandlerChain, HandlerSource, NoopHandler},
    reactor::{Reactor, ReactorCore},
    transform::{StreamTransform, TransformFactory},
};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

/// [`Server`] 构造器。
pub struct ServerBuilder {
    core: Arc<ReactorCore>,
    config: ServerConfig,
    handler: Option<HandlerSource>,
    transform: Option<TransformFactory>,
}

impl ServerBuilder {
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind = addr;
        self
    }

    /// 所有连接共享同一个 Handler 实例。
    pub fn handler<H: Handler>(mut self, handler: H) -> Self {
        self.handler = Some(HandlerSource::shared(handler));
        self
    }

    pub fn handler_source(mut self, source: HandlerSource) -> Self {
        self.handler = Some(source);
        self
    }

    pub fn handler_chain(mut self, chain: HandlerChain) -> Self {
        self.handler = Some(HandlerSource::from(chain));
        self
    }

    /// 每条接入的连接调用一次工厂，得到私有的 Handler 实例。
    pub fn handler_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Handler> + Send + Sync + 'static,
    {
        self.handler = Some(HandlerSource::per_connection(factory));
        self
    }

    /// 为每条连接创建一个字节流变换层（例如加解密）。
    pub fn transform_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn StreamTransform> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(factory));
        self
    }

    pub fn defaults(mut self, defaults: ConnectionDefaults) -> Self {
        self.config.defaults = defaults;
        self
    }

    pub fn max_concurrent_connections(mut self, limit: Option<usize>) -> Self {
        self.config.max_concurrent_connections = limit;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.config.backlog = backlog;
        self
    }

    /// 绑定监听地址并启动接入线程。
    pub fn bind(self) -> Result<Server, ConnectionError> {
        self.core.ensure_running()?;
        self.config
            .defaults
            .validate()
            .map_err(|_| ConnectionError::InvalidState("invalid connection defaults"))?;

        let mut listener = open_listener(self.config.bind, self.config.backlog)?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| map_io_error(BIND, err))?;
        let poll = Poll::new().map_err(|err| map_io_error(REGISTER, err))?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(|err| map_io_error(REGISTER, err))?;
        let waker =
            Arc::new(Waker::new(poll.registry(), WAKER).map_err(|err| map_io_error(REGISTER, err))?);

        let shared = Arc::new(ServerShared {
            poll_timeout: self.core.config().poll_timeout,
            core: self.core,
            local_addr,
            handler: self
                .handler
                .unwrap_or_else(|| HandlerSource::shared(NoopHandler)),
            transform: self.transform,
            defaults: RwLock::new(self.config.defaults),
            limit: RwLock::new(self.config.max_concurrent_connections),
            open: Mutex::new(HashMap::new()),
            accepted: AtomicU64::new(0),
            refused: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let acceptor = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("spark-acceptor-{}", local_addr.port()))
            .spawn(move || acceptor.run(poll, listener))
            .map_err(|err| map_io_error(SPAWN, err))?;

        tracing::debug!(local = %local_addr, "server listening");
        Ok(Server {
            shared,
            waker,
            thread: Mutex::new(Some(thread)),
        })
    }
}

/// 以 `socket2` 构造非阻塞监听套接字。
fn open_listener(bind: SocketAddr, backlog: i32) -> Result<TcpListener, ConnectionError> {
    let socket = Socket::new(Domain::for_address(bind), Type::STREAM, Some(Protocol::TCP))
        .map_err(|err| map_io_error(BIND, err))?;
    socket
        .set_reuse_address(true)
        .map_err(|err| map_io_error(BIND, err))?;
    socket
        .set_nonblocking(true)
        .map_err(|err| map_io_error(BIND, err))?;
    socket
        .bind(&bind.into())
        .map_err(|err| map_io_error(BIND, err))?;
    socket
        .listen(backlog)
        .map_err(|err| map_io_error(BIND, err))?;
    let listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(listener))
}

/// 接入线程与 [`Server`] 句柄共享的状态。
struct ServerShared {
    core: Arc<ReactorCore>,
    local_addr: SocketAddr,
    poll_timeout: Duration,
    handler: HandlerSource,
    transform: Option<TransformFactory>,
    defaults: RwLock<ConnectionDefaults>,
    limit: RwLock<Option<usize>>,
    open: Mutex<HashMap<ConnectionId, Connection>>,
    accepted: AtomicU64,
    refused: AtomicU64,
    closed: AtomicBool,
}

impl ServerShared {
    fn run(self: Arc<Self>, mut poll: Poll, mut listener: TcpListener) {
        let mut events = Events::with_capacity(128);
        while !self.closed.load(Ordering::Acquire) && !self.core.is_shutdown() {
            if let Err(error) = poll.poll(&mut events, Some(self.poll_timeout)) {
                if error.kind() != io::ErrorKind::Interrupted {
                    tracing::warn!(local = %self.local_addr, error = %error, "acceptor poll failed");
                }
                continue;
            }
            for event in events.iter() {
                if event.token() == LISTENER {
                    self.accept_pending(&listener);
                }
            }
        }
        let _ = poll.registry().deregister(&mut listener);
        tracing::debug!(local = %self.local_addr, "acceptor stopped");
    }

    fn accept_pending(self: &Arc<Self>, listener: &TcpListener) {
        loop {
            match listener.accept() {
                Ok((stream, remote)) => self.admit(stream, remote),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    let error = map_io_error(ACCEPT, error);
                    tracing::warn!(local = %self.local_addr, error = %error, "accept failed");
                    return;
                }
            }
        }
    }

    /// 准入检查通过后创建连接并交给 Dispatcher；超出上限时立即关闭套接字。
    fn admit(self: &Arc<Self>, stream: mio::net::TcpStream, remote: SocketAddr) {
        let limit = *self.limit.read();
        if let Some(limit) = limit
            && self.open.lock().len() >= limit
        {
            self.refused.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(local = %self.local_addr, remote = %remote, limit, "connection refused: limit reached");
            drop(stream);
            return;
        }

        let handler = self.handler.resolve();
        let transform = self.transform.as_ref().map(|factory| factory());
        let defaults = self.defaults.read().clone();
        let inner = match ConnectionInner::new(
            Arc::clone(&self.core),
            stream,
            remote,
            ConnectionState::Open,
            handler,
            defaults,
            transform,
        ) {
            Ok(inner) => inner,
            Err(error) => {
                tracing::warn!(local = %self.local_addr, remote = %remote, error = %error, "failed to set up accepted connection");
                return;
            }
        };

        let connection = Connection::from_inner(Arc::clone(&inner));
        self.open.lock().insert(connection.id(), connection.clone());
        let server = Arc::downgrade(self);
        connection.on_close(move |id| {
            if let Some(server) = server.upgrade() {
                server.open.lock().remove(&id);
            }
        });
        self.accepted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(local = %self.local_addr, remote = %remote, connection = %connection.id(), "connection accepted");

        if let Err(error) = inner.start() {
            tracing::warn!(connection = %connection.id(), error = %error, "failed to register accepted connection");
        }
    }
}

/// 监听服务器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 接入与 I/O 分离：专用接入线程只负责 `accept` 与准入控制，随后把连接交给负载最小的 Dispatcher；
/// - 服务器与客户端共用同一个 [`Connection`] 抽象与 Handler 契约。
///
/// ## 契约 (What)
/// - 超出 [`set_max_concurrent_connections`](Self::set_max_concurrent_connections) 的接入被立即关闭并计入拒绝数；
/// - [`open_connections`](Self::open_connections) 返回尚未终止的连接快照；
/// - [`close`](Self::close) 幂等：停止接入并关闭全部已打开连接；`Drop` 时自动关闭。
pub struct Server {
    shared: Arc<ServerShared>,
    waker: Arc<Waker>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn builder(reactor: &Reactor) -> ServerBuilder {
        ServerBuilder {
            core: Arc::clone(reactor.core()),
            config: ServerConfig::default(),
            handler: None,
            transform: None,
        }
    }

    /// 以共享 Handler 与默认参数在 `addr` 上监听。
    pub fn bind<H: Handler>(
        reactor: &Reactor,
        addr: SocketAddr,
        handler: H,
    ) -> Result<Self, ConnectionError> {
        Self::builder(reactor).bind_addr(addr).handler(handler).bind()
    }

    /// 实际绑定的地址（端口 0 时为系统分配的端口）。
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn open_connections(&self) -> Vec<Connection> {
        self.shared.open.lock().values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.open.lock().len()
    }

    /// 累计接入的连接数。
    pub fn accepted_count(&self) -> u64 {
        self.shared.accepted.load(Ordering::Relaxed)
    }

    /// 因超出并发上限而被拒绝的连接数。
    pub fn refused_count(&self) -> u64 {
        self.shared.refused.load(Ordering::Relaxed)
    }

    pub fn set_max_concurrent_connections(&self, limit: Option<usize>) {
        *self.shared.limit.write() = limit;
    }

    pub fn max_concurrent_connections(&self) -> Option<usize> {
        *self.shared.limit.read()
    }

    /// 设置空闲超时：作为新连接的默认值，并应用到当前已打开的连接。
    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.shared.defaults.write().idle_timeout = timeout;
        for connection in self.open_connections() {
            connection.set_idle_timeout(timeout);
        }
    }

    /// 设置连接超时：作为新连接的默认值，并应用到当前已打开的连接。
    pub fn set_connection_timeout(&self, timeout: Option<Duration>) {
        self.shared.defaults.write().connection_timeout = timeout;
        for connection in self.open_connections() {
            connection.set_connection_timeout(timeout);
        }
    }

    pub fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
    }

    /// 停止接入并关闭全部连接。
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.waker.wake();
        if let Some(handle) = self.thread.lock().take()
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
        let connections = self.open_connections();
        for connection in &connections {
            connection.close();
        }
        tracing::debug!(local = %self.shared.local_addr, closed = connections.len(), "server closed");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.shared.local_addr)
            .field("open", &self.connection_count())
            .field("closed", &!self.is_open())
            .finish()
    }
}
