use std::{
    cell::Cell,
    collections::{HashMap, HashSet},
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::Mutex;

use crate::{
    config::ReactorConfig,
    connection::inner::{ConnectionInner, WriteProgress},
    error::{ConnectionError, REGISTER, SPAWN, map_io_error},
};

/// 唤醒令牌；连接令牌从 1 开始分配。
const WAKER: Token = Token(0);

/// 单次 `poll` 处理的最大事件数。
const EVENT_CAPACITY: usize = 1024;

thread_local! {
    static IN_DISPATCHER: Cell<bool> = const { Cell::new(false) };
}

/// 当前线程是否为 Dispatcher 线程。
pub(crate) fn in_dispatcher() -> bool {
    IN_DISPATCHER.with(Cell::get)
}

/// 发往 Dispatcher 线程的控制命令。
pub(crate) enum Command {
    /// 接管连接：注册到 `Poll` 并加入连接表。
    Register(Arc<ConnectionInner>),
    /// 主动读写一轮（恢复接收、flush、调整限速后）。
    Refresh(Token),
    /// 连接已释放套接字，从连接表移除。
    Deregister(Token),
    Shutdown,
}

/// 连接在其生命周期内归属的 Dispatcher 与令牌。
#[derive(Clone)]
pub(crate) struct Registration {
    pub(crate) dispatcher: Arc<DispatcherHandle>,
    pub(crate) token: Token,
}

/// 应用线程一侧持有的 Dispatcher 句柄。
pub(crate) struct DispatcherHandle {
    index: usize,
    sender: Sender<Command>,
    waker: Waker,
    registry: Registry,
    load: Arc<AtomicUsize>,
    next_token: AtomicUsize,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DispatcherHandle {
    fn spawn(index: usize, config: &ReactorConfig) -> Result<Arc<Self>, ConnectionError> {
        let poll = Poll::new().map_err(|err| map_io_error(REGISTER, err))?;
        let waker = Waker::new(poll.registry(), WAKER).map_err(|err| map_io_error(REGISTER, err))?;
        let registry = poll
            .registry()
            .try_clone()
            .map_err(|err| map_io_error(REGISTER, err))?;
        let (sender, receiver) = unbounded();
        let load = Arc::new(AtomicUsize::new(0));

        let dispatcher = Dispatcher {
            index,
            poll,
            receiver,
            load: Arc::clone(&load),
            connections: HashMap::new(),
            throttled: HashSet::new(),
            buffer: vec![0; config.read_buffer_size],
            poll_timeout: config.poll_timeout,
            throttle_tick: config.throttle_tick,
        };
        let thread = thread::Builder::new()
            .name(format!("spark-dispatcher-{index}"))
            .spawn(move || dispatcher.run())
            .map_err(|err| map_io_error(SPAWN, err))?;

        Ok(Arc::new(Self {
            index,
            sender,
            waker,
            registry,
            load,
            next_token: AtomicUsize::new(1),
            thread: Mutex::new(Some(thread)),
        }))
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// 与 Dispatcher 共享的注册表，用于在任意线程注销套接字。
    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    /// 投递命令并唤醒 Dispatcher。
    pub(crate) fn send(&self, command: Command) -> Result<(), ConnectionError> {
        self.sender
            .send(command)
            .map_err(|_| ConnectionError::InvalidState("dispatcher stopped"))?;
        self.waker.wake().map_err(|err| map_io_error(REGISTER, err))
    }

    fn stop(&self) {
        let _ = self.send(Command::Shutdown);
    }

    fn join(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }
}

/// 固定数量的 Dispatcher 线程。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 少量 I/O 线程复用大量连接：每个线程拥有私有的 `mio::Poll` 与连接表，线程之间没有共享的就绪集合；
/// - 连接注册后不再迁移，同一连接的读写由同一线程驱动，字节顺序天然保持。
///
/// ## 逻辑 (How)
/// - [`assign`](Self::assign) 选择当前负载最小的 Dispatcher，负载相同时用游标轮转打破平局；
/// - 其余线程通过 `crossbeam_channel` 投递 [`Command`]，再用 `mio::Waker` 打断 `poll`。
///
/// ## 契约 (What)
/// - 负载计数在分配时递增，在连接注销时递减；
/// - [`shutdown`](Self::shutdown) 幂等：每个线程先尽力写出、再关闭其名下全部连接，然后退出。
pub(crate) struct DispatcherPool {
    handles: Vec<Arc<DispatcherHandle>>,
    cursor: AtomicUsize,
}

impl DispatcherPool {
    pub(crate) fn start(config: &ReactorConfig) -> Result<Self, ConnectionError> {
        let mut handles = Vec::with_capacity(config.dispatchers);
        for index in 0..config.dispatchers {
            match DispatcherHandle::spawn(index, config) {
                Ok(handle) => handles.push(handle),
                Err(error) => {
                    for handle in &handles {
                        handle.stop();
                        handle.join();
                    }
                    return Err(error);
                }
            }
        }
        tracing::debug!(dispatchers = handles.len(), "dispatcher pool started");
        Ok(Self {
            handles,
            cursor: AtomicUsize::new(0),
        })
    }

    /// 为新连接选择 Dispatcher 并分配令牌。
    pub(crate) fn assign(&self) -> Result<Registration, ConnectionError> {
        let count = self.handles.len();
        if count == 0 {
            return Err(ConnectionError::InvalidState("no dispatcher available"));
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
        let mut chosen = &self.handles[start];
        for offset in 1..count {
            let candidate = &self.handles[(start + offset) % count];
            if candidate.load() < chosen.load() {
                chosen = candidate;
            }
        }
        chosen.load.fetch_add(1, Ordering::AcqRel);
        let token = Token(chosen.next_token.fetch_add(1, Ordering::Relaxed));
        Ok(Registration {
            dispatcher: Arc::clone(chosen),
            token,
        })
    }

    /// 各 Dispatcher 当前负责的连接数。
    pub(crate) fn loads(&self) -> Vec<usize> {
        self.handles.iter().map(|handle| handle.load()).collect()
    }

    pub(crate) fn shutdown(&self) {
        for handle in &self.handles {
            handle.stop();
        }
        for handle in &self.handles {
            handle.join();
        }
    }
}

/// Dispatcher 线程的私有状态。
struct Dispatcher {
    index: usize,
    poll: Poll,
    receiver: Receiver<Command>,
    load: Arc<AtomicUsize>,
    connections: HashMap<Token, Arc<ConnectionInner>>,
    /// 因限速额度耗尽而等待下一个节拍的连接。
    throttled: HashSet<Token>,
    buffer: Vec<u8>,
    poll_timeout: Duration,
    throttle_tick: Duration,
}

impl Dispatcher {
    fn run(mut self) {
        IN_DISPATCHER.with(|flag| flag.set(true));
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        tracing::debug!(dispatcher = self.index, "dispatcher running");

        loop {
            let timeout = if self.throttled.is_empty() {
                self.poll_timeout
            } else {
                self.throttle_tick
            };
            if let Err(error) = self.poll.poll(&mut events, Some(timeout)) {
                if error.kind() != io::ErrorKind::Interrupted {
                    tracing::warn!(dispatcher = self.index, error = %error, "poll failed");
                }
                continue;
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKER {
                    continue;
                }
                let readable =
                    event.is_readable() || event.is_read_closed() || event.is_error();
                self.on_ready(token, readable);
            }

            if !self.process_commands() {
                break;
            }
            self.service_throttled();
        }

        self.close_all();
        tracing::debug!(dispatcher = self.index, "dispatcher stopped");
    }

    fn on_ready(&mut self, token: Token, readable: bool) {
        let Some(connection) = self.connections.get(&token).cloned() else {
            return;
        };
        let progress = connection.handle_event(readable, &mut self.buffer);
        self.track(token, progress);
    }

    fn track(&mut self, token: Token, progress: WriteProgress) {
        if progress.throttled && self.connections.contains_key(&token) {
            self.throttled.insert(token);
        } else {
            self.throttled.remove(&token);
        }
    }

    /// 处理全部已排队命令；收到关闭命令时返回 `false`。
    fn process_commands(&mut self) -> bool {
        loop {
            match self.receiver.try_recv() {
                Ok(Command::Register(connection)) => self.register(connection),
                Ok(Command::Refresh(token)) => {
                    if let Some(connection) = self.connections.get(&token).cloned() {
                        let progress = connection.refresh(&mut self.buffer);
                        self.track(token, progress);
                    }
                }
                Ok(Command::Deregister(token)) => {
                    self.connections.remove(&token);
                    self.throttled.remove(&token);
                    self.load.fetch_sub(1, Ordering::AcqRel);
                }
                Ok(Command::Shutdown) => return false,
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn register(&mut self, connection: Arc<ConnectionInner>) {
        if connection.state().is_terminal() {
            return;
        }
        let token = connection.registration.token;
        if let Err(error) = connection.register_with(self.poll.registry()) {
            tracing::warn!(dispatcher = self.index, connection = %connection.id, error = %error, "failed to register connection");
            connection.abort(map_io_error(REGISTER, error));
            return;
        }
        self.connections.insert(token, connection);
    }

    /// 为限速中的连接补发；是否真正写出由各连接自己的节拍额度决定。
    fn service_throttled(&mut self) {
        if self.throttled.is_empty() {
            return;
        }
        let pending: Vec<Token> = self.throttled.iter().copied().collect();
        for token in pending {
            let Some(connection) = self.connections.get(&token).cloned() else {
                self.throttled.remove(&token);
                continue;
            };
            let progress = connection.pump_writes();
            self.track(token, progress);
        }
    }

    /// 退出前关闭名下全部连接，包括尚未处理的注册命令。
    fn close_all(&mut self) {
        while let Ok(command) = self.receiver.try_recv() {
            if let Command::Register(connection) = command {
                connection.shutdown_by_reactor();
            }
        }
        let connections: Vec<_> = self.connections.drain().map(|(_, c)| c).collect();
        self.throttled.clear();
        let count = connections.len();
        for connection in connections {
            connection.shutdown_by_reactor();
        }
        if count > 0 {
            tracing::debug!(dispatcher = self.index, connections = count, "closed connections on shutdown");
        }
    }
}
