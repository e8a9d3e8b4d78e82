use std::{
    any::Any,
    io::{self, IoSlice, Read, Write},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use mio::{Interest, Registry, net::TcpStream};
use parking_lot::{Mutex, RwLock};
use spark_buffer::{IoQueue, ReadQueue, WriteMark};

use super::{
    ConnectionId,
    callbacks::{Callback, CallbackQueue},
    state::{CloseAction, ConnectionState, StateCell},
};
use crate::{
    charset::Charset,
    config::{ConnectionDefaults, FlushMode},
    dispatcher::{Command, Registration},
    error::{CONFIGURE, CONNECT, ConnectionError, READ, TRANSFORM, WRITE_VECTORED, map_io_error},
    handler::{BoundHandler, CallbackKind, Handler},
    reactor::ReactorCore,
    throttle::WriteThrottle,
    transform::StreamTransform,
    util::Notifier,
};

/// 单次 vectored 写出的最大租借量。
const MAX_WRITE_BATCH: usize = 256 * 1024;

type CloseHook = Box<dyn FnOnce(ConnectionId) + Send>;
pub(crate) type Attachment = Arc<dyn Any + Send + Sync>;

/// 写出结果：剩余待发字节数，以及是否因限速额度耗尽而停下。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct WriteProgress {
    pub(crate) remaining: usize,
    pub(crate) throttled: bool,
}

/// 写侧：待发送队列、写标记与限速器，由同一把锁保护。
#[derive(Debug)]
pub(crate) struct WriteSide {
    pub(crate) queue: IoQueue,
    pub(crate) mark: Option<WriteMark>,
    pub(crate) throttle: WriteThrottle,
}

/// 连接的可调标量参数。
#[derive(Clone, Debug)]
pub(crate) struct Settings {
    pub(crate) flush_mode: FlushMode,
    pub(crate) autoflush: bool,
    pub(crate) charset: Charset,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
}

impl Settings {
    fn from_defaults(defaults: &ConnectionDefaults) -> Self {
        Self {
            flush_mode: defaults.flush_mode,
            autoflush: defaults.autoflush,
            charset: defaults.charset,
            read_timeout: defaults.read_timeout,
            write_timeout: defaults.write_timeout,
        }
    }
}

/// 超时记录。
///
/// - `epoch` 在每次“续期”（`reset()`、重新设置超时）时递增，
///   超时回调返回后比较 epoch 判断 Handler 是否续期；
/// - 空闲超时以 `last_activity` 为基准，连接超时以 `connection_started` 为基准；
///   两者在续期时都重新取当前时刻。
#[derive(Debug)]
pub(crate) struct Timers {
    pub(crate) connection_started: Instant,
    pub(crate) last_activity: Instant,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) connection_timeout: Option<Duration>,
    pub(crate) connect_deadline: Option<Instant>,
    pub(crate) idle_fired: bool,
    pub(crate) connection_fired: bool,
    pub(crate) epoch: u64,
}

impl Timers {
    fn new(defaults: &ConnectionDefaults, connecting: bool) -> Self {
        let now = Instant::now();
        Self {
            connection_started: now,
            last_activity: now,
            idle_timeout: defaults.idle_timeout,
            connection_timeout: defaults.connection_timeout,
            connect_deadline: if connecting {
                defaults.connect_timeout.map(|timeout| now + timeout)
            } else {
                None
            },
            idle_fired: false,
            connection_fired: false,
            epoch: 0,
        }
    }

    fn is_armed(&self) -> bool {
        self.idle_timeout.is_some()
            || self.connection_timeout.is_some()
            || self.connect_deadline.is_some()
    }
}

/// 连接的共享内核，由 Dispatcher、工作线程与用户句柄共同持有。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 一条连接同时被三方访问：Dispatcher 线程读写套接字、工作线程执行 Handler、应用线程调用阻塞门面；
///   把可变部分拆成几把粒度明确的锁，避免一把大锁把读写两侧串死。
///
/// ## 逻辑 (How)
/// - `state`（状态锁）→ `write`（写侧锁）→ `socket`（套接字锁）是唯一允许的嵌套顺序；
/// - `read`、`settings`、`timers`、`attachment` 等为叶子锁，从不与其他锁嵌套持有；
/// - 跨线程等待统一走 `notifier`：数据到达、写队列推进、状态迁移都会推进其序号。
///
/// ## 契约 (What)
/// - 连接终生归属于注册时分配的 Dispatcher 与令牌，不迁移；
/// - 进入 `Closed` 后套接字立即释放，不再发送任何字节。
pub(crate) struct ConnectionInner {
    pub(crate) id: ConnectionId,
    pub(crate) reactor: Arc<ReactorCore>,
    pub(crate) registration: Registration,
    pub(crate) defaults: ConnectionDefaults,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) local_addr: Mutex<Option<SocketAddr>>,
    pub(crate) state: Mutex<StateCell>,
    pub(crate) read: Mutex<ReadQueue>,
    pub(crate) write: Mutex<WriteSide>,
    pub(crate) socket: Mutex<Option<TcpStream>>,
    pub(crate) settings: Mutex<Settings>,
    pub(crate) timers: Mutex<Timers>,
    pub(crate) callbacks: Mutex<CallbackQueue>,
    pub(crate) handler: RwLock<BoundHandler>,
    pub(crate) attachment: Mutex<Option<Attachment>>,
    pub(crate) transform: Option<Arc<dyn StreamTransform>>,
    pub(crate) notifier: Notifier,
    close_hooks: Mutex<Option<Vec<CloseHook>>>,
}

impl ConnectionInner {
    /// 包装一个已创建的非阻塞套接字；尚未注册到 Dispatcher。
    pub(crate) fn new(
        reactor: Arc<ReactorCore>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        initial: ConnectionState,
        handler: Arc<dyn Handler>,
        defaults: ConnectionDefaults,
        transform: Option<Arc<dyn StreamTransform>>,
    ) -> Result<Arc<Self>, ConnectionError> {
        defaults
            .socket
            .apply_all(&stream)
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let registration = reactor.dispatchers.assign()?;
        let local_addr = stream.local_addr().ok();
        let id = reactor.next_connection_id();
        let tick = reactor.config().throttle_tick;

        Ok(Arc::new(Self {
            id,
            registration,
            remote_addr,
            local_addr: Mutex::new(local_addr),
            state: Mutex::new(StateCell::new(initial)),
            read: Mutex::new(ReadQueue::new()),
            write: Mutex::new(WriteSide {
                queue: IoQueue::new(),
                mark: None,
                throttle: WriteThrottle::new(defaults.write_transfer_rate, tick),
            }),
            socket: Mutex::new(Some(stream)),
            settings: Mutex::new(Settings::from_defaults(&defaults)),
            timers: Mutex::new(Timers::new(
                &defaults,
                initial == ConnectionState::Connecting,
            )),
            callbacks: Mutex::new(CallbackQueue::default()),
            handler: RwLock::new(BoundHandler::bind(handler)),
            attachment: Mutex::new(None),
            transform,
            notifier: Notifier::new(),
            close_hooks: Mutex::new(Some(Vec::new())),
            defaults,
            reactor,
        }))
    }

    /// 投递建连回调（已打开的连接）并交给 Dispatcher。
    pub(crate) fn start(self: &Arc<Self>) -> Result<(), ConnectionError> {
        if self.state() == ConnectionState::Open {
            self.dispatch(Callback::Connect);
        }
        if let Err(error) = self
            .registration
            .dispatcher
            .send(Command::Register(Arc::clone(self)))
        {
            self.abort(error.clone());
            return Err(error);
        }
        if self.timers.lock().is_armed() {
            self.reactor.timeouts.watch(self);
        }
        tracing::debug!(
            connection = %self.id,
            dispatcher = self.registration.dispatcher.index(),
            remote = %self.remote_addr,
            state = %self.state(),
            "connection registered"
        );
        Ok(())
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state.lock().state()
    }

    pub(crate) fn timer_epoch(&self) -> u64 {
        self.timers.lock().epoch
    }

    pub(crate) fn touch(&self) {
        self.timers.lock().last_activity = Instant::now();
    }

    pub(crate) fn request_refresh(&self) -> Result<(), ConnectionError> {
        self.registration
            .dispatcher
            .send(Command::Refresh(self.registration.token))
    }

    /// 在 Dispatcher 的 `Poll` 上注册套接字。
    pub(crate) fn register_with(&self, registry: &Registry) -> io::Result<()> {
        let mut socket = self.socket.lock();
        match socket.as_mut() {
            Some(stream) => registry.register(
                stream,
                self.registration.token,
                Interest::READABLE | Interest::WRITABLE,
            ),
            None => Ok(()),
        }
    }

    /// Dispatcher 线程上的就绪事件处理。
    ///
    /// 写方向无论是否就绪都尝试推进一次：可读事件期间 Handler 可能已经追加了待发字节。
    pub(crate) fn handle_event(self: &Arc<Self>, readable: bool, buffer: &mut [u8]) -> WriteProgress {
        match self.state() {
            ConnectionState::Connecting => {
                if !self.finish_connect() {
                    return WriteProgress::default();
                }
            }
            ConnectionState::Open | ConnectionState::Closing => {}
            ConnectionState::Closed | ConnectionState::Failed => return WriteProgress::default(),
        }
        if readable {
            self.receive(buffer);
        }
        self.pump_writes()
    }

    /// 恢复接收或请求 flush 后，由 Dispatcher 主动读写一轮。
    pub(crate) fn refresh(self: &Arc<Self>, buffer: &mut [u8]) -> WriteProgress {
        match self.state() {
            ConnectionState::Open | ConnectionState::Closing => {
                self.receive(buffer);
                self.pump_writes()
            }
            _ => WriteProgress::default(),
        }
    }

    /// 检查非阻塞建连是否完成；返回连接是否已打开。
    fn finish_connect(self: &Arc<Self>) -> bool {
        let outcome = {
            let socket = self.socket.lock();
            let Some(stream) = socket.as_ref() else {
                return false;
            };
            match stream.take_error() {
                Ok(Some(error)) | Err(error) => Err(error),
                Ok(None) => match stream.peer_addr() {
                    Ok(_) => Ok(true),
                    Err(error)
                        if error.kind() == io::ErrorKind::NotConnected
                            || error.kind() == io::ErrorKind::WouldBlock =>
                    {
                        Ok(false)
                    }
                    Err(error) => Err(error),
                },
            }
        };

        match outcome {
            Ok(true) => {
                if self.state.lock().open() {
                    let local = self.socket.lock().as_ref().and_then(|s| s.local_addr().ok());
                    *self.local_addr.lock() = local;
                    tracing::debug!(connection = %self.id, remote = %self.remote_addr, "connection established");
                    self.notifier.notify();
                    self.dispatch(Callback::Connect);
                }
                true
            }
            Ok(false) => false,
            Err(error) => {
                self.fail_connect(map_io_error(CONNECT, error));
                false
            }
        }
    }

    /// `Connecting → Failed`，投递建连失败回调。
    pub(crate) fn fail_connect(self: &Arc<Self>, error: ConnectionError) {
        if !self.state.lock().fail(error.clone()) {
            return;
        }
        tracing::debug!(connection = %self.id, remote = %self.remote_addr, error = %error, "connect failed");
        self.release_socket();
        self.notifier.notify();
        self.run_close_hooks();
        self.dispatch(Callback::ConnectException(error));
    }

    /// 读空套接字，把字节追加到读队列并投递数据回调。
    fn receive(self: &Arc<Self>, buffer: &mut [u8]) {
        if self.state.lock().is_suspended() {
            return;
        }

        let mut segments = Vec::new();
        let mut eof = false;
        let mut failure = None;
        {
            let mut socket = self.socket.lock();
            let Some(stream) = socket.as_mut() else {
                return;
            };
            loop {
                match stream.read(buffer) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(n) => segments.push(Bytes::copy_from_slice(&buffer[..n])),
                    Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                    Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                    Err(error) => {
                        failure = Some(map_io_error(READ, error));
                        break;
                    }
                }
            }
        }

        if let Some(transform) = &self.transform {
            let mut decoded = Vec::with_capacity(segments.len());
            for segment in segments {
                match transform.inbound(segment) {
                    Ok(plain) => decoded.push(plain),
                    Err(error) => {
                        failure = Some(map_io_error(TRANSFORM, error));
                        break;
                    }
                }
            }
            segments = decoded;
        }

        let received: usize = segments.iter().map(Bytes::len).sum();
        if received > 0 {
            self.read.lock().append_all(segments);
            self.touch();
            tracing::trace!(connection = %self.id, bytes = received, "received");
            self.notifier.notify();
            if self.handler.read().supports(CallbackKind::Data) {
                self.dispatch(Callback::Data);
            }
        }

        if let Some(error) = failure {
            self.abort(error);
        } else if eof {
            tracing::debug!(connection = %self.id, "peer closed");
            self.close();
        }
    }

    /// 在限速额度内把写队列推入套接字。
    pub(crate) fn pump_writes(self: &Arc<Self>) -> WriteProgress {
        let state = self.state();
        if !matches!(state, ConnectionState::Open | ConnectionState::Closing) {
            return WriteProgress {
                remaining: self.write.lock().queue.len(),
                throttled: false,
            };
        }

        let mut written = 0usize;
        let mut failure = None;
        let (remaining, throttled, marked) = {
            let mut guard = self.write.lock();
            let side = &mut *guard;
            let mut budget = side.throttle.budget(Instant::now());
            {
                let mut socket = self.socket.lock();
                let Some(stream) = socket.as_mut() else {
                    return WriteProgress::default();
                };
                while budget > 0 {
                    let Some(lease) = side.queue.lease(budget.min(MAX_WRITE_BATCH)) else {
                        break;
                    };
                    let slices: Vec<IoSlice<'_>> =
                        lease.iter().map(|segment| IoSlice::new(segment)).collect();
                    match stream.write_vectored(&slices) {
                        Ok(0) => {
                            side.queue.commit_lease(0);
                            failure = Some(io::Error::from(io::ErrorKind::WriteZero));
                            break;
                        }
                        Ok(n) => {
                            side.queue.commit_lease(n);
                            side.throttle.consume(n);
                            budget = budget.saturating_sub(n);
                            written += n;
                        }
                        Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                            side.queue.commit_lease(0);
                            break;
                        }
                        Err(error) if error.kind() == io::ErrorKind::Interrupted => {
                            side.queue.commit_lease(0);
                        }
                        Err(error) => {
                            side.queue.commit_lease(0);
                            failure = Some(error);
                            break;
                        }
                    }
                }
            }
            let remaining = side.queue.len();
            (
                remaining,
                remaining > 0 && budget == 0 && side.throttle.is_limited(),
                side.mark.is_some(),
            )
        };

        if written > 0 {
            self.touch();
            tracing::trace!(connection = %self.id, bytes = written, remaining, "sent");
        }
        if let Some(error) = failure {
            self.abort(map_io_error(WRITE_VECTORED, error));
            return WriteProgress::default();
        }
        if written > 0 || remaining == 0 {
            self.notifier.notify();
        }
        if remaining == 0 && !marked && state == ConnectionState::Closing {
            self.finish_close();
        }
        WriteProgress {
            remaining,
            throttled,
        }
    }

    /// 对出站字节应用变换层。
    pub(crate) fn encode_outbound(&self, data: Bytes) -> Result<Bytes, ConnectionError> {
        match &self.transform {
            Some(transform) => transform
                .outbound(data)
                .map_err(|err| map_io_error(TRANSFORM, err)),
            None => Ok(data),
        }
    }

    /// 结束写标记并把暂存字节提交进写队列。
    pub(crate) fn commit_write_mark(&self, side: &mut WriteSide) -> Result<(), ConnectionError> {
        if let Some(mark) = side.mark.take() {
            let encoded = self.encode_outbound(mark.finish())?;
            side.queue.append(encoded);
        }
        Ok(())
    }

    /// 优雅关闭：有待发字节时先进入 `Closing`，由 Dispatcher 排空后完成关闭。
    pub(crate) fn close(self: &Arc<Self>) {
        let (action, commit_failure) = {
            let mut cell = self.state.lock();
            let mut side = self.write.lock();
            let commit = if cell.state() == ConnectionState::Open {
                self.commit_write_mark(&mut side).err()
            } else {
                None
            };
            let pending = !side.queue.is_empty();
            drop(side);
            (cell.request_close(pending), commit)
        };

        if let Some(error) = commit_failure {
            self.abort(error);
            return;
        }
        match action {
            CloseAction::Noop => {}
            CloseAction::Finish => self.finish_close(),
            CloseAction::Drain => {
                tracing::debug!(connection = %self.id, "closing after pending output drains");
                self.notifier.notify();
                if self.request_refresh().is_err() {
                    self.abort(ConnectionError::ClosedChannel);
                }
            }
        }
    }

    /// 丢弃待发字节并立即关闭。
    pub(crate) fn abort(self: &Arc<Self>, error: ConnectionError) {
        if self.state() == ConnectionState::Connecting {
            self.fail_connect(error);
            return;
        }
        {
            let mut side = self.write.lock();
            side.mark = None;
            let _ = side.queue.drain();
        }
        tracing::debug!(connection = %self.id, error = %error, "connection aborted");
        self.finish_close();
    }

    /// 迁移到 `Closed`，释放套接字并投递断开回调（恰好一次）。
    pub(crate) fn finish_close(self: &Arc<Self>) {
        let Some(was_open) = self.state.lock().finish_close() else {
            return;
        };
        self.release_socket();
        self.notifier.notify();
        self.run_close_hooks();
        tracing::debug!(connection = %self.id, remote = %self.remote_addr, "connection closed");
        if was_open {
            self.dispatch(Callback::Disconnect);
        }
    }

    fn release_socket(&self) {
        let stream = self.socket.lock().take();
        if let Some(mut stream) = stream {
            let _ = self.registration.dispatcher.registry().deregister(&mut stream);
            drop(stream);
        }
        let _ = self
            .registration
            .dispatcher
            .send(Command::Deregister(self.registration.token));
    }

    /// 注册关闭钩子；连接已终止时立即执行。
    pub(crate) fn on_close<F>(&self, hook: F)
    where
        F: FnOnce(ConnectionId) + Send + 'static,
    {
        let mut hooks = self.close_hooks.lock();
        match hooks.as_mut() {
            Some(pending) => pending.push(Box::new(hook)),
            None => {
                drop(hooks);
                hook(self.id);
            }
        }
    }

    fn run_close_hooks(&self) {
        let hooks = self.close_hooks.lock().take();
        for hook in hooks.into_iter().flatten() {
            hook(self.id);
        }
    }

    /// 超时巡检；返回是否继续监视该连接。
    pub(crate) fn check_timeouts(self: &Arc<Self>, now: Instant) -> bool {
        match self.state() {
            ConnectionState::Closed | ConnectionState::Failed => false,
            ConnectionState::Closing => true,
            ConnectionState::Connecting => {
                let deadline = self.timers.lock().connect_deadline;
                if deadline.is_some_and(|deadline| now >= deadline) {
                    self.fail_connect(ConnectionError::timeout("connect"));
                    return false;
                }
                true
            }
            ConnectionState::Open => {
                let fired = {
                    let mut timers = self.timers.lock();
                    let epoch = timers.epoch;
                    if let Some(limit) = timers.connection_timeout
                        && !timers.connection_fired
                        && now.saturating_duration_since(timers.connection_started) > limit
                    {
                        timers.connection_fired = true;
                        Some(Callback::ConnectionTimeout { epoch })
                    } else if let Some(limit) = timers.idle_timeout
                        && !timers.idle_fired
                        && now.saturating_duration_since(timers.last_activity) > limit
                    {
                        timers.idle_fired = true;
                        Some(Callback::IdleTimeout { epoch })
                    } else {
                        None
                    }
                };
                if let Some(callback) = fired {
                    tracing::debug!(connection = %self.id, callback = %callback.kind(), "timeout fired");
                    self.dispatch(callback);
                }
                true
            }
        }
    }

    /// 设置空闲超时并续期。
    pub(crate) fn set_idle_timeout(self: &Arc<Self>, timeout: Option<Duration>) {
        {
            let mut timers = self.timers.lock();
            timers.idle_timeout = timeout;
            timers.idle_fired = false;
            timers.last_activity = Instant::now();
            timers.epoch += 1;
        }
        if timeout.is_some() {
            self.reactor.timeouts.watch(self);
        }
    }

    /// 设置连接超时并续期。
    pub(crate) fn set_connection_timeout(self: &Arc<Self>, timeout: Option<Duration>) {
        {
            let mut timers = self.timers.lock();
            timers.connection_timeout = timeout;
            timers.connection_fired = false;
            timers.connection_started = Instant::now();
            timers.epoch += 1;
        }
        if timeout.is_some() {
            self.reactor.timeouts.watch(self);
        }
    }

    /// 恢复默认值并续期，供连接复用。
    pub(crate) fn reset(self: &Arc<Self>) -> bool {
        if self.state() != ConnectionState::Open {
            return false;
        }
        {
            let mut read = self.read.lock();
            read.clear();
        }
        {
            let mut side = self.write.lock();
            if let Err(error) = self.commit_write_mark(&mut side) {
                drop(side);
                self.abort(error);
                return false;
            }
            side.throttle.set_rate(self.defaults.write_transfer_rate);
        }
        *self.settings.lock() = Settings::from_defaults(&self.defaults);
        *self.attachment.lock() = None;
        {
            let mut timers = self.timers.lock();
            timers.idle_timeout = self.defaults.idle_timeout;
            timers.connection_timeout = self.defaults.connection_timeout;
            timers.idle_fired = false;
            timers.connection_fired = false;
            let now = Instant::now();
            timers.last_activity = now;
            timers.connection_started = now;
            timers.epoch += 1;
        }
        if self.timers.lock().is_armed() {
            self.reactor.timeouts.watch(self);
        }
        let was_suspended = {
            let mut cell = self.state.lock();
            let suspended = cell.is_suspended();
            cell.set_suspended(false);
            suspended
        };
        if was_suspended {
            let _ = self.request_refresh();
        }
        true
    }

    /// Reactor 关闭时调用：尽力发送已排队字节后关闭。
    pub(crate) fn shutdown_by_reactor(self: &Arc<Self>) {
        if matches!(
            self.state(),
            ConnectionState::Open | ConnectionState::Closing
        ) {
            let _ = self.pump_writes();
        }
        self.abort(ConnectionError::ClosedChannel);
    }
}
