//! 非阻塞连接：分帧读取、聚合写出、生命周期与超时控制。
//!
//! # 设计动机（Why）
//! - 同一个 [`Connection`] 同时服务于服务端接入与客户端建连，Handler 契约与队列纪律完全一致；
//! - 读写 API 永不阻塞：数据不足返回 `Underflow`，由下一次数据回调重试；
//!   需要阻塞语义时使用 [`BlockingConnection`](crate::BlockingConnection)。
//!
//! # 结构安排（How）
//! - `state`：生命周期状态机（纯迁移逻辑）；
//! - `inner`：共享内核，持有套接字、读写队列与定时记录，供 Dispatcher 驱动；
//! - `callbacks`：每连接的回调串行化与故障分类。

mod callbacks;
pub(crate) mod inner;
mod state;

use std::{
    any::Any,
    fmt,
    io::{Read, Write},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use spark_buffer::{QueueError, ReadQueue, WriteMark};

pub use state::ConnectionState;

use self::inner::{Attachment, ConnectionInner};
use crate::{
    charset::Charset,
    config::{ConnectionDefaults, FlushMode},
    dispatcher::in_dispatcher,
    error::{CONFIGURE, CONNECT, ConnectionError, TRANSFER, map_io_error},
    handler::{BoundHandler, CallbackKind, Handler},
    options::{self, SocketOption, SocketOptionKind},
    reactor::{Reactor, ReactorCore},
    transform::StreamTransform,
    util::deadline_after,
};

/// `transfer_from` 单次读取的块大小。
const TRANSFER_CHUNK: usize = 64 * 1024;

/// 进程内唯一的连接标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// 客户端建连选项。
#[derive(Clone, Default)]
pub struct ConnectOptions {
    pub defaults: ConnectionDefaults,
    pub transform: Option<Arc<dyn StreamTransform>>,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(mut self, defaults: ConnectionDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_transform(mut self, transform: Arc<dyn StreamTransform>) -> Self {
        self.transform = Some(transform);
        self
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("defaults", &self.defaults)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

/// 非阻塞连接句柄。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 句柄可廉价克隆，Handler 回调、应用线程与连接池持有的是同一条连接；
/// - 所有方法都可以在任意线程调用，内部按“状态 → 写侧 → 套接字”的顺序加锁。
///
/// ## 契约 (What)
/// - 读取：数据不足返回 `Underflow` 且不消费任何字节；连接已终止且剩余字节不足时返回 `ClosedChannel`；
/// - 写入：`Open`/`Connecting` 状态下入队（建连中的字节在建连成功后发送），其余状态返回 `ClosedChannel`；
/// - 自动 flush（默认开启）在每次写入后调用 [`flush`](Self::flush)；
/// - `Sync` 模式下 flush 等待写队列排空（在 Dispatcher 线程上调用时只触发写出，不等待），
///   `Async` 模式下 flush 只通知 Dispatcher。
///
/// ## 注意事项 (Trade-offs)
/// - 引擎不阻止 Handler 与外部线程同时操作同一连接的队列；需要原子的“读-处理-写”序列时，
///   由调用方自行同步。
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<ConnectionInner> {
        &self.inner
    }

    /// 以默认连接参数发起非阻塞建连。
    ///
    /// 返回时连接处于 `Connecting`；建连结果通过 `on_connect` 或 `on_connect_exception` 回调送达，
    /// 也可以用 [`wait_connected`](Self::wait_connected) 等待。
    pub fn connect<H: Handler>(
        reactor: &Reactor,
        addr: SocketAddr,
        handler: H,
    ) -> Result<Self, ConnectionError> {
        Self::connect_with(reactor, addr, Arc::new(handler), ConnectOptions::default())
    }

    /// 以指定参数与共享 Handler 发起非阻塞建连。
    pub fn connect_with(
        reactor: &Reactor,
        addr: SocketAddr,
        handler: Arc<dyn Handler>,
        options: ConnectOptions,
    ) -> Result<Self, ConnectionError> {
        Self::open_client(reactor.core(), addr, handler, options)
    }

    pub(crate) fn open_client(
        core: &Arc<ReactorCore>,
        addr: SocketAddr,
        handler: Arc<dyn Handler>,
        options: ConnectOptions,
    ) -> Result<Self, ConnectionError> {
        core.ensure_running()?;
        options
            .defaults
            .validate()
            .map_err(|_| ConnectionError::InvalidState("invalid connection defaults"))?;
        let stream =
            mio::net::TcpStream::connect(addr).map_err(|err| map_io_error(CONNECT, err))?;
        let inner = ConnectionInner::new(
            Arc::clone(core),
            stream,
            addr,
            ConnectionState::Connecting,
            handler,
            options.defaults,
            options.transform,
        )?;
        tracing::debug!(connection = %inner.id, remote = %addr, "connecting");
        inner.start()?;
        Ok(Self { inner })
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// 等待建连完成。`timeout` 为 `None` 时无限等待。
    pub fn wait_connected(&self, timeout: Option<Duration>) -> Result<(), ConnectionError> {
        let deadline = deadline_after(timeout);
        loop {
            let seen = self.inner.notifier.current();
            {
                let cell = self.inner.state.lock();
                match cell.state() {
                    ConnectionState::Open | ConnectionState::Closing => return Ok(()),
                    ConnectionState::Failed => {
                        return Err(cell
                            .connect_error()
                            .cloned()
                            .unwrap_or(ConnectionError::ClosedChannel));
                    }
                    ConnectionState::Closed => return Err(ConnectionError::ClosedChannel),
                    ConnectionState::Connecting => {}
                }
            }
            if !self.inner.notifier.wait_past(seen, deadline) {
                return Err(ConnectionError::timeout("connect"));
            }
        }
    }

    // ---- 读取 ----

    /// 在读队列上执行一次结构化读取。
    ///
    /// 连接已终止时不会再有新字节到达：此时的 `Underflow` 改报为 `ClosedChannel`。
    fn read_with<T, F>(&self, mut read: F) -> Result<T, ConnectionError>
    where
        F: FnMut(&mut ReadQueue) -> Result<T, QueueError>,
    {
        let first = read(&mut self.inner.read.lock());
        match first {
            Err(QueueError::Underflow { .. }) if self.state().is_terminal() => {
                let retry = read(&mut self.inner.read.lock());
                retry.map_err(|error| {
                    if error.is_underflow() {
                        ConnectionError::ClosedChannel
                    } else {
                        error.into()
                    }
                })
            }
            other => other.map_err(ConnectionError::from),
        }
    }

    /// 当前可读字节数。
    pub fn available(&self) -> usize {
        self.inner.read.lock().available()
    }

    /// 非消费式查找分隔符。
    pub fn index_of(&self, delimiter: &[u8]) -> Option<usize> {
        self.inner.read.lock().index_of(delimiter)
    }

    pub fn read_bytes_by_length(&self, len: usize) -> Result<Bytes, ConnectionError> {
        self.read_with(|queue| queue.read_by_length(len))
    }

    pub fn read_segments_by_length(&self, len: usize) -> Result<Vec<Bytes>, ConnectionError> {
        self.read_with(|queue| queue.read_segments_by_length(len))
    }

    pub fn read_bytes_by_delimiter(&self, delimiter: &[u8]) -> Result<Bytes, ConnectionError> {
        self.read_bytes_by_delimiter_max(delimiter, usize::MAX)
    }

    /// 读取分隔符之前的字节；分隔符未在 `max_len` 字节内出现时返回 `MaxSizeExceeded`，且不消费。
    pub fn read_bytes_by_delimiter_max(
        &self,
        delimiter: &[u8],
        max_len: usize,
    ) -> Result<Bytes, ConnectionError> {
        self.read_with(|queue| queue.read_by_delimiter(delimiter, max_len))
    }

    pub fn read_segments_by_delimiter(
        &self,
        delimiter: &[u8],
        max_len: usize,
    ) -> Result<Vec<Bytes>, ConnectionError> {
        self.read_with(|queue| queue.read_segments_by_delimiter(delimiter, max_len))
    }

    /// 读取全部可读字节（可能为空）。
    pub fn read_available(&self) -> Bytes {
        self.inner.read.lock().read_available()
    }

    /// 以连接字符集读取 `len` 字节并解码。
    pub fn read_string_by_length(&self, len: usize) -> Result<String, ConnectionError> {
        let charset = self.charset();
        let bytes = self.read_bytes_by_length(len)?;
        charset.decode(&bytes)
    }

    /// 以连接字符集编码分隔符、读取并解码其之前的文本。
    pub fn read_string_by_delimiter(&self, delimiter: &str) -> Result<String, ConnectionError> {
        self.read_string_by_delimiter_max(delimiter, usize::MAX)
    }

    pub fn read_string_by_delimiter_max(
        &self,
        delimiter: &str,
        max_len: usize,
    ) -> Result<String, ConnectionError> {
        let charset = self.charset();
        let delimiter = charset.encode(delimiter);
        let bytes = self.read_bytes_by_delimiter_max(&delimiter, max_len)?;
        charset.decode(&bytes)
    }

    pub fn read_u8(&self) -> Result<u8, ConnectionError> {
        Ok(self.read_bytes_by_length(1)?.get_u8())
    }

    pub fn read_i16(&self) -> Result<i16, ConnectionError> {
        Ok(self.read_bytes_by_length(2)?.get_i16())
    }

    pub fn read_i32(&self) -> Result<i32, ConnectionError> {
        Ok(self.read_bytes_by_length(4)?.get_i32())
    }

    pub fn read_i64(&self) -> Result<i64, ConnectionError> {
        Ok(self.read_bytes_by_length(8)?.get_i64())
    }

    pub fn read_f64(&self) -> Result<f64, ConnectionError> {
        Ok(self.read_bytes_by_length(8)?.get_f64())
    }

    /// 在当前读位置设置读标记。
    pub fn mark_read_position(&self) {
        self.inner.read.lock().mark_read_position();
    }

    /// 回到读标记处；没有标记时返回 `InvalidState`。
    pub fn reset_to_read_mark(&self) -> Result<(), ConnectionError> {
        self.inner.read.lock().reset_to_read_mark()?;
        Ok(())
    }

    pub fn remove_read_mark(&self) {
        self.inner.read.lock().remove_read_mark();
    }

    /// 将字节放回读队列首部；设置了读标记时返回 `InvalidState`。
    pub fn unread(&self, data: Bytes) -> Result<(), ConnectionError> {
        self.inner.read.lock().unread(data)?;
        Ok(())
    }

    // ---- 写入 ----

    /// 把字节段入队（或写入写标记缓冲），并按自动 flush 设置决定是否 flush。
    fn enqueue<I>(&self, segments: I) -> Result<usize, ConnectionError>
    where
        I: IntoIterator<Item = Bytes>,
    {
        let (written, marked) = {
            let state = self.inner.state.lock();
            if !state.state().accepts_writes() {
                return Err(ConnectionError::ClosedChannel);
            }
            let mut side = self.inner.write.lock();
            let mut written = 0;
            for segment in segments {
                if segment.is_empty() {
                    continue;
                }
                written += segment.len();
                match side.mark.as_mut() {
                    Some(mark) => mark.write(&segment),
                    None => {
                        let encoded = self.inner.encode_outbound(segment)?;
                        side.queue.append(encoded);
                    }
                }
            }
            (written, side.mark.is_some())
        };

        if written > 0 && !marked && self.inner.settings.lock().autoflush {
            self.flush()?;
        }
        Ok(written)
    }

    /// 写入字节段，返回写入的字节数。
    pub fn write(&self, data: Bytes) -> Result<usize, ConnectionError> {
        self.enqueue([data])
    }

    pub fn write_bytes(&self, data: &[u8]) -> Result<usize, ConnectionError> {
        self.write(Bytes::copy_from_slice(data))
    }

    /// 一次写入多个字节段，只触发一次自动 flush。
    pub fn write_segments<I>(&self, segments: I) -> Result<usize, ConnectionError>
    where
        I: IntoIterator<Item = Bytes>,
    {
        self.enqueue(segments)
    }

    /// 以连接字符集编码文本后写入；返回编码后的字节数。
    pub fn write_str(&self, text: &str) -> Result<usize, ConnectionError> {
        let encoded = self.charset().encode(text);
        self.write(encoded)
    }

    pub fn write_u8(&self, value: u8) -> Result<usize, ConnectionError> {
        self.write(Bytes::copy_from_slice(&[value]))
    }

    pub fn write_i16(&self, value: i16) -> Result<usize, ConnectionError> {
        self.write(Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    pub fn write_i32(&self, value: i32) -> Result<usize, ConnectionError> {
        self.write(Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    pub fn write_i64(&self, value: i64) -> Result<usize, ConnectionError> {
        let mut buffer = BytesMut::with_capacity(8);
        buffer.put_i64(value);
        self.write(buffer.freeze())
    }

    pub fn write_f64(&self, value: f64) -> Result<usize, ConnectionError> {
        let mut buffer = BytesMut::with_capacity(8);
        buffer.put_f64(value);
        self.write(buffer.freeze())
    }

    /// 按 flush 模式推动写队列。
    pub fn flush(&self) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::Connecting => return Ok(()),
            ConnectionState::Closed | ConnectionState::Failed => {
                return Err(ConnectionError::ClosedChannel);
            }
            ConnectionState::Open | ConnectionState::Closing => {}
        }

        let (mode, write_timeout) = {
            let settings = self.inner.settings.lock();
            (settings.flush_mode, settings.write_timeout)
        };
        if mode == FlushMode::Async {
            return self.inner.request_refresh();
        }

        if self.inner.pump_writes().remaining == 0 {
            return Ok(());
        }
        self.inner.request_refresh()?;
        if in_dispatcher() {
            return Ok(());
        }

        let deadline = deadline_after(write_timeout);
        loop {
            let seen = self.inner.notifier.current();
            if self.pending_write_bytes() == 0 {
                return Ok(());
            }
            if self.state().is_terminal() {
                return Err(ConnectionError::ClosedChannel);
            }
            if !self.inner.notifier.wait_past(seen, deadline) {
                return Err(ConnectionError::timeout("flush"));
            }
        }
    }

    /// 写队列中尚未发送的字节数（不含写标记缓冲）。
    pub fn pending_write_bytes(&self) -> usize {
        self.inner.write.lock().queue.len()
    }

    /// 开始写标记：之后写入的字节暂存，直到 [`remove_write_mark`](Self::remove_write_mark)。
    ///
    /// 已有写标记时，先提交其暂存字节再开启新标记。
    pub fn mark_write_position(&self) -> Result<(), ConnectionError> {
        let state = self.inner.state.lock();
        if !state.state().accepts_writes() {
            return Err(ConnectionError::ClosedChannel);
        }
        let mut side = self.inner.write.lock();
        self.inner.commit_write_mark(&mut side)?;
        side.mark = Some(WriteMark::new());
        Ok(())
    }

    /// 把写位置移回写标记处，随后的写入覆盖标记区域（用于回填长度前缀）。
    pub fn reset_to_write_mark(&self) -> Result<(), ConnectionError> {
        let mut side = self.inner.write.lock();
        match side.mark.as_mut() {
            Some(mark) => {
                mark.reset();
                Ok(())
            }
            None => Err(ConnectionError::InvalidState("no write mark set")),
        }
    }

    /// 移除写标记，把暂存字节提交到写队列。
    pub fn remove_write_mark(&self) -> Result<(), ConnectionError> {
        let committed = {
            let mut side = self.inner.write.lock();
            let had_mark = side.mark.is_some();
            self.inner.commit_write_mark(&mut side)?;
            had_mark
        };
        if committed && self.inner.settings.lock().autoflush {
            self.flush()?;
        }
        Ok(())
    }

    // ---- 参数 ----

    pub fn set_autoflush(&self, autoflush: bool) {
        self.inner.settings.lock().autoflush = autoflush;
    }

    pub fn autoflush(&self) -> bool {
        self.inner.settings.lock().autoflush
    }

    pub fn set_flush_mode(&self, mode: FlushMode) {
        self.inner.settings.lock().flush_mode = mode;
    }

    pub fn flush_mode(&self) -> FlushMode {
        self.inner.settings.lock().flush_mode
    }

    pub fn set_charset(&self, charset: Charset) {
        self.inner.settings.lock().charset = charset;
    }

    pub fn charset(&self) -> Charset {
        self.inner.settings.lock().charset
    }

    /// 阻塞门面读取的超时；`None` 表示无限等待。
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.inner.settings.lock().read_timeout = timeout;
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.inner.settings.lock().read_timeout
    }

    /// 同步 flush 的超时；`None` 表示无限等待。
    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        self.inner.settings.lock().write_timeout = timeout;
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.inner.settings.lock().write_timeout
    }

    /// 暂停从套接字接收：字节留在内核接收缓冲区，已排队字节仍可读取。
    pub fn suspend_receiving(&self) {
        self.inner.state.lock().set_suspended(true);
        tracing::debug!(connection = %self.inner.id, "receiving suspended");
    }

    /// 恢复接收，并让 Dispatcher 立即读取积压字节。
    pub fn resume_receiving(&self) -> Result<(), ConnectionError> {
        let open = {
            let mut state = self.inner.state.lock();
            state.set_suspended(false);
            matches!(
                state.state(),
                ConnectionState::Open | ConnectionState::Closing
            )
        };
        tracing::debug!(connection = %self.inner.id, "receiving resumed");
        if open {
            self.inner.request_refresh()?;
        }
        Ok(())
    }

    pub fn is_receiving_suspended(&self) -> bool {
        self.inner.state.lock().is_suspended()
    }

    /// 设置写出速率上限（字节/秒）；`None` 取消限速。
    pub fn set_write_transfer_rate(&self, rate: Option<u64>) -> Result<(), ConnectionError> {
        if rate == Some(0) {
            return Err(ConnectionError::InvalidState(
                "write transfer rate must be positive",
            ));
        }
        self.inner.write.lock().throttle.set_rate(rate);
        if !self.state().is_terminal() {
            self.inner.request_refresh()?;
        }
        Ok(())
    }

    pub fn write_transfer_rate(&self) -> Option<u64> {
        self.inner.write.lock().throttle.rate()
    }

    /// 设置空闲超时；同时为 Handler 续期。
    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.inner.set_idle_timeout(timeout);
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.inner.timers.lock().idle_timeout
    }

    /// 设置连接超时；计时从本次调用重新起算（未设置过时从连接建立起算），同时为 Handler 续期。
    pub fn set_connection_timeout(&self, timeout: Option<Duration>) {
        self.inner.set_connection_timeout(timeout);
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        self.inner.timers.lock().connection_timeout
    }

    /// 距离空闲超时的剩余时间；未设置时返回 `None`。
    pub fn remaining_idle_time(&self) -> Option<Duration> {
        let timers = self.inner.timers.lock();
        let elapsed = Instant::now().saturating_duration_since(timers.last_activity);
        timers
            .idle_timeout
            .map(|limit| limit.saturating_sub(elapsed))
    }

    /// 距离连接超时的剩余时间；未设置时返回 `None`。
    pub fn remaining_connection_time(&self) -> Option<Duration> {
        let timers = self.inner.timers.lock();
        let elapsed = Instant::now().saturating_duration_since(timers.connection_started);
        timers
            .connection_timeout
            .map(|limit| limit.saturating_sub(elapsed))
    }

    // ---- 附件 ----

    /// 设置附件；附件在连接关闭后仍可读取。
    pub fn set_attachment<T>(&self, value: T)
    where
        T: Any + Send + Sync,
    {
        *self.inner.attachment.lock() = Some(Arc::new(value));
    }

    /// 按类型读取附件；类型不符或未设置时返回 `None`。
    pub fn attachment<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let attachment = self.inner.attachment.lock().clone()?;
        Arc::downcast::<T>(attachment).ok()
    }

    pub fn take_attachment(&self) -> Option<Attachment> {
        self.inner.attachment.lock().take()
    }

    // ---- 套接字选项 ----

    pub fn set_option(&self, option: SocketOption) -> Result<(), ConnectionError> {
        let socket = self.inner.socket.lock();
        let stream = socket.as_ref().ok_or(ConnectionError::ClosedChannel)?;
        options::apply(stream, option).map_err(|err| map_io_error(CONFIGURE, err))
    }

    pub fn option(&self, kind: SocketOptionKind) -> Result<SocketOption, ConnectionError> {
        let socket = self.inner.socket.lock();
        let stream = socket.as_ref().ok_or(ConnectionError::ClosedChannel)?;
        options::read(stream, kind).map_err(|err| map_io_error(CONFIGURE, err))
    }

    // ---- 批量传输 ----

    /// 把 `source` 读到 EOF 并全部写出；返回写入的字节数。
    pub fn transfer_from<R: Read>(&self, source: &mut R) -> Result<usize, ConnectionError> {
        let autoflush = self.autoflush();
        self.set_autoflush(false);
        let result = self.copy_from(source);
        self.set_autoflush(autoflush);
        let total = result?;
        if autoflush && total > 0 {
            self.flush()?;
        }
        Ok(total)
    }

    fn copy_from<R: Read>(&self, source: &mut R) -> Result<usize, ConnectionError> {
        let mut total = 0;
        loop {
            let mut chunk = BytesMut::zeroed(TRANSFER_CHUNK);
            let read = match source.read(&mut chunk) {
                Ok(0) => return Ok(total),
                Ok(read) => read,
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(map_io_error(TRANSFER, error)),
            };
            chunk.truncate(read);
            total += self.write(chunk.freeze())?;
        }
    }

    /// 从读队列取出恰好 `len` 字节写入 `sink`；字节不足时返回 `Underflow` 且不消费。
    pub fn transfer_to<W: Write>(&self, sink: &mut W, len: usize) -> Result<usize, ConnectionError> {
        let segments = self.read_segments_by_length(len)?;
        for segment in &segments {
            sink.write_all(segment)
                .map_err(|err| map_io_error(TRANSFER, err))?;
        }
        Ok(len)
    }

    // ---- 生命周期 ----

    /// 更换 Handler；能力集与执行方式重新探测。读队列中已有数据时立即投递一次数据回调。
    pub fn set_handler(&self, handler: Arc<dyn Handler>) {
        let bound = BoundHandler::bind(handler);
        let wants_data = bound.supports(CallbackKind::Data);
        *self.inner.handler.write() = bound;
        if wants_data && self.available() > 0 && !self.state().is_terminal() {
            self.inner.dispatch(callbacks::Callback::Data);
        }
    }

    /// 把连接恢复到刚建立时的参数：清空未读字节与读标记、恢复默认配置、清除附件、
    /// 恢复接收并为超时续期。待发送字节保留。连接未打开时返回 `false`。
    pub fn reset(&self) -> bool {
        self.inner.reset()
    }

    /// 关闭连接（幂等，可在任意线程调用）。
    ///
    /// 仍有待发送字节时进入 `Closing`，由 Dispatcher 排空后完成关闭；本方法不等待。
    pub fn close(&self) {
        self.inner.close();
    }

    /// 注册关闭钩子；连接已终止时立即在调用线程执行。
    pub(crate) fn on_close<F>(&self, hook: F)
    where
        F: FnOnce(ConnectionId) + Send + 'static,
    {
        self.inner.on_close(hook);
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("remote", &self.inner.remote_addr)
            .finish()
    }
}
