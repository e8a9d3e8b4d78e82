use std::{fmt, net::SocketAddr, ops::Deref, sync::Arc};

use bytes::Bytes;

use crate::{
    config::FlushMode,
    connection::{ConnectOptions, Connection},
    error::ConnectionError,
    handler::NoopHandler,
    reactor::{Reactor, ReactorCore},
    util::deadline_after,
};

/// 阻塞门面：在应用线程上以同步语义使用连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 客户端脚本式交互（发请求、等应答）不需要 Handler；门面把 `Underflow` 转化为
///   “在调用线程上等待数据到达”，底层仍由 Dispatcher 驱动 I/O；
///
/// ## 逻辑 (How)
/// - 读取：记录通知序号 → 尝试非阻塞读取 → `Underflow` 时等待序号变化，直到读超时；
/// - 写入：默认使用 `Sync` flush 模式，写入返回时字节已交给内核（或在写超时后失败）；
/// - 关闭：发起优雅关闭并等待连接进入终态。
///
/// ## 契约 (What)
/// - 不得在 Dispatcher 线程上调用阻塞读取；
/// - 读超时返回 `Timeout`，连接保持打开，调用方可以重试或关闭；
/// - 通过 `Deref` 可以使用 [`Connection`] 的全部非阻塞方法。
pub struct BlockingConnection {
    connection: Connection,
    close_on_drop: bool,
}

impl BlockingConnection {
    /// 建立连接并等待建连完成。
    pub fn connect(reactor: &Reactor, addr: SocketAddr) -> Result<Self, ConnectionError> {
        Self::connect_with(reactor, addr, ConnectOptions::default())
    }

    pub fn connect_with(
        reactor: &Reactor,
        addr: SocketAddr,
        options: ConnectOptions,
    ) -> Result<Self, ConnectionError> {
        Self::open(reactor.core(), addr, options)
    }

    pub(crate) fn open(
        core: &Arc<ReactorCore>,
        addr: SocketAddr,
        mut options: ConnectOptions,
    ) -> Result<Self, ConnectionError> {
        options.defaults.flush_mode = FlushMode::Sync;
        let connect_timeout = options.defaults.connect_timeout;
        let connection = Connection::open_client(core, addr, Arc::new(NoopHandler), options)?;
        if let Err(error) = connection.wait_connected(connect_timeout) {
            connection.close();
            return Err(error);
        }
        Ok(Self::wrap(connection))
    }

    /// 以阻塞语义包装已有连接。
    pub fn wrap(connection: Connection) -> Self {
        Self {
            connection,
            close_on_drop: true,
        }
    }

    /// 解除包装；返回的连接在门面释放后保持打开。
    pub fn into_connection(mut self) -> Connection {
        self.close_on_drop = false;
        self.connection.clone()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// 重复尝试非阻塞读取，直到成功、出现非 `Underflow` 错误或读超时。
    fn block_on<T, F>(&self, operation: &'static str, mut attempt: F) -> Result<T, ConnectionError>
    where
        F: FnMut(&Connection) -> Result<T, ConnectionError>,
    {
        let notifier = &self.connection.inner().notifier;
        let deadline = deadline_after(self.connection.read_timeout());
        loop {
            let seen = notifier.current();
            match attempt(&self.connection) {
                Err(error) if error.is_underflow() => {}
                other => return other,
            }
            if !notifier.wait_past(seen, deadline) {
                return Err(ConnectionError::timeout(operation));
            }
        }
    }

    pub fn read_bytes_by_length(&self, len: usize) -> Result<Bytes, ConnectionError> {
        self.block_on("read", |c| c.read_bytes_by_length(len))
    }

    pub fn read_bytes_by_delimiter(&self, delimiter: &[u8]) -> Result<Bytes, ConnectionError> {
        self.block_on("read", |c| c.read_bytes_by_delimiter(delimiter))
    }

    pub fn read_bytes_by_delimiter_max(
        &self,
        delimiter: &[u8],
        max_len: usize,
    ) -> Result<Bytes, ConnectionError> {
        self.block_on("read", |c| c.read_bytes_by_delimiter_max(delimiter, max_len))
    }

    pub fn read_string_by_length(&self, len: usize) -> Result<String, ConnectionError> {
        self.block_on("read", |c| c.read_string_by_length(len))
    }

    pub fn read_string_by_delimiter(&self, delimiter: &str) -> Result<String, ConnectionError> {
        self.block_on("read", |c| c.read_string_by_delimiter(delimiter))
    }

    pub fn read_string_by_delimiter_max(
        &self,
        delimiter: &str,
        max_len: usize,
    ) -> Result<String, ConnectionError> {
        self.block_on("read", |c| c.read_string_by_delimiter_max(delimiter, max_len))
    }

    pub fn read_u8(&self) -> Result<u8, ConnectionError> {
        self.block_on("read", Connection::read_u8)
    }

    pub fn read_i16(&self) -> Result<i16, ConnectionError> {
        self.block_on("read", Connection::read_i16)
    }

    pub fn read_i32(&self) -> Result<i32, ConnectionError> {
        self.block_on("read", Connection::read_i32)
    }

    pub fn read_i64(&self) -> Result<i64, ConnectionError> {
        self.block_on("read", Connection::read_i64)
    }

    pub fn read_f64(&self) -> Result<f64, ConnectionError> {
        self.block_on("read", Connection::read_f64)
    }

    /// 等待 `len` 字节到达后写入 `sink`。
    pub fn transfer_to<W: std::io::Write>(
        &self,
        sink: &mut W,
        len: usize,
    ) -> Result<usize, ConnectionError> {
        self.block_on("read", |c| c.transfer_to(sink, len))
    }

    /// 优雅关闭并等待连接终止（待发送字节先排空，最长等待写超时）。
    pub fn close(&self) -> Result<(), ConnectionError> {
        self.connection.close();
        let notifier = &self.connection.inner().notifier;
        let deadline = deadline_after(self.connection.write_timeout());
        loop {
            let seen = notifier.current();
            if self.connection.state().is_terminal() {
                return Ok(());
            }
            if !notifier.wait_past(seen, deadline) {
                let error = ConnectionError::timeout("close");
                self.connection.inner().abort(error.clone());
                return Err(error);
            }
        }
    }
}

impl Deref for BlockingConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for BlockingConnection {
    fn drop(&mut self) {
        if self.close_on_drop {
            self.connection.close();
        }
    }
}

impl fmt::Debug for BlockingConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BlockingConnection")
            .field(&self.connection)
            .finish()
    }
}
