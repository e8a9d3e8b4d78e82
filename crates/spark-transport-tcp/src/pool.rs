use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Deserialize;

use crate::{
    blocking::BlockingConnection,
    config::{ConnectionDefaults, serde_millis},
    connection::{ConnectOptions, Connection},
    error::ConnectionError,
    reactor::{Reactor, ReactorCore},
};

/// 连接池参数。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// 每个远端地址最多缓存的空闲连接数。
    pub max_idle_per_endpoint: usize,
    /// 空闲连接的最长缓存时间，超过后在下次取用时被关闭。
    #[serde(rename = "idle_expiry_ms", with = "serde_millis")]
    pub idle_expiry: Duration,
    pub defaults: ConnectionDefaults,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_endpoint: 8,
            idle_expiry: Duration::from_secs(60),
            defaults: ConnectionDefaults::default(),
        }
    }
}

struct IdleEntry {
    connection: Connection,
    since: Instant,
}

struct PoolShared {
    core: Arc<ReactorCore>,
    config: PoolConfig,
    idle: Mutex<HashMap<SocketAddr, Vec<IdleEntry>>>,
    closed: AtomicBool,
}

impl PoolShared {
    /// 归还连接：复位成功且未超出空闲上限时缓存，否则关闭。
    fn release(&self, connection: Connection) {
        if self.closed.load(Ordering::Acquire) || !connection.reset() {
            connection.close();
            return;
        }
        let addr = connection.remote_addr();
        let mut idle = self.idle.lock();
        if idle.get(&addr).map_or(0, Vec::len) >= self.config.max_idle_per_endpoint {
            drop(idle);
            tracing::trace!(connection = %connection.id(), remote = %addr, "idle limit reached; closing");
            connection.close();
            return;
        }
        tracing::trace!(connection = %connection.id(), remote = %addr, "connection returned to pool");
        idle.entry(addr).or_default().push(IdleEntry {
            connection,
            since: Instant::now(),
        });
    }

    /// 取出一条仍然可用的空闲连接；过期或已断开的条目被关闭丢弃。
    fn take_idle(&self, addr: SocketAddr) -> Option<Connection> {
        let mut discarded = Vec::new();
        let found = {
            let mut idle = self.idle.lock();
            let entries = idle.get_mut(&addr)?;
            let mut found = None;
            while let Some(entry) = entries.pop() {
                if entry.since.elapsed() <= self.config.idle_expiry && entry.connection.is_open() {
                    found = Some(entry.connection);
                    break;
                }
                discarded.push(entry.connection);
            }
            if entries.is_empty() {
                idle.remove(&addr);
            }
            found
        };
        for connection in discarded {
            connection.close();
        }
        found
    }
}

/// 客户端连接池：按远端地址缓存空闲的阻塞连接。
///
/// # 教案式说明
/// - **意图 (Why)**：短请求频繁建连的代价高于复用；池只是连接类型之上的一层薄缓存，不参与 I/O。
/// - **逻辑 (How)**：`acquire` 优先取后进先出的空闲连接，否则新建；[`PooledConnection`] 释放时
///   调用 `Connection::reset()` 恢复默认参数再放回池中。
/// - **契约 (What)**：归还时连接已关闭、复位失败或该地址的空闲数已满，则直接关闭；
///   [`destroy`](PooledConnection::destroy) 绕过缓存；池关闭后不再缓存任何连接。
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn new(reactor: &Reactor) -> Self {
        Self::with_config(reactor, PoolConfig::default())
    }

    pub fn with_config(reactor: &Reactor, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                core: Arc::clone(reactor.core()),
                config,
                idle: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// 取得到 `addr` 的连接：复用空闲连接或新建。
    pub fn acquire(&self, addr: SocketAddr) -> Result<PooledConnection, ConnectionError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::InvalidState("connection pool is closed"));
        }
        let connection = match self.shared.take_idle(addr) {
            Some(connection) => {
                tracing::trace!(connection = %connection.id(), remote = %addr, "reusing pooled connection");
                BlockingConnection::wrap(connection)
            }
            None => {
                let options = ConnectOptions::new().with_defaults(self.shared.config.defaults.clone());
                BlockingConnection::open(&self.shared.core, addr, options)?
            }
        };
        Ok(PooledConnection {
            connection: Some(connection),
            pool: Arc::clone(&self.shared),
        })
    }

    /// 全部空闲连接数。
    pub fn idle_count(&self) -> usize {
        self.shared.idle.lock().values().map(Vec::len).sum()
    }

    /// 有空闲连接的远端地址数。
    pub fn endpoint_count(&self) -> usize {
        self.shared.idle.lock().len()
    }

    /// 到 `addr` 的空闲连接数。
    pub fn idle_count_for(&self, addr: SocketAddr) -> usize {
        self.shared.idle.lock().get(&addr).map_or(0, Vec::len)
    }

    /// 关闭池与全部空闲连接；已借出的连接归还时直接关闭。
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let idle = std::mem::take(&mut *self.shared.idle.lock());
        for entry in idle.into_values().flatten() {
            entry.connection.close();
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("idle", &self.idle_count())
            .field("closed", &self.shared.closed.load(Ordering::Acquire))
            .finish()
    }
}

/// 从池中借出的连接；释放时自动归还。
pub struct PooledConnection {
    connection: Option<BlockingConnection>,
    pool: Arc<PoolShared>,
}

impl PooledConnection {
    /// 关闭连接而不归还。
    pub fn destroy(mut self) {
        if let Some(connection) = self.connection.take() {
            let _ = connection.close();
        }
    }
}

impl Deref for PooledConnection {
    type Target = BlockingConnection;

    fn deref(&self) -> &BlockingConnection {
        match self.connection.as_ref() {
            Some(connection) => connection,
            None => unreachable!("pooled connection is only taken on drop or destroy"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection.into_connection());
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.connection)
            .finish()
    }
}
