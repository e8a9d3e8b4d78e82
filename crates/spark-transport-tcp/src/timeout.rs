use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;

use crate::{
    connection::{ConnectionId, inner::ConnectionInner},
    error::{ConnectionError, SPAWN, map_io_error},
};

type Watched = Arc<Mutex<HashMap<ConnectionId, Weak<ConnectionInner>>>>;

/// 周期巡检连接的空闲、连接与建连超时。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 超时检测不做逐字节记账：连接只在收发时刷新 `last_activity`，由单一线程按固定间隔巡检；
/// - 巡检表持有弱引用，连接被释放后条目自然失效，不会延长连接寿命。
///
/// ## 逻辑 (How)
/// - `watch` 把连接加入巡检表（重复加入是幂等的）；
/// - 巡检线程以 `recv_timeout(interval)` 作为节拍，关闭信号到来时立即退出；
/// - 每轮先在锁内复制快照，再在锁外逐个检查，避免回调期间持有巡检表锁；
///   已释放或已终止的连接从表中移除。
///
/// ## 注意事项 (Trade-offs)
/// - 超时精度受巡检间隔限制：实际触发时刻最多晚一个间隔。
pub(crate) struct TimeoutManager {
    watched: Watched,
    stop: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutManager {
    pub(crate) fn start(interval: Duration) -> Result<Self, ConnectionError> {
        let watched: Watched = Arc::new(Mutex::new(HashMap::new()));
        let (stop, signal) = bounded::<()>(1);
        let table = Arc::clone(&watched);
        let thread = thread::Builder::new()
            .name("spark-timeout".to_owned())
            .spawn(move || {
                loop {
                    match signal.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => sweep(&table, Instant::now()),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(|err| map_io_error(SPAWN, err))?;
        Ok(Self {
            watched,
            stop: Mutex::new(Some(stop)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// 开始监视连接。
    pub(crate) fn watch(&self, connection: &Arc<ConnectionInner>) {
        self.watched
            .lock()
            .insert(connection.id, Arc::downgrade(connection));
    }

    /// 当前被监视的连接数。
    pub(crate) fn watched(&self) -> usize {
        self.watched.lock().len()
    }

    pub(crate) fn shutdown(&self) {
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.thread.lock().take()
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
        self.watched.lock().clear();
    }
}

fn sweep(table: &Watched, now: Instant) {
    let snapshot: Vec<(ConnectionId, Weak<ConnectionInner>)> = table
        .lock()
        .iter()
        .map(|(id, weak)| (*id, weak.clone()))
        .collect();

    let mut finished = Vec::new();
    for (id, weak) in snapshot {
        let keep = match weak.upgrade() {
            Some(connection) => connection.check_timeouts(now),
            None => false,
        };
        if !keep {
            finished.push(id);
        }
    }

    if !finished.is_empty() {
        let mut table = table.lock();
        for id in &finished {
            table.remove(id);
        }
        tracing::trace!(removed = finished.len(), remaining = table.len(), "timeout sweep");
    }
}
