use std::{
    cell::Cell,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Sender, TrySendError, bounded};
use parking_lot::{Mutex, RwLock};

use crate::error::{ConnectionError, SPAWN, map_io_error};

type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static IN_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// 当前线程是否为 Handler 工作线程。
pub(crate) fn in_worker() -> bool {
    IN_WORKER.with(Cell::get)
}

/// 执行多线程模式 Handler 回调的有界工作池。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - Dispatcher 线程只负责 I/O，业务回调默认交给工作池执行，避免慢 Handler 拖住整个 Dispatcher；
/// - 队列有界：池饱和时提交方（通常是 Dispatcher）阻塞，形成对读取侧的天然背压。
///
/// ## 逻辑 (How)
/// - `crossbeam_channel::bounded` 作为任务队列，固定数量线程循环 `recv`；
/// - 工作线程自身提交任务时改用 `try_send`，队列满则就地执行，避免所有工作线程互相等待；
/// - 关闭时取走发送端，线程在队列排空后自然退出；之后的提交直接在调用线程执行。
///
/// ## 契约 (What)
/// - 任务按提交顺序出队，但不同任务之间没有执行顺序保证；每连接的回调顺序由连接自身的串行化器负责；
/// - `shutdown` 幂等，等待所有工作线程退出（调用线程本身是工作线程时跳过对自己的等待）。
pub(crate) struct WorkerPool {
    sender: RwLock<Option<Sender<Job>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn new(workers: usize, capacity: usize) -> Result<Self, ConnectionError> {
        let (sender, receiver) = bounded::<Job>(capacity);
        let mut threads = Vec::with_capacity(workers);
        for index in 0..workers {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("spark-worker-{index}"))
                .spawn(move || {
                    IN_WORKER.with(|flag| flag.set(true));
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })
                .map_err(|err| map_io_error(SPAWN, err))?;
            threads.push(handle);
        }
        tracing::debug!(workers, capacity, "worker pool started");
        Ok(Self {
            sender: RwLock::new(Some(sender)),
            threads: Mutex::new(threads),
        })
    }

    /// 提交任务；池已关闭或没有工作线程时在调用线程上执行。
    pub(crate) fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(job);
        let rejected = {
            let guard = self.sender.read();
            match guard.as_ref() {
                Some(sender) if !self.threads.lock().is_empty() => {
                    if in_worker() {
                        match sender.try_send(job) {
                            Ok(()) => None,
                            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                                Some(job)
                            }
                        }
                    } else {
                        sender.send(job).err().map(|err| err.into_inner())
                    }
                }
                _ => Some(job),
            }
        };
        if let Some(job) = rejected {
            job();
        }
    }

    /// 停止接收新任务并等待线程退出。
    pub(crate) fn shutdown(&self) {
        let sender = self.sender.write().take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        let threads = std::mem::take(&mut *self.threads.lock());
        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        tracing::debug!("worker pool stopped");
    }
}
