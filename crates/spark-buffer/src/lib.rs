#![cfg_attr(not(feature = "std"), no_std)]

//! `spark-buffer` 提供连接两侧的字节段队列。
//!
//! # 模块定位（Why）
//! - 连接在读写两个方向上都需要“按段排队、按字节消费”的容器：
//!   读侧由 Dispatcher 追加、由业务 Handler 做结构化读取；写侧由业务追加、由 Dispatcher 租借后写入套接字。
//! - 把这些纯数据结构从传输层拆出，便于脱离套接字进行属性测试。
//!
//! # 设计概要（How）
//! - `io_queue` 模块实现写侧 [`IoQueue`]：FIFO、字节粒度、支持“租借/提交”两阶段出队；
//! - `read_queue` 模块实现读侧 [`ReadQueue`]：定长/分隔符读取、读标记、回退（unread）；
//! - `write_mark` 模块实现 [`WriteMark`]：写标记存续期间的覆写缓冲；
//! - 所有字节段均为 `bytes::Bytes`，切分与转移都不复制数据。
//!
//! # 并发约定（What）
//! - 队列本身不做任何同步，跨线程共享时由持有者（连接）负责加锁。

extern crate alloc;

pub mod error;
mod io_queue;
mod read_queue;
mod write_mark;

pub use error::QueueError;
pub use io_queue::IoQueue;
pub use read_queue::ReadQueue;
pub use write_mark::WriteMark;
