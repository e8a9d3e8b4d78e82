#![doc = r#"
# spark-transport-tcp

## 设计动机（Why）
- **定位**：基于 `mio` 的非阻塞 TCP 连接引擎：少量 Dispatcher 线程复用大量连接，
  同时提供事件驱动（Handler 回调）与同步（阻塞门面）两套连接 API。
- **架构角色**：在 `spark-buffer` 的字节队列之上实现连接状态机、分帧读取、聚合写出、
  流控与超时；服务端接入与客户端建连共用同一个 [`Connection`] 抽象。
- **设计理念**：引擎只搬运与分帧字节，不解释任何应用协议；所有协议语义都落在
  [`Handler`] 中，并保证同一连接上的回调严格串行。

## 核心契约（What）
- **字节顺序**：同一连接的入站字节按套接字到达顺序进入读队列，出站字节按写入顺序发送；
- **回调串行**：无论 [`ExecutionMode`] 如何，同一连接的回调从不并发；
- **错误分类**：`Underflow` 表示“等待更多数据”；I/O 类错误关闭连接并视同断开；
  Handler 故障（panic 或 [`HandlerError::Fault`]）关闭连接并上报 [`FaultSink`]；
- **关闭语义**：`close()` 幂等、可在任意线程调用；进入 `Closed` 后不再发送任何字节，
  断开回调恰好投递一次。

## 实现策略（How）
- **Reactor**：[`Reactor`] 持有 Dispatcher 池、Handler 工作池与超时巡检线程，
  取代进程级全局状态；
- **Dispatcher**：每个线程拥有私有 `mio::Poll` 与连接表，命令经 `crossbeam-channel` 投递、
  以 `mio::Waker` 唤醒；读就绪时读空套接字并投递数据回调，写就绪时以租借/提交方式写出；
- **流控**：写出限速按节拍放行额度；暂停接收时字节留在内核接收缓冲区；
- **阻塞门面**：[`BlockingConnection`] 以通知序号等待数据到达或写队列排空。

## 风险与考量（Trade-offs）
- **NonThreaded Handler**：在 Dispatcher 线程上执行，慢回调会拖住该线程名下全部连接；
- **工作池背压**：工作池队列满时提交方阻塞，Dispatcher 因此暂停读取；
- **超时精度**：超时由周期巡检驱动，触发时刻最多晚一个巡检间隔。
"#]

mod blocking;
mod charset;
mod config;
mod connection;
mod dispatcher;
mod error;
mod executor;
mod fault;
mod handler;
mod options;
mod pool;
mod reactor;
mod server;
mod throttle;
mod timeout;
mod transform;
mod util;

pub use blocking::BlockingConnection;
pub use charset::Charset;
pub use config::{ConnectionDefaults, FlushMode, ReactorConfig, ServerConfig};
pub use connection::{ConnectOptions, Connection, ConnectionId, ConnectionState};
pub use error::{ConfigError, ConnectionError, HandlerError, OperationKind, codes};
pub use fault::{FaultSink, HandlerFault, TracingFaultSink};
pub use handler::{
    CallbackKind, Capabilities, ExecutionMode, FnHandler, FnHandlerBuilder, Handler, HandlerChain,
    HandlerResult, HandlerSource, NoopHandler,
};
pub use options::{SocketOption, SocketOptionKind, SocketOptions};
pub use pool::{ConnectionPool, PoolConfig, PooledConnection};
pub use reactor::{Reactor, ReactorBuilder};
pub use server::{Server, ServerBuilder};
pub use transform::{StreamTransform, TransformFactory};

pub use bytes::Bytes;
