//! 集成测试共享的脚手架：Reactor 构造、日志初始化与轮询等待。
#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use spark_transport_tcp::{
    Connection, ConnectionDefaults, ConnectionError, FaultSink, FnHandler, HandlerFault,
    HandlerResult, Reactor, ReactorConfig,
};
use tracing_subscriber::EnvFilter;

/// 等待异步效果的上限；远大于任何正常路径的耗时。
pub const PATIENCE: Duration = Duration::from_secs(5);

/// 安装测试日志订阅者；重复调用无副作用。
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 小规模 Reactor：两个 Dispatcher、四个工作线程、较短的巡检间隔。
pub fn reactor() -> Reactor {
    reactor_with(Reactor::builder())
}

pub fn reactor_with(builder: spark_transport_tcp::ReactorBuilder) -> Reactor {
    init_tracing();
    builder
        .config(
            ReactorConfig::new()
                .with_dispatchers(2)
                .with_workers(4)
                .with_poll_timeout(Duration::from_millis(50))
                .with_timeout_sweep_interval(Duration::from_millis(20)),
        )
        .build()
        .expect("启动 Reactor")
}

pub fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// 客户端默认参数：读写超时固定为 [`PATIENCE`]，避免测试无限挂起。
pub fn client_defaults() -> ConnectionDefaults {
    ConnectionDefaults::new()
        .with_read_timeout(Some(PATIENCE))
        .with_write_timeout(Some(PATIENCE))
}

/// 轮询直到谓词成立或超时；返回谓词最终是否成立。
pub fn wait_until<F>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// 读出全部完整行并原样回写（含 `\r\n`）。
pub fn echo_lines(connection: &Connection) -> HandlerResult {
    loop {
        match connection.read_bytes_by_delimiter(b"\r\n") {
            Ok(line) => {
                connection.write(line)?;
                connection.write_bytes(b"\r\n")?;
            }
            Err(error) if error.is_underflow() => return Ok(true),
            Err(error) => return Err(error.into()),
        }
    }
}

/// 按行回显的 Handler。
pub fn line_echo_handler() -> FnHandler {
    FnHandler::builder().on_data(echo_lines).build()
}

/// 记录全部故障的出口。
#[derive(Default)]
pub struct RecordingSink {
    faults: Mutex<Vec<HandlerFault>>,
}

impl RecordingSink {
    pub fn faults(&self) -> Vec<HandlerFault> {
        self.faults.lock().clone()
    }
}

impl FaultSink for RecordingSink {
    fn report(&self, fault: &HandlerFault) {
        self.faults.lock().push(fault.clone());
    }
}

/// 构造带记录型故障出口的 Reactor。
pub fn reactor_with_sink() -> (Reactor, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let reactor = reactor_with(Reactor::builder().fault_sink(sink.clone()));
    (reactor, sink)
}

/// 断言错误为 `ClosedChannel`。
pub fn assert_closed<T: std::fmt::Debug>(result: Result<T, ConnectionError>) {
    match result {
        Err(ConnectionError::ClosedChannel) => {}
        other => panic!("期望 ClosedChannel，实际为 {other:?}"),
    }
}
