//! 流控：暂停接收与写出限速。
//!
//! - **Why**：暂停接收时字节必须留在内核缓冲区而不是读队列；限速必须按节拍释放写队列；
//! - **How**：服务端在 `on_connect` 中就地暂停接收，客户端持续发送，通过 `available()` 观察读队列；
//!   限速场景测量同步写出的耗时下限；
//! - **What**：暂停期间 `available()` 不增长，恢复后积压字节全部出现；限速写出不早于节拍推算的时间。

mod support;

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use spark_transport_tcp::{
    BlockingConnection, ConnectOptions, Connection, ExecutionMode, FlushMode, FnHandler, Server,
};
use support::{PATIENCE, client_defaults, loopback, reactor, wait_until};

#[test]
fn suspended_connection_stops_queue_growth_until_resumed() {
    let reactor = reactor();
    let slot: Arc<Mutex<Option<Connection>>> = Arc::default();
    let captured = Arc::clone(&slot);
    let handler = FnHandler::builder()
        .on_connect(move |connection| {
            connection.suspend_receiving();
            *captured.lock() = Some(connection.clone());
            Ok(true)
        })
        .execution_mode(ExecutionMode::NonThreaded)
        .build();
    let server = Server::bind(&reactor, loopback(), handler).expect("启动服务");

    let options = ConnectOptions::new().with_defaults(client_defaults());
    let client = BlockingConnection::connect_with(&reactor, server.local_addr(), options)
        .expect("连接服务");
    assert!(
        wait_until(PATIENCE, || slot.lock().is_some()),
        "服务端必须收到建连回调"
    );
    let accepted = slot.lock().clone().expect("已捕获服务端连接");
    assert!(accepted.is_receiving_suspended());

    client.write_bytes(&[7u8; 1000]).expect("发送 1000 字节");
    thread::sleep(Duration::from_millis(200));
    assert_eq!(accepted.available(), 0, "暂停期间字节不得进入读队列");

    accepted.resume_receiving().expect("恢复接收");
    assert!(
        wait_until(PATIENCE, || accepted.available() == 1000),
        "恢复后积压字节必须全部出现，实际 {}",
        accepted.available()
    );

    // 已排队的字节在再次暂停后仍然可读。
    accepted.suspend_receiving();
    assert_eq!(accepted.read_bytes_by_length(1000).expect("读取积压字节").len(), 1000);
}

#[test]
fn write_transfer_rate_paces_output_per_tick() {
    let reactor = reactor();
    let server = Server::bind(&reactor, loopback(), FnHandler::builder().build())
        .expect("启动服务");
    let options = ConnectOptions::new().with_defaults(client_defaults());
    let client = BlockingConnection::connect_with(&reactor, server.local_addr(), options)
        .expect("连接服务");

    // 默认节拍 100ms：10_000 字节/秒即每节拍 1000 字节，3000 字节至少跨越两个节拍。
    client
        .set_write_transfer_rate(Some(10_000))
        .expect("设置限速");
    let started = Instant::now();
    client.write_bytes(&[1u8; 3000]).expect("同步写出");
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(150),
        "限速写出过快：{elapsed:?}"
    );
    assert_eq!(client.pending_write_bytes(), 0, "同步 flush 返回时写队列已排空");

    assert!(
        wait_until(PATIENCE, || {
            server
                .open_connections()
                .first()
                .is_some_and(|connection| connection.available() == 3000)
        }),
        "服务端必须完整收到限速写出的字节"
    );

    client.set_write_transfer_rate(None).expect("取消限速");
    assert_eq!(client.write_transfer_rate(), None);
    assert!(client.set_write_transfer_rate(Some(0)).is_err(), "零速率非法");
}

#[test]
fn async_flush_mode_returns_before_bytes_are_sent() {
    let reactor = reactor();
    let server = Server::bind(&reactor, loopback(), FnHandler::builder().build())
        .expect("启动服务");
    let options = ConnectOptions::new().with_defaults(client_defaults());
    let client = BlockingConnection::connect_with(&reactor, server.local_addr(), options)
        .expect("连接服务");
    // 阻塞门面以同步模式建连；切换到异步后写入只入队并通知 Dispatcher。
    client.set_flush_mode(FlushMode::Async);
    client
        .set_write_transfer_rate(Some(1_000))
        .expect("设置低速限速");

    let started = Instant::now();
    client.write_bytes(&[2u8; 500]).expect("异步写入");
    assert!(
        started.elapsed() < Duration::from_millis(100),
        "异步模式下写入不等待发送完成"
    );
    assert!(
        wait_until(PATIENCE, || client.pending_write_bytes() == 0),
        "Dispatcher 最终排空写队列"
    );
}
