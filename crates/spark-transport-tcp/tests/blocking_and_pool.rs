//! 阻塞门面与连接池。
//!
//! - **Why**：阻塞门面把 `Underflow` 转成调用线程上的等待，连接池在其上做薄缓存，二者都不参与 I/O；
//! - **How**：服务端以原样回显或计数 Handler 运行，客户端通过门面与池读写；
//! - **What**：读超时返回 `Timeout` 且连接保持打开；关闭等待待发字节排空；
//!   池按地址复用同一连接，归还时复位参数，遵守空闲上限与过期时间。

mod support;

use std::{
    io::Cursor,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use spark_transport_tcp::{
    BlockingConnection, ConnectOptions, ConnectionError, ConnectionPool, FlushMode, FnHandler,
    NoopHandler, PoolConfig, Reactor, Server,
};
use support::{PATIENCE, client_defaults, loopback, reactor, wait_until};

fn raw_echo_server(reactor: &Reactor) -> Server {
    let handler = FnHandler::builder()
        .on_data(|connection| {
            let data = connection.read_available();
            connection.write(data)?;
            Ok(true)
        })
        .build();
    Server::bind(reactor, loopback(), handler).expect("启动回显服务")
}

fn pool_config() -> PoolConfig {
    PoolConfig {
        defaults: client_defaults(),
        ..PoolConfig::default()
    }
}

#[test]
fn blocking_read_times_out_and_keeps_connection_open() {
    let reactor = reactor();
    let server = Server::bind(&reactor, loopback(), NoopHandler).expect("启动服务");
    let client = BlockingConnection::connect(&reactor, server.local_addr()).expect("连接服务");
    client.set_read_timeout(Some(Duration::from_millis(100)));

    match client.read_u8() {
        Err(ConnectionError::Timeout { operation }) => assert_eq!(operation, "read"),
        other => panic!("期望读超时，实际为 {other:?}"),
    }
    assert!(client.is_open(), "读超时不关闭连接");
    assert_eq!(client.flush_mode(), FlushMode::Sync, "阻塞门面以同步模式写出");
}

#[test]
fn close_waits_for_pending_output() {
    let reactor = reactor();
    let received = Arc::new(AtomicUsize::new(0));
    let handler = {
        let received = Arc::clone(&received);
        FnHandler::builder()
            .on_data(move |connection| {
                received.fetch_add(connection.read_available().len(), Ordering::SeqCst);
                Ok(true)
            })
            .build()
    };
    let server = Server::bind(&reactor, loopback(), handler).expect("启动服务");
    let options = ConnectOptions::new().with_defaults(client_defaults());
    let client = BlockingConnection::connect_with(&reactor, server.local_addr(), options)
        .expect("连接服务");
    client.set_flush_mode(FlushMode::Async);

    let payload = vec![0x5A; 1 << 20];
    client.write_bytes(&payload).expect("异步写入 1 MiB");
    client.close().expect("关闭并等待排空");
    assert!(client.state().is_terminal());
    assert_eq!(client.pending_write_bytes(), 0);
    assert!(
        wait_until(PATIENCE, || received.load(Ordering::SeqCst) == payload.len()),
        "关闭前的全部字节必须送达，实际 {}",
        received.load(Ordering::SeqCst)
    );
}

#[test]
fn transfer_streams_round_trip_through_echo() {
    let reactor = reactor();
    let server = raw_echo_server(&reactor);
    let options = ConnectOptions::new().with_defaults(client_defaults());
    let client = BlockingConnection::connect_with(&reactor, server.local_addr(), options)
        .expect("连接服务");

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let sent = client
        .transfer_from(&mut Cursor::new(payload.clone()))
        .expect("从源读取并写出");
    assert_eq!(sent, payload.len());

    let mut sink = Vec::new();
    let copied = client
        .transfer_to(&mut sink, payload.len())
        .expect("等待回显并写入目标");
    assert_eq!(copied, payload.len());
    assert_eq!(sink, payload);
}

#[test]
fn pool_reuses_released_connection_with_reset_state() {
    let reactor = reactor();
    let server = raw_echo_server(&reactor);
    let pool = ConnectionPool::with_config(&reactor, pool_config());

    let first_id = {
        let connection = pool.acquire(server.local_addr()).expect("新建连接");
        connection.write_str("hi\r\n").expect("发送");
        assert_eq!(
            connection.read_string_by_delimiter("\r\n").expect("读取回显"),
            "hi"
        );
        connection.set_attachment(7u32);
        connection.set_autoflush(false);
        connection.id()
    };
    assert_eq!(pool.idle_count_for(server.local_addr()), 1);

    let connection = pool.acquire(server.local_addr()).expect("复用连接");
    assert_eq!(connection.id(), first_id, "空闲连接应被复用");
    assert_eq!(pool.idle_count(), 0);
    assert!(connection.attachment::<u32>().is_none(), "归还时清除附件");
    assert!(connection.autoflush(), "归还时恢复默认参数");

    connection.destroy();
    assert_eq!(pool.idle_count(), 0, "销毁的连接不回到池中");
}

#[test]
fn pool_caps_idle_connections_per_endpoint() {
    let reactor = reactor();
    let server = Server::bind(&reactor, loopback(), NoopHandler).expect("启动服务");
    let pool = ConnectionPool::with_config(
        &reactor,
        PoolConfig {
            max_idle_per_endpoint: 1,
            ..pool_config()
        },
    );

    let first = pool.acquire(server.local_addr()).expect("第一条连接");
    let second = pool.acquire(server.local_addr()).expect("第二条连接");
    assert_ne!(first.id(), second.id());
    let overflow = second.connection().clone();
    drop(first);
    drop(second);

    assert_eq!(pool.idle_count_for(server.local_addr()), 1);
    assert!(
        wait_until(PATIENCE, || overflow.state().is_terminal()),
        "超出空闲上限的连接被关闭"
    );
}

#[test]
fn expired_idle_connections_are_replaced() {
    let reactor = reactor();
    let server = Server::bind(&reactor, loopback(), NoopHandler).expect("启动服务");
    let pool = ConnectionPool::with_config(
        &reactor,
        PoolConfig {
            idle_expiry: Duration::from_millis(50),
            ..pool_config()
        },
    );

    let stale = pool.acquire(server.local_addr()).expect("新建连接");
    let stale_id = stale.id();
    let stale_handle = stale.connection().clone();
    drop(stale);
    thread::sleep(Duration::from_millis(100));

    let fresh = pool.acquire(server.local_addr()).expect("重新建连");
    assert_ne!(fresh.id(), stale_id, "过期连接不得复用");
    assert!(wait_until(PATIENCE, || stale_handle.state().is_terminal()));
}

#[test]
fn drained_endpoints_leave_no_idle_bookkeeping() {
    let reactor = reactor();
    let servers: Vec<Server> = (0..3)
        .map(|_| Server::bind(&reactor, loopback(), NoopHandler).expect("启动服务"))
        .collect();
    let pool = ConnectionPool::with_config(&reactor, pool_config());

    for server in &servers {
        drop(pool.acquire(server.local_addr()).expect("新建连接"));
    }
    assert_eq!(pool.endpoint_count(), 3);

    let borrowed: Vec<_> = servers
        .iter()
        .map(|server| pool.acquire(server.local_addr()).expect("复用连接"))
        .collect();
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.endpoint_count(), 0, "取空的地址不再占用条目");

    for connection in borrowed {
        connection.destroy();
    }
    assert_eq!(pool.endpoint_count(), 0, "销毁的连接不会重新登记地址");
}

#[test]
fn closed_pool_rejects_acquire() {
    let reactor = reactor();
    let server = Server::bind(&reactor, loopback(), NoopHandler).expect("启动服务");
    let pool = ConnectionPool::with_config(&reactor, pool_config());
    drop(pool.acquire(server.local_addr()).expect("新建连接"));
    assert_eq!(pool.idle_count(), 1);

    pool.close();
    assert_eq!(pool.idle_count(), 0);
    assert!(matches!(
        pool.acquire(server.local_addr()),
        Err(ConnectionError::InvalidState(_))
    ));
}
