use std::{io, time::Duration};

use mio::net::TcpStream;
use serde::Deserialize;
use socket2::SockRef;

use crate::config::serde_millis;

/// 可读写的套接字选项。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将 `SO_LINGER`、缓冲区大小、`TCP_NODELAY` 等内核选项以强类型暴露，
///   避免调用方直接操作 `socket2` 或平台相关常量；
/// - 读写共用同一枚举：`Connection::option` 返回的值可以原样交给 `set_option`。
///
/// ## 核心逻辑（How）
/// - 写入通过 `socket2::SockRef` 借用 mio 套接字的文件描述符，不转移所有权；
/// - `NoDelay` 直接使用 mio 自带的接口。
///
/// ## 设计取舍与注意事项（Trade-offs）
/// - `SO_LINGER` 在不同平台的精度不同（Linux 取整到秒）；
/// - 内核可能调整缓冲区大小（Linux 会翻倍），读取值不保证等于写入值。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketOption {
    Linger(Option<Duration>),
    RecvBufferSize(usize),
    SendBufferSize(usize),
    NoDelay(bool),
    KeepAlive(bool),
    ReuseAddress(bool),
}

/// 选项名称，用于读取。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketOptionKind {
    Linger,
    RecvBufferSize,
    SendBufferSize,
    NoDelay,
    KeepAlive,
    ReuseAddress,
}

impl SocketOption {
    /// 对应的选项名称。
    pub fn kind(&self) -> SocketOptionKind {
        match self {
            SocketOption::Linger(_) => SocketOptionKind::Linger,
            SocketOption::RecvBufferSize(_) => SocketOptionKind::RecvBufferSize,
            SocketOption::SendBufferSize(_) => SocketOptionKind::SendBufferSize,
            SocketOption::NoDelay(_) => SocketOptionKind::NoDelay,
            SocketOption::KeepAlive(_) => SocketOptionKind::KeepAlive,
            SocketOption::ReuseAddress(_) => SocketOptionKind::ReuseAddress,
        }
    }
}

pub(crate) fn apply(stream: &TcpStream, option: SocketOption) -> io::Result<()> {
    let sock = SockRef::from(stream);
    match option {
        SocketOption::Linger(linger) => sock.set_linger(linger),
        SocketOption::RecvBufferSize(size) => sock.set_recv_buffer_size(size),
        SocketOption::SendBufferSize(size) => sock.set_send_buffer_size(size),
        SocketOption::NoDelay(enabled) => stream.set_nodelay(enabled),
        SocketOption::KeepAlive(enabled) => sock.set_keepalive(enabled),
        SocketOption::ReuseAddress(enabled) => sock.set_reuse_address(enabled),
    }
}

pub(crate) fn read(stream: &TcpStream, kind: SocketOptionKind) -> io::Result<SocketOption> {
    let sock = SockRef::from(stream);
    Ok(match kind {
        SocketOptionKind::Linger => SocketOption::Linger(sock.linger()?),
        SocketOptionKind::RecvBufferSize => SocketOption::RecvBufferSize(sock.recv_buffer_size()?),
        SocketOptionKind::SendBufferSize => SocketOption::SendBufferSize(sock.send_buffer_size()?),
        SocketOptionKind::NoDelay => SocketOption::NoDelay(stream.nodelay()?),
        SocketOptionKind::KeepAlive => SocketOption::KeepAlive(sock.keepalive()?),
        SocketOptionKind::ReuseAddress => SocketOption::ReuseAddress(sock.reuse_address()?),
    })
}

/// 新连接建立时统一落地的套接字选项集合，`None` 表示沿用内核默认。
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    #[serde(with = "serde_millis::option", rename = "linger_ms")]
    pub linger: Option<Duration>,
    pub recv_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
    pub no_delay: Option<bool>,
    pub keep_alive: Option<bool>,
    pub reuse_address: Option<bool>,
}

impl SocketOptions {
    /// 展开为逐项选项。
    pub fn to_options(&self) -> Vec<SocketOption> {
        let mut options = Vec::new();
        if let Some(linger) = self.linger {
            options.push(SocketOption::Linger(Some(linger)));
        }
        if let Some(size) = self.recv_buffer_size {
            options.push(SocketOption::RecvBufferSize(size));
        }
        if let Some(size) = self.send_buffer_size {
            options.push(SocketOption::SendBufferSize(size));
        }
        if let Some(enabled) = self.no_delay {
            options.push(SocketOption::NoDelay(enabled));
        }
        if let Some(enabled) = self.keep_alive {
            options.push(SocketOption::KeepAlive(enabled));
        }
        if let Some(enabled) = self.reuse_address {
            options.push(SocketOption::ReuseAddress(enabled));
        }
        options
    }

    pub(crate) fn apply_all(&self, stream: &TcpStream) -> io::Result<()> {
        for option in self.to_options() {
            apply(stream, option)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_configured_options_are_expanded() {
        let options = SocketOptions {
            no_delay: Some(true),
            linger: Some(Duration::from_secs(1)),
            ..SocketOptions::default()
        };
        let expanded = options.to_options();
        assert_eq!(
            expanded,
            vec![
                SocketOption::Linger(Some(Duration::from_secs(1))),
                SocketOption::NoDelay(true)
            ]
        );
        assert!(SocketOptions::default().to_options().is_empty());
    }

    #[test]
    fn options_round_trip_on_live_socket() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("绑定本地端口");
        let addr = listener.local_addr().expect("读取监听地址");
        let stream = TcpStream::connect(addr).expect("发起非阻塞连接");

        apply(&stream, SocketOption::NoDelay(true)).expect("设置 TCP_NODELAY");
        assert_eq!(
            read(&stream, SocketOptionKind::NoDelay).expect("读取 TCP_NODELAY"),
            SocketOption::NoDelay(true)
        );
        apply(&stream, SocketOption::KeepAlive(true)).expect("设置 SO_KEEPALIVE");
        assert_eq!(
            read(&stream, SocketOptionKind::KeepAlive).expect("读取 SO_KEEPALIVE"),
            SocketOption::KeepAlive(true)
        );
    }
}
