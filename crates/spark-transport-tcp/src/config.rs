//! 引擎配置：Reactor、连接默认值与服务端。
//!
//! # 设计动机（Why）
//! - 所有进程级参数都挂在显式构造的 [`Reactor`](crate::Reactor) 上，不存在全局可变状态；
//!   测试可以为每个用例构造独立配置。
//! - 配置既能以 builder 风格在代码中拼装，也能从 TOML 文本加载，时长统一以毫秒表示。
//!
//! # 契约说明（What）
//! - 每个结构都实现 `Default`，未出现在 TOML 中的字段取默认值；
//! - `from_toml_str` 在解析后执行取值校验，非法值返回 [`ConfigError::Invalid`]。

use std::{net::SocketAddr, time::Duration};

use serde::Deserialize;

use crate::{charset::Charset, error::ConfigError, options::SocketOptions};

/// 以毫秒整数（反）序列化 `Duration`。
pub(crate) mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub(crate) mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer};

        pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}

/// 写出策略。
///
/// - `Sync`：`flush()` 在调用线程上把字节推入套接字后才返回（受写限速与写超时约束）；
/// - `Async`：`write()` 只负责入队，由 Dispatcher 线程在套接字可写时发送。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    #[default]
    Sync,
    Async,
}

/// Reactor 级参数。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Dispatcher 线程数量。
    pub dispatchers: usize,
    /// Handler 工作线程数量。
    pub workers: usize,
    /// 工作队列容量；队列满时提交方阻塞。
    pub worker_queue_capacity: usize,
    /// 每个 Dispatcher 复用的读缓冲大小。
    pub read_buffer_size: usize,
    /// 单轮 `poll` 的最长等待时间。
    #[serde(with = "serde_millis", rename = "poll_timeout_ms")]
    pub poll_timeout: Duration,
    /// 写限速的释放节拍。
    #[serde(with = "serde_millis", rename = "throttle_tick_ms")]
    pub throttle_tick: Duration,
    /// 超时巡检周期。
    #[serde(with = "serde_millis", rename = "timeout_sweep_interval_ms")]
    pub timeout_sweep_interval: Duration,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(2);
        Self {
            dispatchers: parallelism.clamp(1, 4),
            workers: 16,
            worker_queue_capacity: 1024,
            read_buffer_size: 16 * 1024,
            poll_timeout: Duration::from_millis(500),
            throttle_tick: Duration::from_millis(100),
            timeout_sweep_interval: Duration::from_millis(100),
        }
    }
}

impl ReactorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dispatchers(mut self, dispatchers: usize) -> Self {
        self.dispatchers = dispatchers;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_worker_queue_capacity(mut self, capacity: usize) -> Self {
        self.worker_queue_capacity = capacity;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_throttle_tick(mut self, tick: Duration) -> Self {
        self.throttle_tick = tick;
        self
    }

    pub fn with_timeout_sweep_interval(mut self, interval: Duration) -> Self {
        self.timeout_sweep_interval = interval;
        self
    }

    /// 从 TOML 文本加载。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatchers == 0 {
            return Err(ConfigError::Invalid {
                field: "dispatchers",
                reason: "at least one dispatcher is required",
            });
        }
        if self.worker_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "worker_queue_capacity",
                reason: "must be positive",
            });
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid {
                field: "read_buffer_size",
                reason: "must be positive",
            });
        }
        if self.throttle_tick.is_zero() || self.timeout_sweep_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "throttle_tick_ms",
                reason: "ticks must be positive",
            });
        }
        Ok(())
    }
}

/// 新连接的标量默认值；`Connection::reset` 也会恢复到这些值。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionDefaults {
    pub flush_mode: FlushMode,
    pub autoflush: bool,
    pub charset: Charset,
    #[serde(with = "serde_millis::option", rename = "idle_timeout_ms")]
    pub idle_timeout: Option<Duration>,
    #[serde(with = "serde_millis::option", rename = "connection_timeout_ms")]
    pub connection_timeout: Option<Duration>,
    #[serde(with = "serde_millis::option", rename = "connect_timeout_ms")]
    pub connect_timeout: Option<Duration>,
    /// 阻塞读取的等待上限，`None` 表示无限等待。
    #[serde(with = "serde_millis::option", rename = "read_timeout_ms")]
    pub read_timeout: Option<Duration>,
    /// 同步 flush 与阻塞关闭的等待上限，`None` 表示无限等待。
    #[serde(with = "serde_millis::option", rename = "write_timeout_ms")]
    pub write_timeout: Option<Duration>,
    /// 写出速率上限（字节/秒），`None` 表示不限速。
    pub write_transfer_rate: Option<u64>,
    pub socket: SocketOptions,
}

impl Default for ConnectionDefaults {
    fn default() -> Self {
        Self {
            flush_mode: FlushMode::Sync,
            autoflush: true,
            charset: Charset::Utf8,
            idle_timeout: None,
            connection_timeout: None,
            connect_timeout: None,
            read_timeout: Some(Duration::from_secs(60)),
            write_timeout: Some(Duration::from_secs(60)),
            write_transfer_rate: None,
            socket: SocketOptions::default(),
        }
    }
}

impl ConnectionDefaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    pub fn with_autoflush(mut self, autoflush: bool) -> Self {
        self.autoflush = autoflush;
        self
    }

    pub fn with_charset(mut self, charset: Charset) -> Self {
        self.charset = charset;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_write_transfer_rate(mut self, rate: Option<u64>) -> Self {
        self.write_transfer_rate = rate;
        self
    }

    pub fn with_socket_options(mut self, socket: SocketOptions) -> Self {
        self.socket = socket;
        self
    }

    /// 从 TOML 文本加载。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let defaults: Self = toml::from_str(text)?;
        defaults.validate()?;
        Ok(defaults)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.write_transfer_rate == Some(0) {
            return Err(ConfigError::Invalid {
                field: "write_transfer_rate",
                reason: "use no rate instead of zero",
            });
        }
        Ok(())
    }
}

/// 服务端参数。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// 并发连接上限；超出时新接入的连接被立即关闭。
    pub max_concurrent_connections: Option<usize>,
    pub backlog: i32,
    pub defaults: ConnectionDefaults,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_concurrent_connections: None,
            backlog: 1024,
            defaults: ConnectionDefaults::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            ..Self::default()
        }
    }

    /// 从 TOML 文本加载。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        if config.backlog <= 0 {
            return Err(ConfigError::Invalid {
                field: "backlog",
                reason: "must be positive",
            });
        }
        config.defaults.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reactor_config_reads_millisecond_fields() {
        let config = ReactorConfig::from_toml_str(
            r#"
            dispatchers = 2
            workers = 4
            poll_timeout_ms = 50
            throttle_tick_ms = 20
            "#,
        )
        .expect("合法配置");
        assert_eq!(config.dispatchers, 2);
        assert_eq!(config.workers, 4);
        assert_eq!(config.poll_timeout, Duration::from_millis(50));
        assert_eq!(config.throttle_tick, Duration::from_millis(20));
        assert_eq!(config.read_buffer_size, ReactorConfig::default().read_buffer_size);
    }

    #[test]
    fn zero_dispatchers_rejected() {
        let err = ReactorConfig::from_toml_str("dispatchers = 0").expect_err("必须拒绝");
        assert!(matches!(err, ConfigError::Invalid { field: "dispatchers", .. }));
    }

    #[test]
    fn server_config_nests_connection_defaults() {
        let config = ServerConfig::from_toml_str(
            r#"
            bind = "127.0.0.1:7000"
            max_concurrent_connections = 8

            [defaults]
            flush_mode = "async"
            charset = "iso-8859-1"
            idle_timeout_ms = 1500

            [defaults.socket]
            no_delay = true
            "#,
        )
        .expect("合法配置");
        assert_eq!(config.bind.port(), 7000);
        assert_eq!(config.max_concurrent_connections, Some(8));
        assert_eq!(config.defaults.flush_mode, FlushMode::Async);
        assert_eq!(config.defaults.charset, Charset::Latin1);
        assert_eq!(config.defaults.idle_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.defaults.socket.no_delay, Some(true));
        assert!(config.defaults.autoflush);
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            ConnectionDefaults::from_toml_str("autoflush = \"yes\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
