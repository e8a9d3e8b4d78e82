use super::{CallbackKind, Capabilities, ExecutionMode, Handler, HandlerResult};
use crate::{connection::Connection, error::ConnectionError};

type ConnCallback = Box<dyn Fn(&Connection) -> HandlerResult + Send + Sync>;
type ExceptionCallback = Box<dyn Fn(&Connection, &ConnectionError) -> HandlerResult + Send + Sync>;

/// 由闭包拼装的 Handler。
///
/// 能力集由注册了哪些闭包推导：例如只注册 `on_data` 时，空闲超时直接关闭连接。
pub struct FnHandler {
    on_connect: Option<ConnCallback>,
    on_data: Option<ConnCallback>,
    on_disconnect: Option<ConnCallback>,
    on_idle_timeout: Option<ConnCallback>,
    on_connection_timeout: Option<ConnCallback>,
    on_connect_exception: Option<ExceptionCallback>,
    mode: ExecutionMode,
}

impl FnHandler {
    pub fn builder() -> FnHandlerBuilder {
        FnHandlerBuilder {
            handler: FnHandler {
                on_connect: None,
                on_data: None,
                on_disconnect: None,
                on_idle_timeout: None,
                on_connection_timeout: None,
                on_connect_exception: None,
                mode: ExecutionMode::Multithreaded,
            },
        }
    }
}

/// [`FnHandler`] 的构造器。
pub struct FnHandlerBuilder {
    handler: FnHandler,
}

impl FnHandlerBuilder {
    pub fn on_connect<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Connection) -> HandlerResult + Send + Sync + 'static,
    {
        self.handler.on_connect = Some(Box::new(callback));
        self
    }

    pub fn on_data<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Connection) -> HandlerResult + Send + Sync + 'static,
    {
        self.handler.on_data = Some(Box::new(callback));
        self
    }

    pub fn on_disconnect<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Connection) -> HandlerResult + Send + Sync + 'static,
    {
        self.handler.on_disconnect = Some(Box::new(callback));
        self
    }

    pub fn on_idle_timeout<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Connection) -> HandlerResult + Send + Sync + 'static,
    {
        self.handler.on_idle_timeout = Some(Box::new(callback));
        self
    }

    pub fn on_connection_timeout<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Connection) -> HandlerResult + Send + Sync + 'static,
    {
        self.handler.on_connection_timeout = Some(Box::new(callback));
        self
    }

    pub fn on_connect_exception<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Connection, &ConnectionError) -> HandlerResult + Send + Sync + 'static,
    {
        self.handler.on_connect_exception = Some(Box::new(callback));
        self
    }

    /// 所有回调统一使用的执行方式。
    pub fn execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.handler.mode = mode;
        self
    }

    pub fn build(self) -> FnHandler {
        self.handler
    }
}

fn call(callback: &Option<ConnCallback>, connection: &Connection) -> HandlerResult {
    match callback {
        Some(callback) => callback(connection),
        None => Ok(false),
    }
}

impl Handler for FnHandler {
    fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::NONE;
        let slots = [
            (self.on_connect.is_some(), Capabilities::CONNECT),
            (self.on_data.is_some(), Capabilities::DATA),
            (self.on_disconnect.is_some(), Capabilities::DISCONNECT),
            (self.on_idle_timeout.is_some(), Capabilities::IDLE_TIMEOUT),
            (self.on_connection_timeout.is_some(), Capabilities::CONNECTION_TIMEOUT),
            (self.on_connect_exception.is_some(), Capabilities::CONNECT_EXCEPTION),
        ];
        for (present, capability) in slots {
            if present {
                caps |= capability;
            }
        }
        caps
    }

    fn execution_mode(&self, _kind: CallbackKind) -> ExecutionMode {
        self.mode
    }

    fn on_connect(&self, connection: &Connection) -> HandlerResult {
        call(&self.on_connect, connection)
    }

    fn on_data(&self, connection: &Connection) -> HandlerResult {
        call(&self.on_data, connection)
    }

    fn on_disconnect(&self, connection: &Connection) -> HandlerResult {
        call(&self.on_disconnect, connection)
    }

    fn on_idle_timeout(&self, connection: &Connection) -> HandlerResult {
        call(&self.on_idle_timeout, connection)
    }

    fn on_connection_timeout(&self, connection: &Connection) -> HandlerResult {
        call(&self.on_connection_timeout, connection)
    }

    fn on_connect_exception(&self, connection: &Connection, error: &ConnectionError) -> HandlerResult {
        match &self.on_connect_exception {
            Some(callback) => callback(connection, error),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_follow_registered_closures() {
        let handler = FnHandler::builder()
            .on_data(|_| Ok(true))
            .on_disconnect(|_| Ok(true))
            .execution_mode(ExecutionMode::NonThreaded)
            .build();
        let caps = handler.capabilities();
        assert!(caps.supports(CallbackKind::Data));
        assert!(caps.supports(CallbackKind::Disconnect));
        assert!(!caps.supports(CallbackKind::IdleTimeout));
        assert_eq!(handler.execution_mode(CallbackKind::Data), ExecutionMode::NonThreaded);
    }
}
