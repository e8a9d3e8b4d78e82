use std::{
    any::Any,
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use super::{Connection, inner::ConnectionInner};
use crate::{
    error::{ConnectionError, HandlerError},
    fault::HandlerFault,
    handler::{CallbackKind, ExecutionMode},
};

/// 待投递的回调。
#[derive(Clone, Debug)]
pub(crate) enum Callback {
    Connect,
    Data,
    Disconnect,
    IdleTimeout { epoch: u64 },
    ConnectionTimeout { epoch: u64 },
    ConnectException(ConnectionError),
}

impl Callback {
    pub(crate) fn kind(&self) -> CallbackKind {
        match self {
            Callback::Connect => CallbackKind::Connect,
            Callback::Data => CallbackKind::Data,
            Callback::Disconnect => CallbackKind::Disconnect,
            Callback::IdleTimeout { .. } => CallbackKind::IdleTimeout,
            Callback::ConnectionTimeout { .. } => CallbackKind::ConnectionTimeout,
            Callback::ConnectException(_) => CallbackKind::ConnectException,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Callback::Disconnect | Callback::ConnectException(_))
    }
}

/// 每连接的回调串行化队列。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - Handler 可能在工作池的任意线程上执行，但同一连接的回调必须一个接一个发生；
/// - 数据回调在执行期间可能有新数据到达，此时只需要“再回调一次”，不必为每批字节排一个事件。
///
/// ## 逻辑 (How)
/// - `running` 表示已有线程在排空队列；新事件只入队，由该线程在当前回调返回后继续投递；
/// - `data_queued` 实现数据事件合并：队列中已有未投递的数据事件时，新的数据事件被丢弃；
/// - 断开或建连失败入队后 `finished` 置位，之后的事件全部忽略。
///
/// ## 注意事项 (Trade-offs)
/// - 执行方式由“开始排空”的事件决定：若首个事件是就地执行，排空期间后续事件也在同一线程执行。
#[derive(Debug, Default)]
pub(crate) struct CallbackQueue {
    pending: VecDeque<Callback>,
    running: bool,
    data_queued: bool,
    finished: bool,
}

impl CallbackQueue {
    /// 入队；返回 `Some(kind)` 表示调用方需要启动排空。
    fn push(&mut self, callback: Callback) -> Option<CallbackKind> {
        if self.finished {
            return None;
        }
        if matches!(callback, Callback::Data) {
            if self.data_queued {
                return None;
            }
            self.data_queued = true;
        }
        if callback.is_terminal() {
            self.finished = true;
        }
        let kind = callback.kind();
        self.pending.push_back(callback);
        if self.running {
            None
        } else {
            self.running = true;
            Some(kind)
        }
    }

    fn pop(&mut self) -> Option<Callback> {
        match self.pending.pop_front() {
            Some(callback) => {
                if matches!(callback, Callback::Data) {
                    self.data_queued = false;
                }
                Some(callback)
            }
            None => {
                self.running = false;
                None
            }
        }
    }
}

impl ConnectionInner {
    /// 投递回调，保证同一连接上的回调串行执行。
    pub(crate) fn dispatch(self: &Arc<Self>, callback: Callback) {
        let Some(kind) = self.callbacks.lock().push(callback) else {
            return;
        };
        // 读锁不得跨越回调执行，否则回调内的 `set_handler` 会自锁。
        let mode = self.handler.read().mode(kind);
        match mode {
            ExecutionMode::NonThreaded => self.drain_callbacks(),
            ExecutionMode::Multithreaded => {
                let this = Arc::clone(self);
                self.reactor.workers.execute(move || this.drain_callbacks());
            }
        }
    }

    fn drain_callbacks(self: &Arc<Self>) {
        let connection = Connection::from_inner(Arc::clone(self));
        loop {
            let next = self.callbacks.lock().pop();
            let Some(callback) = next else {
                return;
            };
            self.invoke(&connection, callback);
        }
    }

    fn invoke(self: &Arc<Self>, connection: &Connection, callback: Callback) {
        let bound = self.handler.read().clone();
        let kind = callback.kind();

        if !bound.supports(kind) {
            if matches!(
                callback,
                Callback::IdleTimeout { .. } | Callback::ConnectionTimeout { .. }
            ) {
                tracing::debug!(connection = %self.id, callback = %kind, "no timeout handler; closing");
                self.close();
            }
            return;
        }

        let handler = bound.handler();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match &callback {
            Callback::Connect => handler.on_connect(connection),
            Callback::Data => handler.on_data(connection),
            Callback::Disconnect => handler.on_disconnect(connection),
            Callback::IdleTimeout { .. } => handler.on_idle_timeout(connection),
            Callback::ConnectionTimeout { .. } => handler.on_connection_timeout(connection),
            Callback::ConnectException(error) => handler.on_connect_exception(connection, error),
        }));

        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => self.on_handler_error(kind, error),
            Err(payload) => self.report_fault(kind, panic_message(payload.as_ref()), true),
        }

        if let Callback::IdleTimeout { epoch } | Callback::ConnectionTimeout { epoch } = callback
            && self.timer_epoch() == epoch
        {
            tracing::debug!(connection = %self.id, callback = %kind, "timeout not re-armed; closing");
            self.close();
        }
    }

    fn on_handler_error(self: &Arc<Self>, kind: CallbackKind, error: HandlerError) {
        match error {
            HandlerError::Connection(error) if error.is_underflow() && kind == CallbackKind::Data => {
                tracing::trace!(connection = %self.id, "handler waits for more data");
            }
            HandlerError::Connection(error) if error.is_io_kind() => {
                tracing::debug!(connection = %self.id, callback = %kind, error = %error, "handler hit i/o error; closing");
                self.close();
            }
            HandlerError::Io(error) => {
                tracing::debug!(connection = %self.id, callback = %kind, error = %error, "handler hit i/o error; closing");
                self.close();
            }
            HandlerError::Connection(error) => self.report_fault(kind, error.to_string(), false),
            HandlerError::Fault(error) => self.report_fault(kind, error.to_string(), false),
        }
    }

    fn report_fault(self: &Arc<Self>, kind: CallbackKind, message: String, panicked: bool) {
        let fault = HandlerFault {
            connection: self.id,
            callback: kind,
            message,
            panicked,
        };
        self.reactor.fault_sink.report(&fault);
        self.close();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn data_events_are_coalesced_until_popped() {
        let mut queue = CallbackQueue::default();
        assert_eq!(queue.push(Callback::Data), Some(CallbackKind::Data));
        assert_eq!(queue.push(Callback::Data), None);
        assert_eq!(queue.pending.len(), 1, "未投递的数据事件被合并");

        assert!(matches!(queue.pop(), Some(Callback::Data)));
        assert_eq!(queue.push(Callback::Data), None, "排空线程仍在运行");
        assert_eq!(queue.pending.len(), 1, "投递期间到达的数据需要再回调一次");
    }

    #[test]
    fn nothing_is_queued_after_disconnect() {
        let mut queue = CallbackQueue::default();
        queue.push(Callback::Connect);
        queue.push(Callback::Disconnect);
        queue.push(Callback::Data);
        assert!(matches!(queue.pop(), Some(Callback::Connect)));
        assert!(matches!(queue.pop(), Some(Callback::Disconnect)));
        assert!(queue.pop().is_none());
        assert!(!queue.running);
    }

    #[test]
    fn emptied_queue_restarts_draining_on_next_event() {
        let mut queue = CallbackQueue::default();
        assert!(queue.push(Callback::Connect).is_some());
        assert!(queue.pop().is_some());
        assert!(queue.pop().is_none());
        assert_eq!(queue.push(Callback::Data), Some(CallbackKind::Data));
    }

    #[derive(Clone, Debug)]
    enum Step {
        Push(u8),
        Pop,
    }

    fn callback_for(code: u8) -> Callback {
        match code % 6 {
            0 => Callback::Connect,
            1 | 2 => Callback::Data,
            3 => Callback::IdleTimeout { epoch: 0 },
            4 => Callback::ConnectionTimeout { epoch: 0 },
            _ => {
                if (code / 6) % 2 == 0 {
                    Callback::Disconnect
                } else {
                    Callback::ConnectException(ConnectionError::timeout("connect"))
                }
            }
        }
    }

    fn steps() -> impl Strategy<Value = Vec<Step>> {
        let step = prop_oneof![
            3 => any::<u8>().prop_map(Step::Push),
            2 => Just(Step::Pop),
        ];
        prop::collection::vec(step, 0..96)
    }

    proptest! {
        /// 与朴素 FIFO 影子模型对比：合并只丢弃“队列中已有数据事件”时的重复数据事件，
        /// 终止事件之后一律丢弃，只有空闲时的入队才要求调用方启动排空。
        #[test]
        fn prop_queue_matches_fifo_model(steps in steps()) {
            let mut queue = CallbackQueue::default();
            let mut model: VecDeque<CallbackKind> = VecDeque::new();
            let mut running = false;
            let mut finished = false;

            for step in steps {
                match step {
                    Step::Push(code) => {
                        let callback = callback_for(code);
                        let kind = callback.kind();
                        let accepted = !finished
                            && !(kind == CallbackKind::Data && model.contains(&CallbackKind::Data));
                        let expected = if accepted {
                            finished |= callback.is_terminal();
                            model.push_back(kind);
                            if running {
                                None
                            } else {
                                running = true;
                                Some(kind)
                            }
                        } else {
                            None
                        };
                        prop_assert_eq!(queue.push(callback), expected);
                    }
                    Step::Pop => {
                        let expected = model.pop_front();
                        if expected.is_none() {
                            running = false;
                        }
                        prop_assert_eq!(queue.pop().map(|callback| callback.kind()), expected);
                    }
                }
                prop_assert_eq!(queue.running, running);
                prop_assert!(
                    queue.pending.iter().filter(|c| matches!(c, Callback::Data)).count() <= 1,
                    "队列中最多一个待投递的数据事件"
                );
            }
        }
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
