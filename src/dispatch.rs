//! Message dispatcher: call correlation and inbound request handling.
//!
//! The dispatcher owns the call-id map. Outbound calls register a
//! completion slot keyed by call-id; inbound responses and faults
//! complete them, stream auxiliary messages are delivered to long-lived
//! registered operations, and inbound requests are run on bounded
//! spawned handler tasks. A response or aux message for an unknown
//! call-id is always a protocol violation, never silently dropped.
//!
//! Handler failures are isolated: errors and panics become fault
//! responses for the originating call and never tear down the channel.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};

use crate::error::{Result, RpcError};
use crate::pipeline::TxHandle;
use crate::protocol::{fault_from_error, Message, StreamMessage, SystemMessage};

/// Boxed future returned by handler implementations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Per-request context handed to the user request handler.
pub struct RequestContext {
    call_id: String,
    cancel: watch::Receiver<bool>,
}

impl RequestContext {
    /// Call-id of the request being handled.
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Whether the remote caller has canceled this request.
    pub fn is_canceled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Wait until the remote caller cancels this request.
    ///
    /// Pends forever if cancellation never arrives; intended for use in
    /// `select!` against the actual work.
    pub async fn canceled(&mut self) {
        while !*self.cancel.borrow_and_update() {
            if self.cancel.changed().await.is_err() {
                // Cancellation source dropped; request can't be canceled
                // anymore.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// User-supplied handler for inbound requests and one-way messages.
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle a request; the returned bytes become the response body.
    fn handle_request(&self, body: Bytes, ctx: RequestContext) -> BoxFuture<'static, Result<Bytes>>;

    /// Handle a fire-and-forget message. Failures are observed and
    /// logged, never reported to the peer.
    fn handle_one_way(&self, body: Bytes) -> BoxFuture<'static, Result<()>> {
        let _ = body;
        Box::pin(async { Ok(()) })
    }
}

/// Event delivered to a registered long-lived stream operation.
#[derive(Debug)]
pub enum StreamEvent {
    /// A stream auxiliary message for this call-id.
    Message(StreamMessage),
    /// The channel faulted; no further events will arrive.
    Terminated(RpcError),
}

enum PendingOp {
    Call(oneshot::Sender<Result<Bytes>>),
    Stream(mpsc::UnboundedSender<StreamEvent>),
}

struct Inner {
    ops: HashMap<String, PendingOp>,
    inbound_cancels: HashMap<String, watch::Sender<bool>>,
    stopped: Option<RpcError>,
}

/// Correlates in-flight operations by call-id and runs inbound handlers.
pub struct Dispatcher {
    inner: Mutex<Inner>,
    outbound: TxHandle,
    handler: Option<Arc<dyn RequestHandler>>,
    handler_permits: Arc<Semaphore>,
    next_call_id: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        outbound: TxHandle,
        handler: Option<Arc<dyn RequestHandler>>,
        max_concurrent_handlers: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                ops: HashMap::new(),
                inbound_cancels: HashMap::new(),
                stopped: None,
            }),
            outbound,
            handler,
            handler_permits: Arc::new(Semaphore::new(max_concurrent_handlers)),
            next_call_id: AtomicU64::new(1),
        })
    }

    /// Generate a call-id unique among outstanding operations on this
    /// channel.
    pub fn next_call_id(&self) -> String {
        let n = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        format!("C{n}")
    }

    /// Register a pending call awaiting a response or fault.
    ///
    /// Fails with the stop fault once the dispatcher has been stopped.
    pub fn register_call(&self, call_id: &str) -> Result<oneshot::Receiver<Result<Bytes>>> {
        let mut inner = self.lock();
        if let Some(fault) = &inner.stopped {
            return Err(fault.clone());
        }
        if inner.ops.contains_key(call_id) {
            return Err(RpcError::ProtocolViolation(format!(
                "duplicate call-id {call_id}"
            )));
        }
        let (tx, rx) = oneshot::channel();
        inner.ops.insert(call_id.to_string(), PendingOp::Call(tx));
        Ok(rx)
    }

    /// Register a long-lived stream operation; auxiliary messages for
    /// the call-id are delivered until it is unregistered.
    pub fn register_stream(&self, call_id: &str) -> Result<mpsc::UnboundedReceiver<StreamEvent>> {
        let mut inner = self.lock();
        if let Some(fault) = &inner.stopped {
            return Err(fault.clone());
        }
        if inner.ops.contains_key(call_id) {
            return Err(RpcError::ProtocolViolation(format!(
                "duplicate call-id {call_id}"
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner
            .ops
            .insert(call_id.to_string(), PendingOp::Stream(tx));
        Ok(rx)
    }

    /// Remove an operation without completing it.
    pub fn unregister(&self, call_id: &str) {
        self.lock().ops.remove(call_id);
    }

    /// Number of outstanding operations (diagnostics).
    pub fn outstanding(&self) -> usize {
        self.lock().ops.len()
    }

    /// Route one inbound message.
    ///
    /// Returned errors are protocol violations that must fault the
    /// channel.
    pub fn process_message(self: &Arc<Self>, message: Message) -> Result<()> {
        match message {
            Message::Response { call_id, body } => self.complete_call(&call_id, Ok(body)),
            Message::Fault {
                call_id,
                code,
                text,
                detail,
            } => self.complete_call(
                &call_id,
                Err(RpcError::RequestFault {
                    code,
                    text,
                    detail: detail.map(|d| d.to_vec()),
                }),
            ),
            Message::Stream(aux) => self.deliver_stream(aux),
            Message::Request {
                call_id,
                cancellable,
                body,
            } => {
                self.spawn_request(call_id, cancellable, body);
                Ok(())
            }
            Message::OneWay { body } => {
                self.spawn_one_way(body);
                Ok(())
            }
            Message::System(SystemMessage::CancelRequest { call_id }) => {
                self.cancel_inbound(&call_id);
                Ok(())
            }
            Message::System(other) => Err(RpcError::ProtocolViolation(format!(
                "unexpected system message {other:?} routed to dispatcher"
            ))),
        }
    }

    /// Stop the dispatcher, terminating every outstanding operation with
    /// `fault`. Idempotent; only the first fault is used.
    pub fn stop(&self, fault: RpcError) {
        let (ops, cancels) = {
            let mut inner = self.lock();
            if inner.stopped.is_some() {
                return;
            }
            inner.stopped = Some(fault.clone());
            (
                std::mem::take(&mut inner.ops),
                std::mem::take(&mut inner.inbound_cancels),
            )
        };

        // Terminate outside the lock; completions can run user code.
        for (call_id, op) in ops {
            tracing::debug!(call_id, "terminating pending operation: {fault}");
            match op {
                PendingOp::Call(tx) => {
                    let _ = tx.send(Err(fault.clone()));
                }
                PendingOp::Stream(tx) => {
                    let _ = tx.send(StreamEvent::Terminated(fault.clone()));
                }
            }
        }
        for (_, cancel) in cancels {
            let _ = cancel.send(true);
        }
    }

    /// Whether the dispatcher has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.lock().stopped.is_some()
    }

    fn complete_call(&self, call_id: &str, result: Result<Bytes>) -> Result<()> {
        let op = self.lock().ops.remove(call_id);
        match op {
            Some(PendingOp::Call(tx)) => {
                // Receiver may have given up; that is not an error.
                let _ = tx.send(result);
                Ok(())
            }
            Some(op @ PendingOp::Stream(_)) => {
                // Put it back; a response for a stream op is a peer bug.
                self.lock().ops.insert(call_id.to_string(), op);
                Err(RpcError::ProtocolViolation(format!(
                    "response for stream operation {call_id}"
                )))
            }
            None => Err(RpcError::ProtocolViolation(format!(
                "response for unknown call-id {call_id}"
            ))),
        }
    }

    fn deliver_stream(&self, aux: StreamMessage) -> Result<()> {
        let call_id = aux.call_id().to_string();
        let inner = self.lock();
        match inner.ops.get(&call_id) {
            Some(PendingOp::Stream(tx)) => {
                let _ = tx.send(StreamEvent::Message(aux));
                Ok(())
            }
            Some(PendingOp::Call(_)) => Err(RpcError::ProtocolViolation(format!(
                "stream message for plain call {call_id}"
            ))),
            None => Err(RpcError::ProtocolViolation(format!(
                "stream message for unknown call-id {call_id}"
            ))),
        }
    }

    /// Signal cancellation to a running inbound request handler.
    fn cancel_inbound(&self, call_id: &str) {
        let cancel = self.lock().inbound_cancels.remove(call_id);
        if let Some(cancel) = cancel {
            tracing::debug!(call_id, "peer canceled inbound request");
            let _ = cancel.send(true);
        }
    }

    fn spawn_request(self: &Arc<Self>, call_id: String, cancellable: bool, body: Bytes) {
        let Some(handler) = self.handler.clone() else {
            tracing::warn!(call_id, "request received but no handler is registered");
            self.respond_fault(
                call_id,
                RpcError::RequestCrash("no request handler registered".to_string()),
            );
            return;
        };

        let permit = match self.handler_permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(call_id, "handler capacity reached, rejecting request");
                self.respond_fault(call_id, RpcError::Overloaded);
                return;
            }
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        if cancellable {
            self.lock()
                .inbound_cancels
                .insert(call_id.clone(), cancel_tx);
        }
        let ctx = RequestContext {
            call_id: call_id.clone(),
            cancel: cancel_rx,
        };

        let outbound = self.outbound.clone();
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let _permit = permit;

            // Run the handler on its own task so a panic is contained at
            // the join boundary instead of unwinding the dispatcher.
            let outcome = tokio::spawn(handler.handle_request(body, ctx)).await;

            dispatcher.lock().inbound_cancels.remove(&call_id);

            let response = match outcome {
                Ok(Ok(body)) => Message::Response { call_id, body },
                Ok(Err(e)) => {
                    tracing::debug!("request handler failed: {e}");
                    fault_from_error(call_id, &e)
                }
                Err(join_error) => {
                    tracing::error!("request handler crashed: {join_error}");
                    fault_from_error(call_id, &RpcError::RequestCrash(join_error.to_string()))
                }
            };

            if let Err(e) = outbound.send(&response).await {
                tracing::debug!("failed to send response: {e}");
            }
        });
    }

    fn spawn_one_way(self: &Arc<Self>, body: Bytes) {
        let Some(handler) = self.handler.clone() else {
            tracing::warn!("one-way message received but no handler is registered");
            return;
        };

        let permit = match self.handler_permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!("handler capacity reached, dropping one-way message");
                return;
            }
        };

        tokio::spawn(async move {
            let _permit = permit;
            match tokio::spawn(handler.handle_one_way(body)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("one-way handler failed: {e}"),
                Err(join_error) => tracing::error!("one-way handler crashed: {join_error}"),
            }
        });
    }

    fn respond_fault(&self, call_id: String, error: RpcError) {
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let fault = fault_from_error(call_id, &error);
            if let Err(e) = outbound.send(&fault).await {
                tracing::debug!("failed to send fault response: {e}");
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackSerializer;
    use crate::config::ChannelConfig;
    use crate::pipeline::TxPipeline;
    use crate::protocol::{decode_body, Endianness, MessageParser};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    struct EchoHandler;

    impl RequestHandler for EchoHandler {
        fn handle_request(
            &self,
            body: Bytes,
            _ctx: RequestContext,
        ) -> BoxFuture<'static, Result<Bytes>> {
            Box::pin(async move { Ok(body) })
        }
    }

    struct PanicHandler;

    impl RequestHandler for PanicHandler {
        fn handle_request(
            &self,
            _body: Bytes,
            _ctx: RequestContext,
        ) -> BoxFuture<'static, Result<Bytes>> {
            Box::pin(async { panic!("handler exploded") })
        }
    }

    struct StallHandler;

    impl RequestHandler for StallHandler {
        fn handle_request(
            &self,
            body: Bytes,
            _ctx: RequestContext,
        ) -> BoxFuture<'static, Result<Bytes>> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(body)
            })
        }
    }

    fn setup(
        handler: Option<Arc<dyn RequestHandler>>,
        max_handlers: usize,
    ) -> (Arc<Dispatcher>, TxPipeline, DuplexStream) {
        let (local, remote) = duplex(256 * 1024);
        let (fault_tx, _fault_rx) = mpsc::unbounded_channel();
        let pipeline = TxPipeline::spawn(
            local,
            &ChannelConfig::default(),
            Arc::new(MsgPackSerializer::new()),
            fault_tx,
        );
        let handle = pipeline.handle();
        handle.enable_user_traffic();
        let dispatcher = Dispatcher::new(handle, handler, max_handlers);
        (dispatcher, pipeline, remote)
    }

    async fn read_message(remote: &mut DuplexStream) -> Message {
        let serializer = MsgPackSerializer::new();
        let mut parser = MessageParser::new();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = remote.read(&mut buf).await.unwrap();
            assert!(n > 0);
            let bodies = parser.push(&buf[..n]).unwrap();
            if let Some(body) = bodies.into_iter().next() {
                return decode_body(body, &serializer, Endianness::Big).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_call_ids_are_distinct() {
        let (dispatcher, _pipeline, _remote) = setup(None, 4);
        let a = dispatcher.next_call_id();
        let b = dispatcher.next_call_id();
        assert_ne!(a, b);
        assert!(a.starts_with('C'));
    }

    #[tokio::test]
    async fn test_response_completes_pending_call() {
        let (dispatcher, _pipeline, _remote) = setup(None, 4);
        let call_id = dispatcher.next_call_id();
        let rx = dispatcher.register_call(&call_id).unwrap();

        dispatcher
            .process_message(Message::Response {
                call_id: call_id.clone(),
                body: Bytes::from_static(b"answer"),
            })
            .unwrap();

        let result = rx.await.unwrap();
        assert_eq!(result.unwrap(), Bytes::from_static(b"answer"));
        assert_eq!(dispatcher.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_fault_completes_pending_call_with_error() {
        let (dispatcher, _pipeline, _remote) = setup(None, 4);
        let call_id = dispatcher.next_call_id();
        let rx = dispatcher.register_call(&call_id).unwrap();

        dispatcher
            .process_message(Message::Fault {
                call_id,
                code: "fault".to_string(),
                text: "it broke".to_string(),
                detail: None,
            })
            .unwrap();

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(RpcError::RequestFault { .. })));
    }

    #[tokio::test]
    async fn test_unknown_call_id_is_protocol_violation() {
        let (dispatcher, _pipeline, _remote) = setup(None, 4);

        let result = dispatcher.process_message(Message::Response {
            call_id: "C999".to_string(),
            body: Bytes::new(),
        });
        assert!(matches!(result, Err(RpcError::ProtocolViolation(_))));

        let result = dispatcher.process_message(Message::Stream(StreamMessage::PageAck {
            call_id: "C999".to_string(),
            consumed: 1,
        }));
        assert!(matches!(result, Err(RpcError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_duplicate_call_id_rejected() {
        let (dispatcher, _pipeline, _remote) = setup(None, 4);
        let _rx = dispatcher.register_call("C1").unwrap();
        assert!(matches!(
            dispatcher.register_call("C1"),
            Err(RpcError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_op_survives_delivery() {
        let (dispatcher, _pipeline, _remote) = setup(None, 4);
        let mut rx = dispatcher.register_stream("C5").unwrap();

        for consumed in 1..=3 {
            dispatcher
                .process_message(Message::Stream(StreamMessage::PageAck {
                    call_id: "C5".to_string(),
                    consumed,
                }))
                .unwrap();
        }

        for expected in 1..=3u32 {
            match rx.recv().await.unwrap() {
                StreamEvent::Message(StreamMessage::PageAck { consumed, .. }) => {
                    assert_eq!(consumed, expected)
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(dispatcher.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_stop_terminates_pending_with_first_fault() {
        let (dispatcher, _pipeline, _remote) = setup(None, 4);
        let call_rx = dispatcher.register_call("C1").unwrap();
        let mut stream_rx = dispatcher.register_stream("C2").unwrap();

        dispatcher.stop(RpcError::ConnectionAborted);
        dispatcher.stop(RpcError::LoginTimeout); // ignored, first wins

        assert_eq!(call_rx.await.unwrap(), Err(RpcError::ConnectionAborted));
        match stream_rx.recv().await.unwrap() {
            StreamEvent::Terminated(fault) => assert_eq!(fault, RpcError::ConnectionAborted),
            other => panic!("unexpected event: {other:?}"),
        }

        // Registration after stop fails with the stop fault.
        assert_eq!(
            dispatcher.register_call("C3").unwrap_err(),
            RpcError::ConnectionAborted
        );
    }

    #[tokio::test]
    async fn test_request_dispatched_to_handler() {
        let (dispatcher, _pipeline, mut remote) = setup(Some(Arc::new(EchoHandler)), 4);

        dispatcher
            .process_message(Message::Request {
                call_id: "C1".to_string(),
                cancellable: false,
                body: Bytes::from_static(b"ping"),
            })
            .unwrap();

        let response = read_message(&mut remote).await;
        assert_eq!(
            response,
            Message::Response {
                call_id: "C1".to_string(),
                body: Bytes::from_static(b"ping"),
            }
        );
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_crash_fault() {
        let (dispatcher, _pipeline, mut remote) = setup(Some(Arc::new(PanicHandler)), 4);

        dispatcher
            .process_message(Message::Request {
                call_id: "C1".to_string(),
                cancellable: false,
                body: Bytes::new(),
            })
            .unwrap();

        match read_message(&mut remote).await {
            Message::Fault { call_id, code, .. } => {
                assert_eq!(call_id, "C1");
                assert_eq!(code, "request_crash");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        // Dispatcher is still alive.
        assert!(!dispatcher.is_stopped());
    }

    #[tokio::test]
    async fn test_overload_rejected_with_fault() {
        let (dispatcher, _pipeline, mut remote) = setup(Some(Arc::new(StallHandler)), 1);

        dispatcher
            .process_message(Message::Request {
                call_id: "C1".to_string(),
                cancellable: false,
                body: Bytes::new(),
            })
            .unwrap();
        // Give the first handler a moment to claim the only permit.
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher
            .process_message(Message::Request {
                call_id: "C2".to_string(),
                cancellable: false,
                body: Bytes::new(),
            })
            .unwrap();

        match read_message(&mut remote).await {
            Message::Fault { call_id, code, .. } => {
                assert_eq!(call_id, "C2");
                assert_eq!(code, "overloaded");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_request_signals_handler() {
        struct CancelAware;
        impl RequestHandler for CancelAware {
            fn handle_request(
                &self,
                _body: Bytes,
                mut ctx: RequestContext,
            ) -> BoxFuture<'static, Result<Bytes>> {
                Box::pin(async move {
                    ctx.canceled().await;
                    Err(RpcError::OperationCanceled)
                })
            }
        }

        let (dispatcher, _pipeline, mut remote) = setup(Some(Arc::new(CancelAware)), 4);

        dispatcher
            .process_message(Message::Request {
                call_id: "C1".to_string(),
                cancellable: true,
                body: Bytes::new(),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher
            .process_message(Message::System(SystemMessage::CancelRequest {
                call_id: "C1".to_string(),
            }))
            .unwrap();

        match read_message(&mut remote).await {
            Message::Fault { call_id, code, .. } => {
                assert_eq!(call_id, "C1");
                assert_eq!(code, "canceled");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
