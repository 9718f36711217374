//! Channel lifecycle and coordination.
//!
//! A [`Channel`] is one logical bidirectional connection. Connecting
//! splits the transport, spawns the transmit and receive pipelines,
//! runs the login handshake, and only then enables user traffic and
//! starts routing inbound messages through the dispatcher. A supervisor
//! task owns the pipelines and performs teardown exactly once, driven
//! either by an explicit close or by the first fault reported from any
//! layer. Only the first fault is retained; cascading errors during
//! teardown never replace the root cause.

use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::codec::{MsgPackSerializer, Serializer};
use crate::config::ChannelConfig;
use crate::dispatch::{Dispatcher, RequestHandler};
use crate::error::{Result, RpcError};
use crate::pipeline::{RxPipeline, SendState, TxHandle, TxPipeline};
use crate::protocol::{Message, SystemMessage};
use crate::session::{Authenticator, ClientSession, Credentials, ServerSession};
use crate::stream::{StreamReader, StreamWriter};

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    New,
    Connecting,
    Online,
    Disconnecting,
    Closed,
    Faulted,
}

/// Lifecycle notification delivered to registered event callbacks.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Opening,
    Opened,
    Closing,
    /// Terminal event. `fault` is `None` after a graceful close.
    Closed { fault: Option<RpcError> },
    /// Connect failed; fired instead of `Opened`.
    FailedToOpen { fault: RpcError },
}

/// Lifecycle event callback. Invoked in registration order, outside any
/// channel lock.
pub type EventCallback = Box<dyn Fn(&ChannelEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// Per-channel options supplied at connect time.
pub struct ChannelOptions {
    name: String,
    handler: Option<Arc<dyn RequestHandler>>,
    serializer: Arc<dyn Serializer>,
    callbacks: Vec<EventCallback>,
}

impl ChannelOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler: None,
            serializer: Arc::new(MsgPackSerializer::new()),
            callbacks: Vec::new(),
        }
    }

    /// Handler for inbound requests and one-way messages.
    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Replace the default msgpack serializer.
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Register a lifecycle event callback.
    pub fn on_event(mut self, callback: impl Fn(&ChannelEvent) + Send + Sync + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }
}

struct Shared {
    name: String,
    state: Mutex<ChannelState>,
    fault: Mutex<Option<RpcError>>,
    callbacks: Vec<EventCallback>,
}

impl Shared {
    fn new(name: String, callbacks: Vec<EventCallback>) -> Self {
        Self {
            name,
            state: Mutex::new(ChannelState::New),
            fault: Mutex::new(None),
            callbacks,
        }
    }

    fn state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ChannelState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn fault(&self) -> Option<RpcError> {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// First fault wins; later reports are dropped.
    fn record_fault(&self, fault: RpcError) {
        let mut slot = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(fault);
        }
    }

    fn emit(&self, event: &ChannelEvent) {
        tracing::debug!(channel = %self.name, "event: {event:?}");
        for callback in &self.callbacks {
            callback(event);
        }
    }
}

/// One logical connection to a peer.
///
/// Obtained from [`Channel::connect_client`] or
/// [`Channel::accept_server`]; the returned channel is already online.
pub struct Channel {
    config: ChannelConfig,
    shared: Arc<Shared>,
    tx: TxHandle,
    dispatcher: Arc<Dispatcher>,
    control_tx: mpsc::Sender<()>,
    done_rx: watch::Receiver<bool>,
}

impl Channel {
    /// Connect the client side: spawn pipelines over `transport`, log in
    /// with `credentials`, and enable user traffic.
    pub async fn connect_client<T>(
        transport: T,
        config: ChannelConfig,
        credentials: Credentials,
        options: ChannelOptions,
    ) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut parts = ConnectParts::start(transport, &config, options);

        let session = ClientSession::new(credentials);
        let handshake = session
            .establish(
                &parts.tx_pipeline.handle(),
                &mut parts.inbound_rx,
                config.login_timeout,
            )
            .await;

        match handshake {
            Ok(()) => Ok(parts.go_online(config, Role::Client)),
            Err(e) => Err(parts.fail_connect(e).await),
        }
    }

    /// Accept the server side over an already-established transport:
    /// wait for the client's login, validate it with `authenticator`,
    /// and enable user traffic.
    pub async fn accept_server<T>(
        transport: T,
        config: ChannelConfig,
        authenticator: Arc<dyn Authenticator>,
        options: ChannelOptions,
    ) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut parts = ConnectParts::start(transport, &config, options);

        let session = ServerSession::new(authenticator);
        let handshake = session
            .establish(
                &parts.tx_pipeline.handle(),
                &mut parts.inbound_rx,
                config.login_timeout,
            )
            .await;

        match handshake {
            Ok(username) => {
                tracing::debug!(channel = %parts.shared.name, %username, "session established");
                Ok(parts.go_online(config, Role::Server))
            }
            Err(e) => Err(parts.fail_connect(e).await),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// The retained first fault, if the channel failed.
    pub fn fault(&self) -> Option<RpcError> {
        self.shared.fault()
    }

    /// Issue a request and wait for its response.
    pub async fn call(&self, body: Bytes) -> Result<Bytes> {
        self.start_call(body, false).await?.wait().await
    }

    /// Issue a request, returning a handle that can await the response
    /// or cancel the call.
    pub async fn start_call(&self, body: Bytes, cancellable: bool) -> Result<PendingCall> {
        self.ensure_online()?;

        let call_id = self.dispatcher.next_call_id();
        let response_rx = self.dispatcher.register_call(&call_id)?;
        let send_state = SendState::new();

        let request = Message::Request {
            call_id: call_id.clone(),
            cancellable,
            body,
        };
        if let Err(e) = self
            .tx
            .send_with_state(&request, Some(send_state.clone()))
            .await
        {
            self.dispatcher.unregister(&call_id);
            return Err(e);
        }

        Ok(PendingCall {
            call_id,
            response_rx,
            send_state,
            cancellable,
            tx: self.tx.clone(),
            dispatcher: self.dispatcher.clone(),
        })
    }

    /// Send a fire-and-forget message.
    pub async fn notify(&self, body: Bytes) -> Result<()> {
        self.ensure_online()?;
        self.tx.send(&Message::OneWay { body }).await
    }

    /// Generate a call-id for a stream to be agreed with the peer.
    pub fn next_call_id(&self) -> String {
        self.dispatcher.next_call_id()
    }

    /// Open the writing side of a stream under an agreed call-id.
    pub fn stream_writer(&self, call_id: impl Into<String>) -> Result<StreamWriter> {
        self.ensure_online()?;
        StreamWriter::open(call_id, self.tx.clone(), self.dispatcher.clone(), &self.config)
    }

    /// Open the reading side of a stream under an agreed call-id.
    pub fn stream_reader(&self, call_id: impl Into<String>) -> Result<StreamReader> {
        self.ensure_online()?;
        StreamReader::open(call_id, self.tx.clone(), self.dispatcher.clone())
    }

    /// Close the channel gracefully: logout, stop the dispatcher, drain
    /// and shut down the pipelines. Idempotent; a second close just
    /// waits for the same teardown.
    pub async fn close(&self) {
        let _ = self.control_tx.send(()).await;
        self.closed().await;
    }

    /// Wait until teardown has completed, however it was triggered.
    pub async fn closed(&self) {
        let mut done = self.done_rx.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    fn ensure_online(&self) -> Result<()> {
        match self.shared.state() {
            ChannelState::Online => Ok(()),
            ChannelState::Faulted => Err(self.shared.fault().unwrap_or(RpcError::ChannelClosed)),
            _ => Err(RpcError::ChannelClosed),
        }
    }
}

/// An in-flight request.
pub struct PendingCall {
    call_id: String,
    response_rx: oneshot::Receiver<Result<Bytes>>,
    send_state: SendState,
    cancellable: bool,
    tx: TxHandle,
    dispatcher: Arc<Dispatcher>,
}

impl PendingCall {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Wait for the response, fault, or termination.
    pub async fn wait(self) -> Result<Bytes> {
        match self.response_rx.await {
            Ok(result) => result,
            // Sender dropped without completing: either we canceled the
            // queued send ourselves or the channel tore down.
            Err(_) => {
                if self.send_state.is_canceled() {
                    Err(RpcError::OperationCanceled)
                } else {
                    Err(RpcError::ChannelClosed)
                }
            }
        }
    }

    /// Cancel the call.
    ///
    /// If the request is still queued locally it is withdrawn before
    /// transmission; otherwise an explicit cancel-request is sent so the
    /// remote handler can react (only if the call was started as
    /// cancellable).
    pub async fn cancel(&self) -> Result<()> {
        if self.send_state.cancel() {
            tracing::debug!(call_id = %self.call_id, "canceled queued request before send");
            self.dispatcher.unregister(&self.call_id);
            return Ok(());
        }
        if !self.cancellable {
            return Ok(());
        }
        self.tx
            .send_system(SystemMessage::CancelRequest {
                call_id: self.call_id.clone(),
            })
            .await
    }
}

/// Everything spawned before the handshake outcome is known.
struct ConnectParts {
    shared: Arc<Shared>,
    handler: Option<Arc<dyn RequestHandler>>,
    tx_pipeline: TxPipeline,
    rx_pipeline: RxPipeline,
    inbound_rx: mpsc::UnboundedReceiver<Message>,
    fault_tx: mpsc::UnboundedSender<RpcError>,
    fault_rx: mpsc::UnboundedReceiver<RpcError>,
}

impl ConnectParts {
    fn start<T>(transport: T, config: &ChannelConfig, options: ChannelOptions) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared::new(options.name, options.callbacks));
        shared.set_state(ChannelState::Connecting);
        shared.emit(&ChannelEvent::Opening);

        let (read_half, write_half) = tokio::io::split(transport);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();

        let tx_pipeline =
            TxPipeline::spawn(write_half, config, options.serializer.clone(), fault_tx.clone());
        let rx_pipeline = RxPipeline::spawn(
            read_half,
            config,
            options.serializer,
            inbound_tx,
            fault_tx.clone(),
        );

        Self {
            shared,
            handler: options.handler,
            tx_pipeline,
            rx_pipeline,
            inbound_rx,
            fault_tx,
            fault_rx,
        }
    }

    fn go_online(self, config: ChannelConfig, role: Role) -> Channel {
        let tx = self.tx_pipeline.handle();
        tx.enable_user_traffic();

        let dispatcher = Dispatcher::new(tx.clone(), self.handler, config.max_concurrent_handlers);
        let router = tokio::spawn(route_loop(
            self.inbound_rx,
            dispatcher.clone(),
            self.fault_tx.clone(),
        ));

        self.shared.set_state(ChannelState::Online);
        self.shared.emit(&ChannelEvent::Opened);

        let (control_tx, control_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = watch::channel(false);
        tokio::spawn(
            Supervisor {
                shared: self.shared.clone(),
                role,
                config: config.clone(),
                tx_pipeline: self.tx_pipeline,
                rx_pipeline: self.rx_pipeline,
                dispatcher: dispatcher.clone(),
                router,
                fault_rx: self.fault_rx,
                control_rx,
                done_tx,
            }
            .run(),
        );

        Channel {
            config,
            shared: self.shared,
            tx,
            dispatcher,
            control_tx,
            done_rx,
        }
    }

    async fn fail_connect(mut self, error: RpcError) -> RpcError {
        // A transport fault during the handshake surfaces to the session
        // as a closed inbound queue; the pipeline fault is the root
        // cause.
        let fault = if error == RpcError::ChannelClosed {
            self.fault_rx.try_recv().unwrap_or(error)
        } else {
            error
        };

        self.shared.record_fault(fault.clone());
        // Drain instead of abort: a rejected login still owes the peer
        // its queued response before the transport goes away.
        self.tx_pipeline.close(fault.clone()).await;
        self.rx_pipeline.stop().await;
        self.shared.set_state(ChannelState::Faulted);
        self.shared.emit(&ChannelEvent::FailedToOpen {
            fault: fault.clone(),
        });
        fault
    }
}

/// Routes post-login inbound messages to the dispatcher.
async fn route_loop(
    mut inbound_rx: mpsc::UnboundedReceiver<Message>,
    dispatcher: Arc<Dispatcher>,
    fault_tx: mpsc::UnboundedSender<RpcError>,
) {
    while let Some(message) = inbound_rx.recv().await {
        match message {
            // Traffic itself is the liveness signal; nothing to do.
            Message::System(SystemMessage::Heartbeat) => {}
            // Peer-initiated graceful shutdown. Teardown classifies it
            // as a clean close.
            Message::System(SystemMessage::Logout) => {
                let _ = fault_tx.send(RpcError::ChannelClosed);
                return;
            }
            Message::System(
                m @ (SystemMessage::Login { .. } | SystemMessage::LoginResponse { .. }),
            ) => {
                let _ = fault_tx.send(RpcError::ProtocolViolation(format!(
                    "login message {m:?} while online"
                )));
                return;
            }
            other => {
                if let Err(e) = dispatcher.process_message(other) {
                    let _ = fault_tx.send(e);
                    return;
                }
            }
        }
    }
}

struct Supervisor {
    shared: Arc<Shared>,
    role: Role,
    config: ChannelConfig,
    tx_pipeline: TxPipeline,
    rx_pipeline: RxPipeline,
    dispatcher: Arc<Dispatcher>,
    router: JoinHandle<()>,
    fault_rx: mpsc::UnboundedReceiver<RpcError>,
    control_rx: mpsc::Receiver<()>,
    done_tx: watch::Sender<bool>,
}

impl Supervisor {
    async fn run(mut self) {
        let (fault, graceful) = tokio::select! {
            fault = self.fault_rx.recv() => {
                let fault = fault.unwrap_or(RpcError::ChannelClosed);
                let graceful = fault.is_graceful();
                (fault, graceful)
            }
            _ = self.control_rx.recv() => (RpcError::ChannelClosed, true),
        };
        self.shutdown(fault, graceful).await;
    }

    async fn shutdown(mut self, fault: RpcError, mut graceful: bool) {
        tracing::debug!(
            channel = %self.shared.name,
            %fault,
            graceful,
            "tearing down channel"
        );
        if !fault.is_graceful() {
            self.shared.record_fault(fault.clone());
        }
        self.shared.set_state(ChannelState::Disconnecting);
        self.shared.emit(&ChannelEvent::Closing);

        // The client announces the logout; the server acknowledges by
        // closing its side.
        if graceful && self.role == Role::Client {
            let tx = self.tx_pipeline.handle();
            let logout = tokio::time::timeout(
                self.config.logout_timeout,
                tx.send_system(SystemMessage::Logout),
            )
            .await;
            match logout {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(channel = %self.shared.name, "logout send failed: {e}");
                    graceful = false;
                }
                Err(_) => {
                    tracing::warn!(channel = %self.shared.name, "logout timed out, aborting");
                    graceful = false;
                }
            }
        }

        self.dispatcher.stop(fault.clone());

        if graceful {
            self.tx_pipeline.close(fault.clone()).await;
        } else {
            self.tx_pipeline.abort(fault).await;
        }
        self.rx_pipeline.stop().await;
        // Inbound queue is gone now; the router exits on its own.
        let _ = self.router.await;

        let final_fault = self.shared.fault();
        let state = if final_fault.is_none() {
            ChannelState::Closed
        } else {
            ChannelState::Faulted
        };
        self.shared.set_state(state);
        tracing::info!(channel = %self.shared.name, ?state, "channel closed");
        self.shared.emit(&ChannelEvent::Closed { fault: final_fault });
        let _ = self.done_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{BoxFuture, RequestContext};
    use crate::session::AllowAll;
    use std::time::Duration;
    use tokio::io::duplex;

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

    type EventLog = Arc<Mutex<Vec<String>>>;

    fn recording(log: EventLog) -> impl Fn(&ChannelEvent) + Send + Sync {
        move |event| {
            let name = match event {
                ChannelEvent::Opening => "opening",
                ChannelEvent::Opened => "opened",
                ChannelEvent::Closing => "closing",
                ChannelEvent::Closed { .. } => "closed",
                ChannelEvent::FailedToOpen { .. } => "failed_to_open",
            };
            log.lock().unwrap().push(name.to_string());
        }
    }

    async fn connected_pair(
        client_log: EventLog,
    ) -> (Channel, Channel) {
        let (client_io, server_io) = duplex(1024 * 1024);

        let server = tokio::spawn(Channel::accept_server(
            server_io,
            ChannelConfig::default(),
            Arc::new(AllowAll),
            ChannelOptions::new("server").with_handler(Arc::new(EchoHandler)),
        ));
        let client = Channel::connect_client(
            client_io,
            ChannelConfig::default(),
            Credentials::new("alice", "sesame"),
            ChannelOptions::new("client").on_event(recording(client_log)),
        )
        .await
        .unwrap();
        let server = server.await.unwrap().unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_connect_then_call_round_trip() {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let (client, server) = connected_pair(log.clone()).await;

        assert_eq!(client.state(), ChannelState::Online);
        assert_eq!(server.state(), ChannelState::Online);
        assert_eq!(log.lock().unwrap().as_slice(), ["opening", "opened"]);

        let reply = client.call(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(reply, Bytes::from_static(b"hello"));

        client.close().await;
        server.closed().await;
    }

    #[tokio::test]
    async fn test_login_failure_faults_client() {
        struct RejectAll;
        impl Authenticator for RejectAll {
            fn authenticate(
                &self,
                _credentials: Credentials,
            ) -> BoxFuture<'static, std::result::Result<(), String>> {
                Box::pin(async { Err("bad password".to_string()) })
            }
        }

        let (client_io, server_io) = duplex(1024 * 1024);
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));

        let server = tokio::spawn(Channel::accept_server(
            server_io,
            ChannelConfig::default(),
            Arc::new(RejectAll),
            ChannelOptions::new("server"),
        ));
        let result = Channel::connect_client(
            client_io,
            ChannelConfig::default(),
            Credentials::new("mallory", "guess"),
            ChannelOptions::new("client").on_event(recording(log.clone())),
        )
        .await;

        assert_eq!(result.err(), Some(RpcError::InvalidCredentials));
        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["opening", "failed_to_open"]
        );

        let server_result = server.await.unwrap();
        assert_eq!(server_result.err(), Some(RpcError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_graceful_close_event_ordering() {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let (client, server) = connected_pair(log.clone()).await;

        client.close().await;
        assert_eq!(client.state(), ChannelState::Closed);
        assert_eq!(client.fault(), None);
        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["opening", "opened", "closing", "closed"]
        );

        // Peer logout closes the server side cleanly too.
        server.closed().await;
        assert_eq!(server.state(), ChannelState::Closed);
        assert_eq!(server.fault(), None);

        // Double close is idempotent.
        client.close().await;
        assert_eq!(client.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_mid_call_disconnect_completes_pending_call() {
        struct NeverReplies;
        impl RequestHandler for NeverReplies {
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

        let (client_io, server_io) = duplex(1024 * 1024);
        let server = tokio::spawn(Channel::accept_server(
            server_io,
            ChannelConfig::default(),
            Arc::new(AllowAll),
            ChannelOptions::new("server").with_handler(Arc::new(NeverReplies)),
        ));
        let client = Channel::connect_client(
            client_io,
            ChannelConfig::default(),
            Credentials::new("alice", "sesame"),
            ChannelOptions::new("client"),
        )
        .await
        .unwrap();
        let server = server.await.unwrap().unwrap();

        let pending = client
            .start_call(Bytes::from_static(b"stuck"), false)
            .await
            .unwrap();

        // Server goes away without a logout: the client sees the
        // transport break and the pending call completes with the
        // communication fault instead of hanging.
        server.close().await;
        assert_eq!(pending.wait().await, Err(RpcError::ConnectionAborted));

        client.closed().await;
        assert_eq!(client.state(), ChannelState::Faulted);
        assert_eq!(client.fault(), Some(RpcError::ConnectionAborted));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let (client, server) = connected_pair(log).await;

        client.close().await;
        let result = client.notify(Bytes::from_static(b"late")).await;
        assert_eq!(result, Err(RpcError::ChannelClosed));

        server.closed().await;
    }

    #[tokio::test]
    async fn test_cancel_before_send_resolves_locally() {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let (client, server) = connected_pair(log).await;

        let pending = client
            .start_call(Bytes::from_static(b"maybe"), true)
            .await
            .unwrap();
        // The request may already be on the wire; both outcomes are
        // legal, but a queued-send cancel must resolve the wait.
        if pending.send_state.cancel() {
            client.dispatcher.unregister(pending.call_id());
            assert_eq!(pending.wait().await, Err(RpcError::OperationCanceled));
        }

        client.close().await;
        server.closed().await;
    }
}
