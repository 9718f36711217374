//! Transmit pipeline.
//!
//! Architecture:
//!
//! ```text
//! callers ──► TxHandle ──► system queue ─┐
//!                     └──► user queue  ──┼─► chunk writer ─► segment queue ─► feed loop ─► transport
//!                                        │      (task)                          (task)
//!                            keep-alive ─┘
//! ```
//!
//! A single chunk-writer task serializes queued messages into pooled
//! segments, so framing is strictly sequential. The system queue is
//! drained with priority over the user queue, and user traffic is held
//! behind a gate until the session coordinator enables it, so login,
//! logout and heartbeats are never starved by backlogged user sends.
//! An independent feed loop drains sealed segments to the transport and
//! credits the byte gate back.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::throttle::TxThrottle;
use crate::buffer::SegmentPool;
use crate::codec::Serializer;
use crate::config::ChannelConfig;
use crate::error::{Result, RpcError};
use crate::protocol::{
    encode_body, ChunkHeader, Endianness, Message, SystemMessage, CHUNK_HEADER_SIZE,
    MAX_CHUNK_PAYLOAD,
};
use crate::transport::translate_io_error;

/// Capacity of the system-priority queue.
const SYSTEM_QUEUE_CAPACITY: usize = 64;

/// Capacity of the user message queue.
const USER_QUEUE_CAPACITY: usize = 256;

/// Capacity of the sealed-segment queue feeding the transport.
const FEED_QUEUE_CAPACITY: usize = 32;

/// Maximum messages serialized before the current segment is sealed.
const MAX_BATCH_SIZE: usize = 32;

const SEND_PENDING: u8 = 0;
const SEND_SENT: u8 = 1;
const SEND_CANCELED: u8 = 2;

/// Shared cell tracking whether a queued message reached the wire.
///
/// A caller canceling a pending call races the chunk writer for this
/// cell: whoever flips it first decides whether the message is dropped
/// from the queue or must be canceled remotely.
#[derive(Debug, Clone)]
pub struct SendState(Arc<AtomicU8>);

impl SendState {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(SEND_PENDING)))
    }

    /// Flip to canceled if the message has not been serialized yet.
    ///
    /// Returns `true` if the cancellation won; `false` means the message
    /// already went out and the remote side must be told.
    pub fn cancel(&self) -> bool {
        self.0
            .compare_exchange(
                SEND_PENDING,
                SEND_CANCELED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn mark_sent(&self) -> bool {
        self.0
            .compare_exchange(SEND_PENDING, SEND_SENT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_sent(&self) -> bool {
        self.0.load(Ordering::Acquire) == SEND_SENT
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire) == SEND_CANCELED
    }
}

impl Default for SendState {
    fn default() -> Self {
        Self::new()
    }
}

/// Pipeline lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxPhase {
    Running,
    /// Graceful close: flush queued system items, cancel user items.
    Draining,
    /// Hard abort: discard everything.
    Aborted,
}

/// A message body queued for serialization.
struct TxItem {
    body: Bytes,
    state: Option<SendState>,
    /// Whether the body bytes were charged to the byte gate.
    charged: bool,
}

/// A sealed buffer segment on its way to the transport.
struct TxSegment {
    data: BytesMut,
    /// Charged payload bytes in this segment, credited back after send.
    content: usize,
}

/// Cloneable sending handle for a transmit pipeline.
#[derive(Clone)]
pub struct TxHandle {
    system_tx: mpsc::Sender<TxItem>,
    user_tx: mpsc::Sender<TxItem>,
    user_gate: Arc<watch::Sender<bool>>,
    throttle: TxThrottle,
    closed: Arc<AtomicBool>,
    fault: Arc<Mutex<Option<RpcError>>>,
    serializer: Arc<dyn Serializer>,
    endianness: Endianness,
}

impl TxHandle {
    /// Queue a user message for transmission.
    ///
    /// Waits for transmit buffer room; fails with the channel fault once
    /// the pipeline is closed.
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.send_with_state(message, None).await
    }

    /// Queue a user message carrying a cancellation cell.
    pub async fn send_with_state(
        &self,
        message: &Message,
        state: Option<SendState>,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.current_fault());
        }

        let body = encode_body(message, self.serializer.as_ref(), self.endianness)?;
        let len = body.len();
        self.throttle.reserve(len).await?;

        let item = TxItem {
            body,
            state,
            charged: true,
        };
        self.user_tx.send(item).await.map_err(|_| {
            self.throttle.release(len);
            self.current_fault()
        })
    }

    /// Queue a system message onto the priority queue.
    ///
    /// System traffic bypasses the byte gate and the user-traffic gate.
    pub async fn send_system(&self, message: SystemMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.current_fault());
        }

        let body = encode_body(
            &Message::System(message),
            self.serializer.as_ref(),
            self.endianness,
        )?;
        self.system_tx
            .send(TxItem {
                body,
                state: None,
                charged: false,
            })
            .await
            .map_err(|_| self.current_fault())
    }

    /// Best-effort system send; silently drops if the queue is full or
    /// the pipeline is closing.
    pub fn try_send_system(&self, message: SystemMessage) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let Ok(body) = encode_body(
            &Message::System(message),
            self.serializer.as_ref(),
            self.endianness,
        ) else {
            return;
        };
        let _ = self.system_tx.try_send(TxItem {
            body,
            state: None,
            charged: false,
        });
    }

    /// Open the gate holding back queued user messages.
    ///
    /// Called by the session coordinator once login completes.
    pub fn enable_user_traffic(&self) {
        let _ = self.user_gate.send(true);
    }

    /// Whether the pipeline still accepts sends.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current queued-but-unsent byte volume.
    pub fn queued_bytes(&self) -> usize {
        self.throttle.queued()
    }

    fn current_fault(&self) -> RpcError {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or(RpcError::ChannelClosed)
    }

    fn set_fault(&self, fault: RpcError) {
        let mut slot = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(fault);
        }
    }
}

/// A running transmit pipeline owning its tasks.
pub struct TxPipeline {
    handle: TxHandle,
    phase_tx: watch::Sender<TxPhase>,
    writer_task: Option<JoinHandle<()>>,
    feed_task: Option<JoinHandle<()>>,
    keepalive_task: Option<JoinHandle<()>>,
}

impl TxPipeline {
    /// Spawn the chunk writer, transport feed, and optional keep-alive
    /// tasks over the given write half.
    ///
    /// Transport failures are reported through `fault_tx` and end the
    /// feed loop.
    pub fn spawn<W>(
        write_half: W,
        config: &ChannelConfig,
        serializer: Arc<dyn Serializer>,
        fault_tx: mpsc::UnboundedSender<RpcError>,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (system_tx, system_rx) = mpsc::channel(SYSTEM_QUEUE_CAPACITY);
        let (user_tx, user_rx) = mpsc::channel(USER_QUEUE_CAPACITY);
        let (feed_tx, feed_rx) = mpsc::channel(FEED_QUEUE_CAPACITY);
        let (user_gate, user_gate_rx) = watch::channel(false);
        let (phase_tx, phase_rx) = watch::channel(TxPhase::Running);

        let throttle = TxThrottle::new(config.max_queued_bytes, config.send_timeout);
        let pool = Arc::new(SegmentPool::new(config.tx_segment_size));
        let last_activity = Arc::new(Mutex::new(Instant::now()));

        let handle = TxHandle {
            system_tx,
            user_tx,
            user_gate: Arc::new(user_gate),
            throttle: throttle.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            fault: Arc::new(Mutex::new(None)),
            serializer,
            endianness: config.endianness,
        };

        let writer_task = tokio::spawn(chunk_writer_loop(
            system_rx,
            user_rx,
            user_gate_rx,
            phase_rx.clone(),
            feed_tx,
            pool.clone(),
            throttle.clone(),
            config.endianness,
        ));

        let feed_task = tokio::spawn(transport_feed_loop(
            write_half,
            feed_rx,
            phase_rx.clone(),
            pool,
            throttle,
            config.shutdown_timeout,
            fault_tx,
            last_activity.clone(),
        ));

        let keepalive_task = config.heartbeat_period.map(|period| {
            tokio::spawn(keepalive_loop(
                period,
                handle.clone(),
                phase_rx,
                last_activity,
            ))
        });

        Self {
            handle,
            phase_tx,
            writer_task: Some(writer_task),
            feed_task: Some(feed_task),
            keepalive_task,
        }
    }

    /// Cloneable sending handle.
    pub fn handle(&self) -> TxHandle {
        self.handle.clone()
    }

    /// Graceful close: stop accepting sends, flush queued system items,
    /// cancel queued user items with `fault`, drain sealed segments to
    /// the transport and shut it down.
    pub async fn close(&mut self, fault: RpcError) {
        self.handle.set_fault(fault);
        self.handle.closed.store(true, Ordering::Release);
        let _ = self.phase_tx.send(TxPhase::Draining);
        self.join_tasks().await;
    }

    /// Hard abort: discard queued and sealed data without transmitting.
    pub async fn abort(&mut self, fault: RpcError) {
        self.handle.set_fault(fault);
        self.handle.closed.store(true, Ordering::Release);
        let _ = self.phase_tx.send(TxPhase::Aborted);
        self.join_tasks().await;
    }

    async fn join_tasks(&mut self) {
        if let Some(task) = self.keepalive_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.writer_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.feed_task.take() {
            let _ = task.await;
        }
    }
}

/// Serializes queued message bodies into pooled segments.
struct SegmentWriter {
    pool: Arc<SegmentPool>,
    feed_tx: mpsc::Sender<TxSegment>,
    current: Option<TxSegment>,
    endianness: Endianness,
}

impl SegmentWriter {
    fn new(pool: Arc<SegmentPool>, feed_tx: mpsc::Sender<TxSegment>, endianness: Endianness) -> Self {
        Self {
            pool,
            feed_tx,
            current: None,
            endianness,
        }
    }

    /// Write one message body as a chunk sequence across segments.
    ///
    /// Returns `false` once the feed loop is gone.
    async fn write_message(&mut self, body: &Bytes, charged: bool) -> bool {
        let segment_size = self.pool.segment_size();
        let mut offset = 0;

        loop {
            if self.current.is_none() {
                self.current = Some(TxSegment {
                    data: self.pool.acquire(),
                    content: 0,
                });
            }
            let Some(segment) = self.current.as_mut() else {
                return false;
            };

            let free = segment_size.saturating_sub(segment.data.len());
            if free <= CHUNK_HEADER_SIZE {
                // Segment exhausted mid-write: seal it and keep going in
                // a fresh one. Never blocks the serialization itself.
                if !self.seal().await {
                    return false;
                }
                continue;
            }

            let room = (free - CHUNK_HEADER_SIZE).min(MAX_CHUNK_PAYLOAD);
            let take = room.min(body.len() - offset);
            let end_of_message = offset + take == body.len();

            // Reserve the header bytes, back-fill once the chunk payload
            // is in place.
            let header_at = segment.data.len();
            segment.data.put_bytes(0, CHUNK_HEADER_SIZE);
            segment.data.extend_from_slice(&body[offset..offset + take]);
            ChunkHeader::new(end_of_message, take as u16)
                .encode_into(&mut segment.data[header_at..], self.endianness);

            if charged {
                segment.content += take;
            }
            offset += take;

            if end_of_message {
                return true;
            }
        }
    }

    /// Hand the current segment to the feed loop.
    async fn seal(&mut self) -> bool {
        let Some(segment) = self.current.take() else {
            return true;
        };
        if segment.data.is_empty() {
            self.pool.release(segment.data);
            return true;
        }
        self.feed_tx.send(segment).await.is_ok()
    }
}

/// The single serialization gate: pulls queued items (system first) and
/// writes them into segments.
#[allow(clippy::too_many_arguments)]
async fn chunk_writer_loop(
    mut system_rx: mpsc::Receiver<TxItem>,
    mut user_rx: mpsc::Receiver<TxItem>,
    mut user_gate: watch::Receiver<bool>,
    mut phase: watch::Receiver<TxPhase>,
    feed_tx: mpsc::Sender<TxSegment>,
    pool: Arc<SegmentPool>,
    throttle: TxThrottle,
    endianness: Endianness,
) {
    let mut writer = SegmentWriter::new(pool, feed_tx, endianness);

    'outer: loop {
        let user_open = *user_gate.borrow_and_update();

        let first = tokio::select! {
            biased;
            _ = phase.changed() => {
                match *phase.borrow() {
                    TxPhase::Running => continue,
                    TxPhase::Draining => break,
                    TxPhase::Aborted => {
                        discard_queue(&mut system_rx, &throttle);
                        discard_queue(&mut user_rx, &throttle);
                        return;
                    }
                }
            }
            item = system_rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
            _ = user_gate.changed(), if !user_open => continue,
            item = user_rx.recv(), if user_open => match item {
                Some(item) => item,
                None => break,
            },
        };

        // Serialize the first item plus whatever is immediately ready,
        // system queue first, then seal the segment.
        let mut batch = 1;
        if !write_item(&mut writer, first, &throttle).await {
            return;
        }
        while batch < MAX_BATCH_SIZE {
            let next = match system_rx.try_recv() {
                Ok(item) => Some(item),
                Err(_) if user_open => user_rx.try_recv().ok(),
                Err(_) => None,
            };
            let Some(item) = next else { break };
            if !write_item(&mut writer, item, &throttle).await {
                return;
            }
            batch += 1;
        }
        if !writer.seal().await {
            break 'outer;
        }
    }

    // Graceful drain: flush already-queued system items, cancel queued
    // user items with the channel fault.
    while let Ok(item) = system_rx.try_recv() {
        if !write_item(&mut writer, item, &throttle).await {
            return;
        }
    }
    discard_queue(&mut user_rx, &throttle);
    let _ = writer.seal().await;
}

/// Serialize one queued item, honoring cancellation races.
async fn write_item(writer: &mut SegmentWriter, item: TxItem, throttle: &TxThrottle) -> bool {
    if let Some(state) = &item.state {
        if !state.mark_sent() {
            // Canceled while queued; drop without transmitting.
            tracing::trace!("skipping canceled queued message");
            if item.charged {
                throttle.release(item.body.len());
            }
            return true;
        }
    }
    writer.write_message(&item.body, item.charged).await
}

/// Drop all queued items, crediting their gate charges back and marking
/// their cancellation cells.
fn discard_queue(rx: &mut mpsc::Receiver<TxItem>, throttle: &TxThrottle) {
    while let Ok(item) = rx.try_recv() {
        if let Some(state) = &item.state {
            state.cancel();
        }
        if item.charged {
            throttle.release(item.body.len());
        }
    }
}

/// Independent loop draining sealed segments to the transport.
#[allow(clippy::too_many_arguments)]
async fn transport_feed_loop<W>(
    mut write_half: W,
    mut feed_rx: mpsc::Receiver<TxSegment>,
    mut phase: watch::Receiver<TxPhase>,
    pool: Arc<SegmentPool>,
    throttle: TxThrottle,
    shutdown_timeout: Duration,
    fault_tx: mpsc::UnboundedSender<RpcError>,
    last_activity: Arc<Mutex<Instant>>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let segment = tokio::select! {
            biased;
            _ = phase.changed() => {
                if *phase.borrow() == TxPhase::Aborted {
                    break;
                }
                continue;
            }
            segment = feed_rx.recv() => match segment {
                // Chunk writer finished; all segments are on the wire.
                None => break,
                Some(segment) => segment,
            },
        };

        // A write still in flight when the pipeline stops running must
        // not stall teardown on a peer that has stopped reading: the
        // drain phase gets `shutdown_timeout` to finish, an abort gets
        // nothing.
        let result = tokio::select! {
            result = async {
                write_half.write_all(&segment.data).await?;
                write_half.flush().await
            } => Some(result),
            _ = teardown_deadline(&mut phase, shutdown_timeout) => None,
        };

        throttle.release(segment.content);

        match result {
            Some(Ok(())) => {
                pool.release(segment.data);
                *last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
            }
            Some(Err(e)) => {
                let fault = translate_io_error(&e);
                tracing::debug!("transport send failed: {fault}");
                let _ = fault_tx.send(fault);
                break;
            }
            None => {
                tracing::warn!("transmit drain abandoned, peer not reading");
                break;
            }
        }
    }

    // Credit back anything we will never send.
    while let Ok(segment) = feed_rx.try_recv() {
        throttle.release(segment.content);
    }

    if tokio::time::timeout(shutdown_timeout, write_half.shutdown())
        .await
        .is_err()
    {
        tracing::debug!("transport shutdown timed out");
    }
}

/// Resolves once an in-flight transport write must be abandoned:
/// immediately on abort, `limit` after a graceful drain begins.
async fn teardown_deadline(phase: &mut watch::Receiver<TxPhase>, limit: Duration) {
    loop {
        let current = *phase.borrow_and_update();
        match current {
            TxPhase::Running => {
                if phase.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            TxPhase::Draining => {
                tokio::time::sleep(limit).await;
                return;
            }
            TxPhase::Aborted => return,
        }
    }
}

/// Opportunistic heartbeat on transmit idle.
async fn keepalive_loop(
    period: Duration,
    handle: TxHandle,
    mut phase: watch::Receiver<TxPhase>,
    last_activity: Arc<Mutex<Instant>>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = phase.changed() => {
                if *phase.borrow() != TxPhase::Running {
                    return;
                }
            }
            _ = interval.tick() => {
                let idle = last_activity
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .elapsed();
                if idle >= period {
                    handle.try_send_system(SystemMessage::Heartbeat);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackSerializer;
    use crate::protocol::{decode_body, MessageParser};
    use tokio::io::{duplex, AsyncReadExt};

    fn test_config() -> ChannelConfig {
        ChannelConfig::default()
    }

    fn spawn_pipeline<W>(write_half: W, config: &ChannelConfig) -> (TxPipeline, mpsc::UnboundedReceiver<RpcError>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let pipeline = TxPipeline::spawn(
            write_half,
            config,
            Arc::new(MsgPackSerializer::new()),
            fault_tx,
        );
        (pipeline, fault_rx)
    }

    async fn read_messages(
        read_half: &mut (impl tokio::io::AsyncRead + Unpin),
        count: usize,
    ) -> Vec<Message> {
        let serializer = MsgPackSerializer::new();
        let mut parser = MessageParser::new();
        let mut messages = Vec::new();
        let mut buf = vec![0u8; 4096];

        while messages.len() < count {
            let n = read_half.read(&mut buf).await.unwrap();
            assert!(n > 0, "transport closed early");
            for body in parser.push(&buf[..n]).unwrap() {
                messages.push(decode_body(body, &serializer, Endianness::Big).unwrap());
            }
        }
        messages
    }

    #[test]
    fn test_send_state_cancel_race() {
        let state = SendState::new();
        assert!(state.cancel());
        assert!(state.is_canceled());
        assert!(!state.mark_sent());

        let state = SendState::new();
        assert!(state.mark_sent());
        assert!(state.is_sent());
        assert!(!state.cancel());
    }

    #[tokio::test]
    async fn test_system_message_bypasses_user_gate() {
        let (local, mut remote) = duplex(64 * 1024);
        let (mut pipeline, _faults) = spawn_pipeline(local, &test_config());
        let handle = pipeline.handle();

        // User gate is closed; a system message must still go out.
        handle
            .send_system(SystemMessage::Heartbeat)
            .await
            .unwrap();

        let messages = read_messages(&mut remote, 1).await;
        assert_eq!(messages[0], Message::System(SystemMessage::Heartbeat));

        pipeline.abort(RpcError::ChannelClosed).await;
    }

    #[tokio::test]
    async fn test_user_message_held_until_gate_opens() {
        let (local, mut remote) = duplex(64 * 1024);
        let (mut pipeline, _faults) = spawn_pipeline(local, &test_config());
        let handle = pipeline.handle();

        let message = Message::OneWay {
            body: Bytes::from_static(b"queued"),
        };
        handle.send(&message).await.unwrap();

        // Nothing transmits while the gate is closed.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut probe = [0u8; 1];
        let pending = tokio::time::timeout(Duration::from_millis(20), remote.read(&mut probe)).await;
        assert!(pending.is_err(), "user message leaked past the gate");

        handle.enable_user_traffic();
        let messages = read_messages(&mut remote, 1).await;
        assert_eq!(messages[0], message);

        pipeline.abort(RpcError::ChannelClosed).await;
    }

    #[tokio::test]
    async fn test_large_body_chunked_across_segments() {
        let (local, mut remote) = duplex(1024 * 1024);
        let mut config = test_config();
        config.tx_segment_size = 256;
        let (mut pipeline, _faults) = spawn_pipeline(local, &config);
        let handle = pipeline.handle();
        handle.enable_user_traffic();

        let payload = Bytes::from(vec![0x5A; 10_000]);
        let message = Message::OneWay {
            body: payload.clone(),
        };
        handle.send(&message).await.unwrap();

        let messages = read_messages(&mut remote, 1).await;
        assert_eq!(messages[0], message);

        pipeline.abort(RpcError::ChannelClosed).await;
    }

    #[tokio::test]
    async fn test_ordering_preserved_within_queue() {
        let (local, mut remote) = duplex(64 * 1024);
        let (mut pipeline, _faults) = spawn_pipeline(local, &test_config());
        let handle = pipeline.handle();
        handle.enable_user_traffic();

        for i in 0u8..10 {
            handle
                .send(&Message::OneWay {
                    body: Bytes::copy_from_slice(&[i]),
                })
                .await
                .unwrap();
        }

        let messages = read_messages(&mut remote, 10).await;
        for (i, message) in messages.iter().enumerate() {
            match message {
                Message::OneWay { body } => assert_eq!(body[0], i as u8),
                other => panic!("unexpected message: {other:?}"),
            }
        }

        pipeline.abort(RpcError::ChannelClosed).await;
    }

    #[tokio::test]
    async fn test_send_after_close_returns_fault() {
        let (local, _remote) = duplex(64 * 1024);
        let (mut pipeline, _faults) = spawn_pipeline(local, &test_config());
        let handle = pipeline.handle();

        pipeline.close(RpcError::ChannelClosed).await;

        let result = handle
            .send(&Message::OneWay {
                body: Bytes::from_static(b"late"),
            })
            .await;
        assert_eq!(result, Err(RpcError::ChannelClosed));

        let result = handle.send_system(SystemMessage::Heartbeat).await;
        assert_eq!(result, Err(RpcError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_close_flushes_queued_system_items() {
        let (local, mut remote) = duplex(64 * 1024);
        let (mut pipeline, _faults) = spawn_pipeline(local, &test_config());
        let handle = pipeline.handle();

        handle.send_system(SystemMessage::Logout).await.unwrap();
        pipeline.close(RpcError::ChannelClosed).await;

        let serializer = MsgPackSerializer::new();
        let mut parser = MessageParser::new();
        let mut buf = Vec::new();
        remote.read_to_end(&mut buf).await.unwrap();
        let bodies = parser.push(&buf).unwrap();
        let found = bodies.into_iter().any(|body| {
            decode_body(body, &serializer, Endianness::Big).unwrap()
                == Message::System(SystemMessage::Logout)
        });
        assert!(found, "logout was not flushed during graceful close");
    }

    #[tokio::test]
    async fn test_close_bounded_when_peer_stops_reading() {
        // Tiny transport buffer, peer alive but never reading.
        let (local, _remote) = duplex(64);
        let mut config = test_config();
        config.shutdown_timeout = Duration::from_millis(50);
        let (mut pipeline, _faults) = spawn_pipeline(local, &config);
        let handle = pipeline.handle();
        handle.enable_user_traffic();

        handle
            .send(&Message::OneWay {
                body: Bytes::from(vec![0xAB; 8 * 1024]),
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), pipeline.close(RpcError::ChannelClosed))
            .await
            .expect("graceful close stalled on an unread transport");
    }

    #[tokio::test]
    async fn test_keepalive_sends_heartbeat_when_idle() {
        let (local, mut remote) = duplex(64 * 1024);
        let mut config = test_config();
        config.heartbeat_period = Some(Duration::from_millis(30));
        let (mut pipeline, _faults) = spawn_pipeline(local, &config);

        let messages = read_messages(&mut remote, 1).await;
        assert_eq!(messages[0], Message::System(SystemMessage::Heartbeat));

        pipeline.abort(RpcError::ChannelClosed).await;
    }

    #[tokio::test]
    async fn test_transport_failure_reports_fault() {
        let (local, remote) = duplex(64);
        let (mut pipeline, mut faults) = spawn_pipeline(local, &test_config());
        let handle = pipeline.handle();
        drop(remote);

        // The duplex peer is gone; the feed loop must surface a fault.
        handle.send_system(SystemMessage::Heartbeat).await.unwrap();

        let fault = tokio::time::timeout(Duration::from_secs(1), faults.recv())
            .await
            .expect("no fault reported")
            .expect("fault channel closed");
        assert!(matches!(
            fault,
            RpcError::ConnectionAborted | RpcError::Io { .. }
        ));

        pipeline.abort(fault).await;
    }

    #[tokio::test]
    async fn test_throttle_credited_after_send() {
        let (local, mut remote) = duplex(1024 * 1024);
        let (mut pipeline, _faults) = spawn_pipeline(local, &test_config());
        let handle = pipeline.handle();
        handle.enable_user_traffic();

        handle
            .send(&Message::OneWay {
                body: Bytes::from(vec![1u8; 1000]),
            })
            .await
            .unwrap();

        let _ = read_messages(&mut remote, 1).await;
        // Feed loop credits the gate back once bytes hit the transport.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.queued_bytes(), 0);

        pipeline.abort(RpcError::ChannelClosed).await;
    }
}
