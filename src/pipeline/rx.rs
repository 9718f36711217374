//! Receive pipeline.
//!
//! A single task pulls bytes from the transport read half, feeds the
//! incremental parser, decodes complete bodies into typed messages and
//! hands them to the channel router. Any transport, framing, or
//! deserialization error faults the channel; framing corruption has no
//! partial recovery.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::codec::Serializer;
use crate::config::ChannelConfig;
use crate::error::RpcError;
use crate::protocol::{decode_body, Message, MessageParser, SystemMessage};
use crate::transport::translate_io_error;

/// A running receive pipeline.
pub struct RxPipeline {
    stop: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl RxPipeline {
    /// Spawn the read loop over the given read half.
    ///
    /// Decoded messages are delivered in arrival order through
    /// `inbound_tx`; failures go through `fault_tx` and end the loop.
    pub fn spawn<R>(
        read_half: R,
        config: &ChannelConfig,
        serializer: Arc<dyn Serializer>,
        inbound_tx: mpsc::UnboundedSender<Message>,
        fault_tx: mpsc::UnboundedSender<RpcError>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let stop = Arc::new(Notify::new());
        let task = tokio::spawn(read_loop(
            read_half,
            config.clone(),
            serializer,
            inbound_tx,
            fault_tx,
            stop.clone(),
        ));
        Self {
            stop,
            task: Some(task),
        }
    }

    /// Stop the read loop and wait for it to finish.
    pub async fn stop(&mut self) {
        self.stop.notify_one();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn read_loop<R>(
    mut read_half: R,
    config: ChannelConfig,
    serializer: Arc<dyn Serializer>,
    inbound_tx: mpsc::UnboundedSender<Message>,
    fault_tx: mpsc::UnboundedSender<RpcError>,
    stop: Arc<Notify>,
) where
    R: AsyncRead + Unpin,
{
    let mut parser = MessageParser::with_limits(config.max_message_size, config.endianness);
    let mut buf = vec![0u8; config.rx_segment_size];
    let mut logout_seen = false;

    loop {
        let read = async {
            match config.receive_timeout {
                Some(timeout) => tokio::time::timeout(timeout, read_half.read(&mut buf))
                    .await
                    .unwrap_or_else(|_| {
                        Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "receive timeout",
                        ))
                    }),
                None => read_half.read(&mut buf).await,
            }
        };

        let n = tokio::select! {
            biased;
            _ = stop.notified() => return,
            n = read => n,
        };

        let n = match n {
            // Peer closed the transport. After a logout this is the
            // orderly end of the session; otherwise the peer vanished.
            // Classifying here keeps EOF ordered behind the messages
            // that preceded it.
            Ok(0) => {
                let fault = if logout_seen {
                    RpcError::ChannelClosed
                } else {
                    RpcError::ConnectionAborted
                };
                let _ = fault_tx.send(fault);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                let fault = translate_io_error(&e);
                tracing::debug!("transport receive failed: {fault}");
                let _ = fault_tx.send(fault);
                return;
            }
        };

        let bodies = match parser.push(&buf[..n]) {
            Ok(bodies) => bodies,
            Err(e) => {
                tracing::warn!("framing error on receive: {e}");
                let _ = fault_tx.send(e);
                return;
            }
        };

        for body in bodies {
            let message = match decode_body(body, serializer.as_ref(), config.endianness) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!("failed to decode inbound message: {e}");
                    let _ = fault_tx.send(e);
                    return;
                }
            };
            if matches!(message, Message::System(SystemMessage::Logout)) {
                logout_seen = true;
            }
            tracing::trace!(kind = message.kind(), "inbound message");
            if inbound_tx.send(message).is_err() {
                // Router gone; channel is tearing down.
                return;
            }
        }
    }
}
