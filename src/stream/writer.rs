//! Sending side of a windowed stream.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::ChannelConfig;
use crate::dispatch::{Dispatcher, StreamEvent};
use crate::error::{Result, RpcError};
use crate::pipeline::TxHandle;
use crate::protocol::{Message, StreamMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Online,
    Completed,
    Closed,
}

/// Writer half of a stream.
///
/// Items buffer into a page; a full page (or an explicit flush) sends
/// one `Page` message and charges the window. Writes suspend while the
/// window is full and resume when the reader acknowledges consumption.
/// Events from the peer (acks, cancellation, close-ack) are pumped on
/// the writer's own suspension points, so window accounting needs no
/// separate task.
pub struct StreamWriter {
    call_id: String,
    outbound: TxHandle,
    dispatcher: Arc<Dispatcher>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    window: usize,
    in_flight: usize,
    page: Vec<Bytes>,
    page_size: usize,
    state: WriterState,
    canceled: bool,
    close_acked: bool,
}

impl StreamWriter {
    /// Register the agreed call-id with the local dispatcher and open
    /// the writer.
    pub fn open(
        call_id: impl Into<String>,
        outbound: TxHandle,
        dispatcher: Arc<Dispatcher>,
        config: &ChannelConfig,
    ) -> Result<Self> {
        let call_id = call_id.into();
        let events = dispatcher.register_stream(&call_id)?;
        Ok(Self {
            call_id,
            outbound,
            dispatcher,
            events,
            window: config.stream_window,
            in_flight: 0,
            page: Vec::new(),
            page_size: config.page_size,
            state: WriterState::Online,
            canceled: false,
            close_acked: false,
        })
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Unacknowledged pages currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Append one item, transmitting the page if it is full.
    ///
    /// Suspends while the send window is exhausted. Fails with
    /// `OperationCanceled` once the reader has canceled the stream.
    pub async fn write(&mut self, item: Bytes) -> Result<()> {
        self.ensure_online()?;
        self.drain_ready_events()?;
        self.page.push(item);
        if self.page.len() >= self.page_size {
            self.flush_page().await?;
        }
        Ok(())
    }

    /// Transmit any partially filled page now.
    pub async fn flush(&mut self) -> Result<()> {
        self.ensure_online()?;
        if !self.page.is_empty() {
            self.flush_page().await?;
        }
        Ok(())
    }

    /// Send a raw byte page, bypassing item batching.
    ///
    /// Counts as one page against the window.
    pub async fn write_bytes(&mut self, payload: Bytes) -> Result<()> {
        self.ensure_online()?;
        // Keep item/byte ordering: buffered items go first.
        if !self.page.is_empty() {
            self.flush_page().await?;
        }
        self.wait_for_window().await?;
        self.outbound
            .send(&Message::Stream(StreamMessage::BinaryPage {
                call_id: self.call_id.clone(),
                payload,
            }))
            .await?;
        self.in_flight += 1;
        Ok(())
    }

    /// Finish the stream: flush buffered data, send the close message
    /// and wait for the reader's close-acknowledgment.
    pub async fn complete(mut self) -> Result<()> {
        if self.state != WriterState::Online {
            return Err(RpcError::StreamCompleted);
        }
        // Queued data still goes out, unless the reader asked us to
        // drop it.
        if !self.page.is_empty() && !self.canceled {
            self.flush_page().await?;
        }
        self.state = WriterState::Completed;

        self.outbound
            .send(&Message::Stream(StreamMessage::Close {
                call_id: self.call_id.clone(),
                ack_requested: true,
            }))
            .await?;
        tracing::debug!(call_id = %self.call_id, "stream close sent, awaiting ack");

        while !self.close_acked {
            self.pump_event().await?;
        }
        self.state = WriterState::Closed;
        self.dispatcher.unregister(&self.call_id);
        Ok(())
    }

    /// Drop queued data and close immediately without further
    /// messaging. For channel-failure paths.
    pub fn abort(mut self) {
        self.page.clear();
        self.state = WriterState::Closed;
        self.dispatcher.unregister(&self.call_id);
    }

    fn ensure_online(&self) -> Result<()> {
        if self.canceled {
            return Err(RpcError::OperationCanceled);
        }
        match self.state {
            WriterState::Online => Ok(()),
            _ => Err(RpcError::StreamCompleted),
        }
    }

    async fn flush_page(&mut self) -> Result<()> {
        self.wait_for_window().await?;
        if self.canceled {
            self.page.clear();
            return Err(RpcError::OperationCanceled);
        }
        let items = std::mem::take(&mut self.page);
        self.outbound
            .send(&Message::Stream(StreamMessage::Page {
                call_id: self.call_id.clone(),
                items,
            }))
            .await?;
        self.in_flight += 1;
        Ok(())
    }

    async fn wait_for_window(&mut self) -> Result<()> {
        while self.in_flight >= self.window {
            tracing::trace!(
                call_id = %self.call_id,
                in_flight = self.in_flight,
                "send window full, waiting for ack"
            );
            self.pump_event().await?;
        }
        Ok(())
    }

    /// Apply peer events that are already queued without suspending.
    fn drain_ready_events(&mut self) -> Result<()> {
        while let Ok(event) = self.events.try_recv() {
            self.apply_event(event)?;
        }
        if self.canceled {
            return Err(RpcError::OperationCanceled);
        }
        Ok(())
    }

    async fn pump_event(&mut self) -> Result<()> {
        match self.events.recv().await {
            Some(event) => self.apply_event(event),
            // Dispatcher dropped the op; the channel is gone.
            None => Err(RpcError::ChannelClosed),
        }
    }

    fn apply_event(&mut self, event: StreamEvent) -> Result<()> {
        match event {
            StreamEvent::Message(StreamMessage::PageAck { consumed, .. }) => {
                self.in_flight = self.in_flight.saturating_sub(consumed as usize);
                Ok(())
            }
            StreamEvent::Message(StreamMessage::Cancel { drop_pending, .. }) => {
                tracing::debug!(call_id = %self.call_id, drop_pending, "reader canceled stream");
                self.canceled = true;
                if drop_pending {
                    self.page.clear();
                }
                Ok(())
            }
            StreamEvent::Message(StreamMessage::CloseAck { .. }) => {
                self.close_acked = true;
                Ok(())
            }
            StreamEvent::Message(other) => Err(RpcError::ProtocolViolation(format!(
                "unexpected stream message on writer {}: {other:?}",
                self.call_id
            ))),
            StreamEvent::Terminated(fault) => {
                self.state = WriterState::Closed;
                Err(fault)
            }
        }
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        self.dispatcher.unregister(&self.call_id);
    }
}
