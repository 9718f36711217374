//! Receiving side of a windowed stream.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::dispatch::{Dispatcher, StreamEvent};
use crate::error::{Result, RpcError};
use crate::pipeline::TxHandle;
use crate::protocol::{Message, StreamMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Online,
    Canceling,
    Completed,
}

/// Reader half of a stream.
///
/// Buffers inbound pages and yields their items one at a time. Each
/// fully consumed page is acknowledged back to the writer; acks are
/// coalesced, so consumption that happens while an ack send is pending
/// folds into a single acknowledgment carrying the accumulated count.
/// A binary page yields its payload as one item and is acknowledged as
/// one page.
pub struct StreamReader {
    call_id: String,
    outbound: TxHandle,
    dispatcher: Arc<Dispatcher>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    items: VecDeque<Bytes>,
    page_sizes: VecDeque<usize>,
    consumed_in_page: usize,
    pending_acks: u32,
    close_pending: Option<bool>,
    state: ReaderState,
    /// Cancel asked the writer to drop queued pages; pages already in
    /// flight are discarded on arrival but still acknowledged.
    drop_requested: bool,
    fault: Option<RpcError>,
}

impl StreamReader {
    /// Register the agreed call-id with the local dispatcher and open
    /// the reader.
    pub fn open(
        call_id: impl Into<String>,
        outbound: TxHandle,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self> {
        let call_id = call_id.into();
        let events = dispatcher.register_stream(&call_id)?;
        Ok(Self {
            call_id,
            outbound,
            dispatcher,
            events,
            items: VecDeque::new(),
            page_sizes: VecDeque::new(),
            consumed_in_page: 0,
            pending_acks: 0,
            close_pending: None,
            state: ReaderState::Online,
            drop_requested: false,
            fault: None,
        })
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Items buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.items.len()
    }

    /// Yield the next item, or `None` once the writer has closed the
    /// stream and all buffered items are drained.
    ///
    /// A channel fault is sticky: every call after it returns the same
    /// error.
    pub async fn next(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(fault) = &self.fault {
                return Err(fault.clone());
            }

            if let Some(item) = self.items.pop_front() {
                self.consumed_in_page += 1;
                if Some(&self.consumed_in_page) == self.page_sizes.front() {
                    self.page_sizes.pop_front();
                    self.consumed_in_page = 0;
                    self.pending_acks += 1;
                    self.flush_acks().await?;
                }
                return Ok(Some(item));
            }

            if self.state == ReaderState::Completed {
                return Ok(None);
            }

            // Close only takes effect once the buffer is drained.
            if let Some(ack_requested) = self.close_pending.take() {
                self.finish(ack_requested).await?;
                return Ok(None);
            }

            match self.events.recv().await {
                Some(event) => {
                    self.apply_event(event)?;
                    // Discarded in-flight pages never hit a page
                    // boundary, so their acks flush here.
                    if self.state == ReaderState::Canceling {
                        self.flush_acks().await?;
                    }
                }
                None => {
                    self.fault = Some(RpcError::ChannelClosed);
                }
            }
        }
    }

    /// Cancel the stream from the reading side.
    ///
    /// With `drop_pending` the writer discards queued pages and the
    /// local buffer is cleared too. The writer still finalizes with its
    /// own close sequence, so the reader keeps consuming (or draining)
    /// until `next` returns `None`.
    pub async fn cancel(&mut self, drop_pending: bool) -> Result<()> {
        if self.state != ReaderState::Online {
            return Ok(());
        }
        tracing::debug!(call_id = %self.call_id, drop_pending, "canceling stream");
        self.state = ReaderState::Canceling;
        if drop_pending {
            self.drop_requested = true;
            // Discarded pages still count as consumed so the writer's
            // window stays consistent.
            self.pending_acks += self.page_sizes.len() as u32;
            self.items.clear();
            self.page_sizes.clear();
            self.consumed_in_page = 0;
        }
        self.outbound
            .send(&Message::Stream(StreamMessage::Cancel {
                call_id: self.call_id.clone(),
                drop_pending,
            }))
            .await?;
        self.flush_acks().await
    }

    fn apply_event(&mut self, event: StreamEvent) -> Result<()> {
        match event {
            StreamEvent::Message(StreamMessage::Page { items, .. }) => {
                if items.is_empty() {
                    // An empty page would never be acknowledged.
                    return Err(RpcError::ProtocolViolation(format!(
                        "empty page on stream {}",
                        self.call_id
                    )));
                }
                if self.discards_pages() {
                    self.pending_acks += 1;
                    return Ok(());
                }
                self.page_sizes.push_back(items.len());
                self.items.extend(items);
                Ok(())
            }
            StreamEvent::Message(StreamMessage::BinaryPage { payload, .. }) => {
                if self.discards_pages() {
                    self.pending_acks += 1;
                    return Ok(());
                }
                self.page_sizes.push_back(1);
                self.items.push_back(payload);
                Ok(())
            }
            StreamEvent::Message(StreamMessage::Close { ack_requested, .. }) => {
                self.close_pending = Some(ack_requested);
                Ok(())
            }
            StreamEvent::Message(other) => Err(RpcError::ProtocolViolation(format!(
                "unexpected stream message on reader {}: {other:?}",
                self.call_id
            ))),
            StreamEvent::Terminated(fault) => {
                self.fault = Some(fault);
                Ok(())
            }
        }
    }

    fn discards_pages(&self) -> bool {
        self.state == ReaderState::Canceling && self.drop_requested
    }

    async fn flush_acks(&mut self) -> Result<()> {
        if self.pending_acks == 0 {
            return Ok(());
        }
        let consumed = std::mem::take(&mut self.pending_acks);
        self.outbound
            .send(&Message::Stream(StreamMessage::PageAck {
                call_id: self.call_id.clone(),
                consumed,
            }))
            .await
    }

    async fn finish(&mut self, ack_requested: bool) -> Result<()> {
        self.flush_acks().await?;
        if ack_requested {
            self.outbound
                .send(&Message::Stream(StreamMessage::CloseAck {
                    call_id: self.call_id.clone(),
                }))
                .await?;
        }
        tracing::debug!(call_id = %self.call_id, "stream drained and closed");
        self.state = ReaderState::Completed;
        self.dispatcher.unregister(&self.call_id);
        Ok(())
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.dispatcher.unregister(&self.call_id);
    }
}
