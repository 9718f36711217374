//! Windowed paged streaming.
//!
//! Streams ride on top of the dispatcher's call-id routing: both peers
//! register the same agreed call-id (typically exchanged through an
//! ordinary request/response) and then trade stream auxiliary messages
//! through it. The writer batches items into pages and never has more
//! than the configured window of unacknowledged pages in flight; the
//! reader acknowledges consumed pages, coalescing acks, and the two
//! sides finish with an explicit close handshake.

mod reader;
mod writer;

pub use reader::StreamReader;
pub use writer::StreamWriter;
