//! # wireline
//!
//! RPC channel runtime over any byte-stream transport: multiplexed,
//! correlated, flow-controlled message exchange between two peers.
//!
//! A [`Channel`] wraps one bidirectional transport (a socket, a pipe, an
//! in-memory duplex) and provides one-way messages, request/response
//! calls correlated by call-id, and windowed paged item streams, behind
//! a login handshake. Framing, chunking, backpressure, keep-alives, and
//! fault propagation are handled inside the channel; the transport only
//! needs to move bytes.
//!
//! ## Example
//!
//! ```ignore
//! use wireline::{Channel, ChannelConfig, ChannelOptions, Credentials};
//!
//! #[tokio::main]
//! async fn main() -> wireline::Result<()> {
//!     let transport = tokio::net::TcpStream::connect("127.0.0.1:9000").await?;
//!     let channel = Channel::connect_client(
//!         transport,
//!         ChannelConfig::default(),
//!         Credentials::new("worker", "secret"),
//!         ChannelOptions::new("worker-1"),
//!     )
//!     .await?;
//!
//!     let reply = channel.call(bytes::Bytes::from_static(b"ping")).await?;
//!     println!("{reply:?}");
//!     channel.close().await;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod stream;
pub mod transport;

mod channel;

pub use channel::{Channel, ChannelEvent, ChannelOptions, ChannelState, PendingCall};
pub use config::ChannelConfig;
pub use dispatch::{BoxFuture, RequestContext, RequestHandler};
pub use error::{Result, RpcError};
pub use session::{AllowAll, Authenticator, Credentials};
pub use stream::{StreamReader, StreamWriter};
