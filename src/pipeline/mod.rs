//! Transmit and receive pipelines.
//!
//! The transmit side serializes and chunks outbound messages under a
//! single writer gate with system-message priority; the receive side
//! turns transport bytes back into typed messages. Both report failures
//! to the channel's fault supervisor instead of handling them locally.

mod rx;
mod throttle;
mod tx;

pub use rx::RxPipeline;
pub use throttle::TxThrottle;
pub use tx::{SendState, TxHandle, TxPipeline};
