//! Channel configuration.

use std::time::Duration;

use crate::protocol::{Endianness, DEFAULT_MAX_MESSAGE_SIZE};

/// Default transmit/receive buffer segment size.
pub const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024;

/// Default cap on queued-but-unsent transmit bytes.
pub const DEFAULT_MAX_QUEUED_BYTES: usize = 1024 * 1024;

/// Default timeout waiting for transmit buffer room.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default login handshake timeout.
pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default logout handshake timeout.
pub const DEFAULT_LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default transport shutdown timeout.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default stream send window (pages in flight without acknowledgment).
pub const DEFAULT_STREAM_WINDOW: usize = 100;

/// Default number of items batched into one stream page.
pub const DEFAULT_PAGE_SIZE: usize = 64;

/// Default maximum concurrently running request handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Configuration for a single channel.
///
/// Both peers must agree on `endianness`; everything else is local policy.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Transmit buffer segment capacity in bytes.
    pub tx_segment_size: usize,
    /// Receive buffer segment capacity in bytes.
    pub rx_segment_size: usize,
    /// Maximum size of one message body; larger bodies fault the channel.
    pub max_message_size: usize,
    /// Cap on queued-but-unsent transmit bytes before producers block.
    pub max_queued_bytes: usize,
    /// How long a producer waits for transmit buffer room.
    pub send_timeout: Duration,
    /// How long a transport read may stall before the channel faults.
    /// `None` disables receive timeout detection.
    pub receive_timeout: Option<Duration>,
    /// Login handshake timeout. Servers typically configure a longer
    /// value than clients since they wait passively.
    pub login_timeout: Duration,
    /// Logout send timeout during graceful close.
    pub logout_timeout: Duration,
    /// Transport shutdown timeout during teardown.
    pub shutdown_timeout: Duration,
    /// Idle period after which a heartbeat is sent. `None` disables
    /// keep-alives.
    pub heartbeat_period: Option<Duration>,
    /// Stream send window: max unacknowledged pages in flight.
    ///
    /// Window accounting is page-granular (binary pages included), so
    /// this single knob is also the cap on pages in flight; there is no
    /// separate limit.
    pub stream_window: usize,
    /// Items batched into one stream page before it is flushed.
    pub page_size: usize,
    /// Maximum concurrently running inbound request handlers.
    pub max_concurrent_handlers: usize,
    /// Byte order for wire integers.
    pub endianness: Endianness,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            tx_segment_size: DEFAULT_SEGMENT_SIZE,
            rx_segment_size: DEFAULT_SEGMENT_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_queued_bytes: DEFAULT_MAX_QUEUED_BYTES,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            receive_timeout: None,
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
            logout_timeout: DEFAULT_LOGOUT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            heartbeat_period: None,
            stream_window: DEFAULT_STREAM_WINDOW,
            page_size: DEFAULT_PAGE_SIZE,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            endianness: Endianness::default(),
        }
    }
}
