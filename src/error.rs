use thiserror::Error;

use crate::packet::MessageError;
use crate::transport::TransportError;

/// Failure kinds surfaced to the application.  A terminated request ends in
/// exactly one of: the stream finishing normally, `Cancelled`, or one of the
/// other kinds delivered through the stream as its final item.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// A message could not be encoded, or a constructed option violated its
    /// constraints.  Malformed *inbound* datagrams never surface here; they
    /// are logged and dropped.
    #[error("malformed message: {0}")]
    Format(#[from] MessageError),

    /// The datagram transport failed to read or write.  Fatal for the
    /// connection; every active request fails with this.
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),

    /// The keepalive window expired, or a confirmable message went
    /// unacknowledged through every retransmission.
    #[error("timed out waiting for the peer")]
    TimedOut,

    /// The request was cancelled by the application or the connection was
    /// shut down.  A normal completion, not a defect.
    #[error("request cancelled")]
    Cancelled,

    /// A hand-constructed message code does not fit the 3-bit class and
    /// 5-bit detail layout.
    #[error("invalid message code {class}.{detail:02}")]
    Code { class: u8, detail: u8 },
}
