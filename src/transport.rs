use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Sink, Stream};
use thiserror::Error;

use crate::packet::{MessageError, Packet};

/// Generalization of the underlying datagram transport, primarily so that
/// alternatives to plain UDP (DTLS, BLE, test harnesses) can be dropped in
/// without touching the message engine.  A transport is consumed by `bind`,
/// which yields the framed connection the driver reads and writes.
#[async_trait]
pub trait Transport {
    /// Open the transport towards its remote endpoint.  A successful return
    /// is the "ready" signal; errors from the binding's stream or sink are
    /// the "failed" signal, and dropping the binding cancels it.
    async fn bind(self) -> Result<BoxedFramedConnection, TransportError>;
}

pub type BoxedFramedConnection = Pin<Box<dyn FramedConnection>>;

/// A bound client connection exposed as a stream of decoded inbound packets
/// and a sink for outbound packets.  Both directions operate on whole
/// datagrams; there is no partial-message framing at this layer.
pub trait FramedConnection:
    Send + Stream<Item = Result<Packet, TransportError>> + Sink<Packet, Error = TransportError>
{
}

/// Transport-level failures.  `MalformedPacket` is the one recoverable kind:
/// the driver drops the offending datagram and keeps reading.  Everything
/// else tears down the connection.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("packet was malformed: {0}")]
    MalformedPacket(#[from] MessageError),

    #[error("unspecified: {0}")]
    Unspecified(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}
