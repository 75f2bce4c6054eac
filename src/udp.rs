use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::BytesMut;
use futures::{Sink, Stream};
use pin_project::pin_project;
use tokio::net::{lookup_host, ToSocketAddrs, UdpSocket};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::udp::UdpFramed;

use crate::packet::Packet;
use crate::transport::{BoxedFramedConnection, FramedConnection, Transport, TransportError};

/// Plain-UDP transport as defined in RFC 7252.  Likely what you want unless
/// the endpoint requires DTLS, in which case supply your own [`Transport`]
/// built on a DTLS datagram library and hand it the PSK parameters from
/// [`crate::settings::Settings`].
pub struct UdpTransport<A: ToSocketAddrs> {
    endpoint: A,
}

impl<A: ToSocketAddrs> UdpTransport<A> {
    pub fn new(endpoint: A) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl<A: ToSocketAddrs + Sync + Send> Transport for UdpTransport<A> {
    async fn bind(self) -> Result<BoxedFramedConnection, TransportError> {
        let peer = lookup_host(self.endpoint)
            .await?
            .next()
            .ok_or_else(|| TransportError::Unspecified("endpoint did not resolve".into()))?;
        let local = match peer {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        let connection = UdpConnection {
            framed: UdpFramed::new(socket, Codec),
            peer,
        };
        Ok(Box::pin(connection))
    }
}

/// Connected-socket adapter: the peer address is fixed at bind time, so the
/// engine above deals in bare packets.
#[pin_project]
struct UdpConnection {
    #[pin]
    framed: UdpFramed<Codec>,
    peer: SocketAddr,
}

impl FramedConnection for UdpConnection {}

impl Stream for UdpConnection {
    type Item = Result<Packet, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project()
            .framed
            .poll_next(cx)
            .map(|item| item.map(|result| result.map(|(packet, _addr)| packet)))
    }
}

impl Sink<Packet> for UdpConnection {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().framed.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, packet: Packet) -> Result<(), Self::Error> {
        let peer = self.peer;
        self.project().framed.start_send((packet, peer))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().framed.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().framed.poll_close(cx)
    }
}

struct Codec;

impl Decoder for Codec {
    type Item = Packet;
    type Error = TransportError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, TransportError> {
        if buf.is_empty() {
            return Ok(None);
        }
        let result = Packet::from_bytes(buf).map(Some).map_err(Into::into);
        buf.clear();
        result
    }
}

impl Encoder<Packet> for Codec {
    type Error = TransportError;

    fn encode(&mut self, packet: Packet, buf: &mut BytesMut) -> Result<(), TransportError> {
        buf.extend_from_slice(&packet.to_bytes()?[..]);
        Ok(())
    }
}
