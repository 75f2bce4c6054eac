//! Asynchronous CoAP client (RFC 7252) with Observe (RFC 7641) and
//! blockwise transfers (RFC 7959).
//!
//! Open a [`CoapClient`] towards an endpoint, issue requests built with
//! [`request::CoapRequest`], and read responses off the returned
//! [`response::ResponseStream`].  Confirmable retransmission, block2
//! reassembly and continuation, block1 slicing, duplicate coalescing and
//! observation lifecycle are handled behind the stream.
//!
//! ```no_run
//! use coap_client::{CoapClient, CoapRequest, Settings};
//!
//! # async fn run() -> Result<(), coap_client::ClientError> {
//! let client = CoapClient::connect("coap.example:5683", Settings::new()).await?;
//! let body = client
//!     .request(CoapRequest::get("/sensors/temp").build()?)
//!     .await?
//!     .assemble()
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub use client::CoapClient;
pub use error::ClientError;
pub use request::{CoapRequest, RequestBuilder};
pub use response::ResponseStream;
pub use settings::{DtlsParameters, Settings, TransmissionParameters};
pub use udp::UdpTransport;

pub mod client;
pub mod error;
pub mod packet;
mod queue;
pub mod request;
pub mod response;
mod session;
pub mod settings;
pub mod transport;
pub mod udp;
