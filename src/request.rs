use crate::packet::{MessageClass, MessageError, MessageType, ObserveOption, Packet, RequestType};

/// One logical request as handed to [`crate::CoapClient::request`].  Built
/// through [`RequestBuilder`], which validates option constraints up front so
/// a bad URI fails at build time instead of mid-transfer.
#[derive(Debug, Clone)]
pub struct CoapRequest {
    pub(crate) method: RequestType,
    pub(crate) confirmable: bool,
    pub(crate) observe: bool,
    pub(crate) uri_host: Option<String>,
    pub(crate) uri_port: Option<u16>,
    pub(crate) uri_path: Vec<String>,
    pub(crate) uri_query: Vec<String>,
    pub(crate) if_match: Vec<Vec<u8>>,
    pub(crate) if_none_match: bool,
    pub(crate) content_format: Option<u16>,
    pub(crate) accept: Option<u16>,
    pub(crate) payload: Vec<u8>,
}

impl CoapRequest {
    pub fn get(path: &str) -> RequestBuilder {
        RequestBuilder::new(RequestType::Get, path)
    }

    pub fn post(path: &str) -> RequestBuilder {
        RequestBuilder::new(RequestType::Post, path)
    }

    pub fn put(path: &str) -> RequestBuilder {
        RequestBuilder::new(RequestType::Put, path)
    }

    pub fn delete(path: &str) -> RequestBuilder {
        RequestBuilder::new(RequestType::Delete, path)
    }

    /// Render this request as a packet carrying every request option.
    /// Blockwise slicing of the payload is the queue's business; the packet
    /// returned here carries none.
    pub(crate) fn to_packet(&self, token: u64, message_id: u16) -> Packet {
        let mut packet = Packet::new();
        packet.set_type(if self.confirmable {
            MessageType::Confirmable
        } else {
            MessageType::NonConfirmable
        });
        packet.code = MessageClass::Request(self.method);
        packet.message_id = message_id;
        packet.set_token(token);

        // options were validated by the builder, so the setters cannot fail
        if let Some(host) = &self.uri_host {
            let _ = packet.set_uri_host(host);
        }
        if let Some(port) = self.uri_port {
            packet.set_uri_port(port);
        }
        for segment in &self.uri_path {
            let _ = packet.add_uri_path(segment);
        }
        for segment in &self.uri_query {
            let _ = packet.add_uri_query(segment);
        }
        for etag in &self.if_match {
            packet.add_if_match(etag.clone());
        }
        if self.if_none_match {
            packet.set_if_none_match();
        }
        if let Some(format) = self.content_format {
            packet.set_content_format(format);
        }
        if let Some(format) = self.accept {
            packet.set_accept(format);
        }
        packet
    }
}

/// Chained construction in the usual style; `build` performs the validation
/// pass and yields the finished [`CoapRequest`].
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    request: CoapRequest,
}

impl RequestBuilder {
    pub fn new(method: RequestType, path: &str) -> RequestBuilder {
        let uri_path = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        RequestBuilder {
            request: CoapRequest {
                method,
                confirmable: true,
                observe: false,
                uri_host: None,
                uri_port: None,
                uri_path,
                uri_query: Vec::new(),
                if_match: Vec::new(),
                if_none_match: false,
                content_format: None,
                accept: None,
                payload: Vec::new(),
            },
        }
    }

    /// Send the request non-confirmably.  Defaults to confirmable.
    pub fn non_confirmable(mut self) -> Self {
        self.request.confirmable = false;
        self
    }

    /// Register for notifications (RFC 7641).  Cancelling the response
    /// stream deregisters.
    pub fn observe(mut self) -> Self {
        self.request.observe = true;
        self
    }

    pub fn uri_host(mut self, host: &str) -> Self {
        self.request.uri_host = Some(host.to_owned());
        self
    }

    pub fn uri_port(mut self, port: u16) -> Self {
        self.request.uri_port = Some(port);
        self
    }

    pub fn query(mut self, segment: &str) -> Self {
        self.request.uri_query.push(segment.to_owned());
        self
    }

    pub fn if_match(mut self, etag: Vec<u8>) -> Self {
        self.request.if_match.push(etag);
        self
    }

    pub fn if_none_match(mut self) -> Self {
        self.request.if_none_match = true;
        self
    }

    pub fn content_format(mut self, format: u16) -> Self {
        self.request.content_format = Some(format);
        self
    }

    pub fn accept(mut self, format: u16) -> Self {
        self.request.accept = Some(format);
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.request.payload = payload;
        self
    }

    pub fn build(self) -> Result<CoapRequest, MessageError> {
        // run everything through the packet constructors once; their
        // constraints are the source of truth
        let mut probe = Packet::new();
        if let Some(host) = &self.request.uri_host {
            probe.set_uri_host(host)?;
        }
        for segment in &self.request.uri_path {
            probe.add_uri_path(segment)?;
        }
        for segment in &self.request.uri_query {
            probe.add_uri_query(segment)?;
        }
        Ok(self.request)
    }
}

/// True when the packet asks to register an observation.
pub(crate) fn is_observe_registration(packet: &Packet) -> bool {
    packet.get_observe() == Some(ObserveOption::Register)
}
