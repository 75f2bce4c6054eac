use std::collections::HashMap;
use std::time::Duration;

use futures::stream::Fuse;
use futures::{SinkExt, StreamExt};
use log::{debug, error, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::ToSocketAddrs;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::error::ClientError;
use crate::packet::Packet;
use crate::request::CoapRequest;
use crate::response::ResponseStream;
use crate::session::{Session, SessionEvent};
use crate::settings::Settings;
use crate::transport::{BoxedFramedConnection, Transport, TransportError};
use crate::udp::UdpTransport;

/// Sessions start from the largest block size; any Block1 the server sends
/// lowers the preference connection-wide.
const DEFAULT_BLOCK1_SZX: u8 = 6;

/// Interval of the retransmission sweep over all sessions.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Primary client API: opens a datagram connection to one CoAP endpoint and
/// hands out response streams for requests issued over it.
///
/// Cloning is cheap; clones talk to the same connection.  The background
/// driver shuts down once every clone and every open response stream is
/// dropped.
#[derive(Clone)]
pub struct CoapClient {
    command_tx: mpsc::UnboundedSender<Command>,
}

pub(crate) enum Command {
    Request {
        request: CoapRequest,
        sink: mpsc::UnboundedSender<SessionEvent>,
        token_reply: oneshot::Sender<Result<u64, ClientError>>,
    },
    RequestRaw {
        messages: Vec<Packet>,
        sink: mpsc::UnboundedSender<SessionEvent>,
        token_reply: oneshot::Sender<Result<u64, ClientError>>,
    },
    Cancel {
        token: u64,
    },
}

impl CoapClient {
    /// Connect over plain UDP (RFC 7252 section 4.1).
    pub async fn connect<A>(endpoint: A, settings: Settings) -> Result<CoapClient, ClientError>
    where
        A: ToSocketAddrs + Send + Sync + 'static,
    {
        Self::bind_transport(UdpTransport::new(endpoint), settings).await
    }

    /// Connect over a caller-supplied transport, e.g. a DTLS implementation
    /// consuming [`Settings::security_parameters`].
    pub async fn bind_transport<T: Transport>(
        transport: T,
        settings: Settings,
    ) -> Result<CoapClient, ClientError> {
        let binding = transport.bind().await?;
        Ok(Self::from_binding(binding, settings, StdRng::from_entropy()))
    }

    fn from_binding(
        binding: BoxedFramedConnection,
        settings: Settings,
        rng: StdRng,
    ) -> CoapClient {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            binding: binding.fuse(),
            command_rx,
            sessions: HashMap::new(),
            block1_szx: DEFAULT_BLOCK1_SZX,
            last_inbound: Instant::now(),
            settings,
            rng,
        };
        tokio::spawn(driver.run());
        CoapClient { command_tx }
    }

    /// Issue one logical request.  The returned stream yields every
    /// non-swallowed response message for its token; dropping the stream
    /// cancels the request (deregistering first when it observes).
    pub async fn request(&self, request: CoapRequest) -> Result<ResponseStream, ClientError> {
        let (sink, events) = mpsc::unbounded_channel();
        let (token_reply, reply) = oneshot::channel();
        self.command_tx
            .send(Command::Request {
                request,
                sink,
                token_reply,
            })
            .map_err(|_| ClientError::Cancelled)?;
        let token = reply.await.map_err(|_| ClientError::Cancelled)??;
        Ok(ResponseStream::new(token, events, self.command_tx.clone()))
    }

    /// Issue pre-built messages on one fresh token.  The engine still owns
    /// reliability, acking and routing, but never slices or reorders what it
    /// was given.
    pub async fn request_raw(
        &self,
        messages: Vec<Packet>,
    ) -> Result<ResponseStream, ClientError> {
        let (sink, events) = mpsc::unbounded_channel();
        let (token_reply, reply) = oneshot::channel();
        self.command_tx
            .send(Command::RequestRaw {
                messages,
                sink,
                token_reply,
            })
            .map_err(|_| ClientError::Cancelled)?;
        let token = reply.await.map_err(|_| ClientError::Cancelled)??;
        Ok(ResponseStream::new(token, events, self.command_tx.clone()))
    }
}

/// The connection event loop.  Owns the transport and the session table;
/// everything here runs on one task, so per-session state is only ever
/// touched from one place.
struct Driver {
    binding: Fuse<BoxedFramedConnection>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    sessions: HashMap<u64, Session>,
    block1_szx: u8,
    last_inbound: Instant,
    settings: Settings,
    rng: StdRng,
}

impl Driver {
    async fn run(mut self) {
        let mut sweep = time::interval_at(Instant::now() + SWEEP_INTERVAL, SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let keepalive_enabled = !self.settings.ping_interval.is_zero();
        let ping_interval = if keepalive_enabled {
            self.settings.ping_interval
        } else {
            Duration::from_secs(3600)
        };
        let mut keepalive = time::interval_at(Instant::now() + ping_interval, ping_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                event = self.binding.select_next_some() => {
                    match event {
                        Ok(packet) => {
                            if let Err(error) = self.handle_inbound(packet).await {
                                break Err(error);
                            }
                        }
                        Err(TransportError::MalformedPacket(error)) => {
                            warn!("Dropping malformed datagram: {error}");
                        }
                        Err(error) => break Err(ClientError::Transport(error)),
                    }
                }
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => {
                            if let Err(error) = self.handle_command(command).await {
                                break Err(error);
                            }
                        }
                        None => break Ok(()),
                    }
                }
                _ = sweep.tick() => {
                    if let Err(error) = self.handle_sweep().await {
                        break Err(error);
                    }
                }
                _ = keepalive.tick(), if keepalive_enabled => {
                    if let Err(error) = self.handle_keepalive().await {
                        break Err(error);
                    }
                }
            }
        };

        match result {
            Ok(()) => self.shutdown().await,
            Err(error) => self.fail_all(error),
        }
    }

    async fn handle_inbound(&mut self, packet: Packet) -> Result<(), ClientError> {
        self.last_inbound = Instant::now();
        trace!("Incoming packet: {packet:?}");

        let token = packet.token();
        let routed = if token != 0 && self.sessions.contains_key(&token) {
            Some(token)
        } else {
            // transport-level ACK/RST and token-less replies: correlate by
            // message id against the sessions' outgoing queues
            self.sessions
                .values()
                .find(|s| s.matches_message_id(packet.message_id))
                .map(Session::token)
        };

        let mut outgoing = Vec::new();
        match routed {
            Some(token) => {
                if let Some(session) = self.sessions.get_mut(&token) {
                    outgoing =
                        session.handle_inbound(&packet, &mut self.block1_szx, &mut self.rng);
                    outgoing.extend(session.pump(Instant::now(), &mut self.rng));
                }
            }
            None if packet.code.is_empty() => {
                // ping pong or a stale ACK; it already refreshed the
                // keepalive window, nothing else to do
                trace!("Ignoring unmatched Empty message id {}", packet.message_id);
            }
            None => {
                debug!(
                    "Quenching unknown token {token:#x} (message id {})",
                    packet.message_id
                );
                outgoing.push(Packet::reset(packet.message_id));
            }
        }

        for packet in outgoing {
            self.send(packet).await?;
        }
        self.reap_terminal();
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), ClientError> {
        match command {
            Command::Request {
                request,
                sink,
                token_reply,
            } => {
                let token = self.allocate_token();
                match Session::new(
                    token,
                    request,
                    self.block1_szx,
                    sink,
                    self.settings.transmission,
                    &mut self.rng,
                ) {
                    Ok(mut session) => {
                        let outgoing = session.pump(Instant::now(), &mut self.rng);
                        self.sessions.insert(token, session);
                        let _ = token_reply.send(Ok(token));
                        for packet in outgoing {
                            self.send(packet).await?;
                        }
                    }
                    Err(error) => {
                        let _ = token_reply.send(Err(error));
                    }
                }
            }
            Command::RequestRaw {
                messages,
                sink,
                token_reply,
            } => {
                let token = self.allocate_token();
                let mut session =
                    Session::raw(token, messages, sink, self.settings.transmission);
                let outgoing = session.pump(Instant::now(), &mut self.rng);
                self.sessions.insert(token, session);
                let _ = token_reply.send(Ok(token));
                for packet in outgoing {
                    self.send(packet).await?;
                }
            }
            Command::Cancel { token } => {
                if let Some(mut session) = self.sessions.remove(&token) {
                    debug!("Cancelling session with token {token:#x}");
                    if let Some(deregister) = session.cancel(&mut self.rng) {
                        self.send(deregister).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_sweep(&mut self) -> Result<(), ClientError> {
        let now = Instant::now();
        let mut outgoing = Vec::new();
        for session in self.sessions.values_mut() {
            outgoing.extend(session.tick(now, &mut self.rng));
        }
        self.reap_terminal();
        for packet in outgoing {
            self.send(packet).await?;
        }
        Ok(())
    }

    async fn handle_keepalive(&mut self) -> Result<(), ClientError> {
        let idle = self.last_inbound.elapsed();
        let limit = self.settings.ping_interval * self.settings.keepalive_factor;
        if idle > limit {
            warn!("No traffic for {idle:?}, declaring the connection dead");
            return Err(ClientError::TimedOut);
        }
        let ping = Packet::ping(self.rng.gen());
        trace!("Keepalive ping, message id {}", ping.message_id);
        self.send(ping).await
    }

    async fn send(&mut self, packet: Packet) -> Result<(), ClientError> {
        trace!("Outgoing packet: {packet:?}");
        self.binding.send(packet).await.map_err(|error| {
            error!("Transport send failed: {error}");
            ClientError::Transport(error)
        })
    }

    fn allocate_token(&mut self) -> u64 {
        loop {
            let token = self.rng.gen::<u64>();
            // zero stays reserved so Empty-message routing is unambiguous
            if token != 0 && !self.sessions.contains_key(&token) {
                return token;
            }
        }
    }

    fn reap_terminal(&mut self) {
        self.sessions.retain(|token, session| {
            if session.is_terminal() {
                debug!("Session with token {token:#x} finished");
                false
            } else {
                true
            }
        });
    }

    /// Every handle is gone: deregister observations and wind down.
    async fn shutdown(mut self) {
        debug!("All client handles dropped, shutting down the connection");
        let mut sessions: Vec<Session> = self.sessions.drain().map(|(_, s)| s).collect();
        for session in &mut sessions {
            if let Some(deregister) = session.cancel(&mut self.rng) {
                let _ = self.binding.send(deregister).await;
            }
        }
    }

    fn fail_all(&mut self, error: ClientError) {
        error!("Connection failed: {error}");
        for session in self.sessions.values_mut() {
            session.fail(error.clone());
        }
        self.sessions.clear();
    }
}
