use std::collections::BTreeMap;
use std::time::Duration;

use log::{debug, trace, warn};
use rand::Rng;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

use crate::error::ClientError;
use crate::packet::{BlockValue, MessageClass, MessageType, ObserveOption, Packet, RequestType};
use crate::queue::MessageQueue;
use crate::request::{is_observe_registration, CoapRequest};
use crate::settings::TransmissionParameters;

/// How a request ended, delivered as the final event on its sink.
#[derive(Debug)]
pub(crate) enum Completion {
    /// The exchange ran to its natural end.  `payload` is the block2
    /// reassembly: fragments concatenated in NUM order, or `None` when any
    /// NUM is missing (partial bodies are never emitted).
    Finished { payload: Option<Vec<u8>> },
    Cancelled,
    Failed(ClientError),
}

#[derive(Debug)]
pub(crate) enum SessionEvent {
    Message(Packet),
    Completed(Completion),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Sending,
    Awaiting,
    Completed,
    Cancelled,
    Failed,
}

/// Back-off bookkeeping for the confirmable message currently on the wire.
#[derive(Debug)]
struct Retransmit {
    message_id: u16,
    attempts: usize,
    timeout: Duration,
    due: Instant,
}

/// Per-token state machine owning one logical request: sends and retransmits
/// outgoing messages, acks server-initiated confirmables, requests block2
/// continuations, advances block1 uploads, and terminates on completion,
/// cancellation, RST or failure.
pub(crate) struct Session {
    token: u64,
    confirmable: bool,
    is_observe: bool,
    queue: MessageQueue,
    state: SessionState,
    sink: UnboundedSender<SessionEvent>,
    received_blocks: BTreeMap<u32, Vec<u8>>,
    expecting_block2: bool,
    last_delivered_id: Option<u16>,
    deregister_template: Option<Packet>,
    retransmit: Option<Retransmit>,
    parameters: TransmissionParameters,
}

impl Session {
    pub(crate) fn new(
        token: u64,
        request: CoapRequest,
        block1_szx: u8,
        sink: UnboundedSender<SessionEvent>,
        parameters: TransmissionParameters,
        rng: &mut impl Rng,
    ) -> Result<Session, ClientError> {
        let mut queue = MessageQueue::dynamic(request, token);
        queue.enqueue_block(0, block1_szx, rng)?;

        // the head message is the source of truth for the session flavor
        let head = queue.next().expect("dynamic queue always yields a head");
        let is_observe = is_observe_registration(head);
        let confirmable = head.get_type() == MessageType::Confirmable;
        let deregister_template = is_observe.then(|| head.clone());

        Ok(Session {
            token,
            confirmable,
            is_observe,
            queue,
            state: SessionState::Idle,
            sink,
            received_blocks: BTreeMap::new(),
            expecting_block2: false,
            last_delivered_id: None,
            deregister_template,
            retransmit: None,
            parameters,
        })
    }

    /// Session over caller-provided messages; the caller owns chunking and
    /// option layout, the engine still owns reliability and routing.
    pub(crate) fn raw(
        token: u64,
        mut messages: Vec<Packet>,
        sink: UnboundedSender<SessionEvent>,
        parameters: TransmissionParameters,
    ) -> Session {
        for message in &mut messages {
            message.set_token(token);
        }
        let head = messages.first();
        let is_observe = head.map(is_observe_registration).unwrap_or(false);
        let confirmable = head
            .map(|m| m.get_type() == MessageType::Confirmable)
            .unwrap_or(false);
        let deregister_template = if is_observe {
            head.cloned()
        } else {
            None
        };

        Session {
            token,
            confirmable,
            is_observe,
            queue: MessageQueue::preset(messages),
            state: SessionState::Idle,
            sink,
            received_blocks: BTreeMap::new(),
            expecting_block2: false,
            last_delivered_id: None,
            deregister_template,
            retransmit: None,
            parameters,
        }
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            SessionState::Completed | SessionState::Cancelled | SessionState::Failed
        )
    }

    /// Whether this message id belongs to one of our in-flight messages;
    /// used to route Empty ACK/RST messages that carry no token.
    pub(crate) fn matches_message_id(&self, message_id: u16) -> bool {
        self.queue.contains(message_id)
    }

    /// Put the queue front on the wire if it is not already there.  A
    /// confirmable front is armed for retransmission; a non-confirmable one
    /// is sent once and retired.
    pub(crate) fn pump(&mut self, now: Instant, rng: &mut impl Rng) -> Vec<Packet> {
        if self.is_terminal() {
            return Vec::new();
        }
        let front = match self.queue.next() {
            Some(front) => front.clone(),
            None => return Vec::new(),
        };
        if self
            .retransmit
            .as_ref()
            .is_some_and(|r| r.message_id == front.message_id)
        {
            return Vec::new();
        }

        if front.get_type() == MessageType::Confirmable {
            let timeout = rng.gen_range(self.parameters.ack_timeout_range());
            self.retransmit = Some(Retransmit {
                message_id: front.message_id,
                attempts: 0,
                timeout,
                due: now + timeout,
            });
        } else {
            self.queue.dequeue(front.message_id);
            self.retransmit = None;
        }
        self.state = SessionState::Sending;
        vec![front]
    }

    /// Periodic sweep: resend the front confirmable when its back-off
    /// expires, or fail the session once the retries are spent.
    pub(crate) fn tick(&mut self, now: Instant, rng: &mut impl Rng) -> Vec<Packet> {
        if self.is_terminal() {
            return Vec::new();
        }
        if let Some(retransmit) = &mut self.retransmit {
            if self.queue.contains(retransmit.message_id) {
                if now < retransmit.due {
                    return Vec::new();
                }
                if retransmit.attempts >= self.parameters.max_retransmit {
                    debug!(
                        "message {} on token {:#x} unacknowledged after {} attempts",
                        retransmit.message_id,
                        self.token,
                        retransmit.attempts + 1
                    );
                    self.fail(ClientError::TimedOut);
                    return Vec::new();
                }
                retransmit.attempts += 1;
                retransmit.timeout *= 2;
                retransmit.due = now + retransmit.timeout;
                let front = self
                    .queue
                    .next()
                    .expect("front still queued")
                    .clone();
                debug!(
                    "retransmission #{} of message {} to token {:#x}",
                    retransmit.attempts, front.message_id, self.token
                );
                return vec![front];
            }
            // the front was acknowledged since the last sweep
            self.retransmit = None;
        }
        self.pump(now, rng)
    }

    /// Drive the state machine with one decoded inbound message.  Returns
    /// the messages to put on the wire in response.
    pub(crate) fn handle_inbound(
        &mut self,
        packet: &Packet,
        block1_szx: &mut u8,
        rng: &mut impl Rng,
    ) -> Vec<Packet> {
        if self.is_terminal() {
            return Vec::new();
        }
        let mut outgoing = Vec::new();
        let duplicate = self.last_delivered_id == Some(packet.message_id);

        // a server-initiated CON is acked even when we drop it as a
        // duplicate: our previous ACK may have been lost
        if packet.get_type() == MessageType::Confirmable {
            outgoing.push(Packet::ack(packet.message_id));
        }
        if duplicate {
            trace!(
                "coalescing duplicate message {} on token {:#x}",
                packet.message_id,
                self.token
            );
            return outgoing;
        }

        if packet.get_type() == MessageType::Acknowledgement {
            if self.confirmable {
                self.queue.dequeue(packet.message_id);
                if self
                    .retransmit
                    .as_ref()
                    .is_some_and(|r| r.message_id == packet.message_id)
                {
                    self.retransmit = None;
                }
            }
            if packet.code.is_empty() {
                // separate-response pattern: the payload arrives later in
                // its own message, keep waiting
                self.state = SessionState::Awaiting;
                return outgoing;
            }
        }

        if packet.get_type() == MessageType::Reset {
            self.complete();
            return outgoing;
        }

        self.last_delivered_id = Some(packet.message_id);
        match packet.get_block2() {
            Some(block2) => {
                self.received_blocks.insert(block2.num, packet.payload.clone());
            }
            None => {
                self.received_blocks.insert(0, packet.payload.clone());
            }
        }
        let _ = self.sink.send(SessionEvent::Message(packet.clone()));
        self.state = SessionState::Awaiting;

        if let Some(block2) = packet.get_block2() {
            if block2.more {
                self.expecting_block2 = true;
                match BlockValue::new(block2.num + 1, false, block2.size_exponent) {
                    Ok(next) => {
                        let mut continuation = Packet::new();
                        continuation.set_type(if self.confirmable {
                            MessageType::Confirmable
                        } else {
                            MessageType::NonConfirmable
                        });
                        continuation.code = MessageClass::Request(RequestType::Get);
                        continuation.message_id = rng.gen();
                        continuation.set_token(self.token);
                        continuation.set_block2(next);
                        if self.confirmable {
                            self.queue.enqueue(continuation);
                        } else {
                            outgoing.push(continuation);
                        }
                    }
                    Err(err) => warn!("cannot request next block2: {err}"),
                }
            } else {
                self.expecting_block2 = false;
            }
        }

        if let Some(block1) = packet.get_block1() {
            *block1_szx = block1.size_exponent;
            if let Err(err) = self.queue.enqueue_block(block1.num + 1, block1.size_exponent, rng)
            {
                warn!("cannot cut next block1: {err}");
            }
        }

        if !self.is_observe && !self.expecting_block2 && self.queue.is_empty() {
            self.complete();
        }
        outgoing
    }

    /// Cooperative cancellation.  An observing session emits one NON
    /// deregister on its token; everything else just releases resources.
    pub(crate) fn cancel(&mut self, rng: &mut impl Rng) -> Option<Packet> {
        if self.is_terminal() {
            return None;
        }
        self.state = SessionState::Cancelled;
        self.queue.reset();
        let _ = self.sink.send(SessionEvent::Completed(Completion::Cancelled));

        let mut deregister = self.deregister_template.take()?;
        deregister.set_type(MessageType::NonConfirmable);
        deregister.message_id = rng.gen();
        deregister.set_observe(ObserveOption::Deregister);
        deregister.payload.clear();
        Some(deregister)
    }

    pub(crate) fn fail(&mut self, error: ClientError) {
        if self.is_terminal() {
            return;
        }
        self.state = SessionState::Failed;
        self.queue.reset();
        let _ = self
            .sink
            .send(SessionEvent::Completed(Completion::Failed(error)));
    }

    fn complete(&mut self) {
        self.state = SessionState::Completed;
        let payload = self.assemble();
        let _ = self
            .sink
            .send(SessionEvent::Completed(Completion::Finished { payload }));
    }

    /// NUM-ordered concatenation of the received block2 payloads; `None`
    /// when nothing arrived or a block is missing.
    fn assemble(&self) -> Option<Vec<u8>> {
        if self.received_blocks.is_empty() {
            return None;
        }
        let contiguous = self
            .received_blocks
            .keys()
            .enumerate()
            .all(|(i, &num)| num == i as u32);
        if !contiguous {
            return None;
        }
        Some(self.received_blocks.values().flatten().copied().collect())
    }
}
