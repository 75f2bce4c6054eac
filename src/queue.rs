use std::collections::{HashSet, VecDeque};

use rand::Rng;

use crate::packet::{BlockValue, MessageError, ObserveOption, Packet};
use crate::request::CoapRequest;

/// Ordered queue of a session's outgoing messages with acknowledgement
/// bookkeeping.  Two variants: `Preset` replays a caller-provided message
/// list verbatim (the caller owns chunking), `Dynamic` renders messages from
/// a logical request on demand, slicing the payload into block1-sized cuts.
#[derive(Debug)]
pub(crate) enum MessageQueue {
    Preset(PresetQueue),
    Dynamic(DynamicQueue),
}

#[derive(Debug)]
pub(crate) struct PresetQueue {
    messages: Vec<Packet>,
    acknowledged: HashSet<u16>,
}

#[derive(Debug)]
pub(crate) struct DynamicQueue {
    request: CoapRequest,
    token: u64,
    pending: VecDeque<Packet>,
    payload_cursor: usize,
}

impl MessageQueue {
    pub(crate) fn preset(messages: Vec<Packet>) -> MessageQueue {
        MessageQueue::Preset(PresetQueue {
            messages,
            acknowledged: HashSet::new(),
        })
    }

    pub(crate) fn dynamic(request: CoapRequest, token: u64) -> MessageQueue {
        MessageQueue::Dynamic(DynamicQueue {
            request,
            token,
            pending: VecDeque::new(),
            payload_cursor: 0,
        })
    }

    /// The message that should currently be on the wire, if any.
    pub(crate) fn next(&self) -> Option<&Packet> {
        match self {
            MessageQueue::Preset(q) => q
                .messages
                .iter()
                .find(|m| !q.acknowledged.contains(&m.message_id)),
            MessageQueue::Dynamic(q) => q.pending.front(),
        }
    }

    /// Acknowledge (and so retire) the message with this id.
    pub(crate) fn dequeue(&mut self, message_id: u16) {
        match self {
            MessageQueue::Preset(q) => {
                if q.messages.iter().any(|m| m.message_id == message_id) {
                    q.acknowledged.insert(message_id);
                }
            }
            MessageQueue::Dynamic(q) => q.pending.retain(|m| m.message_id != message_id),
        }
    }

    pub(crate) fn enqueue(&mut self, packet: Packet) {
        match self {
            MessageQueue::Preset(q) => q.messages.push(packet),
            MessageQueue::Dynamic(q) => q.pending.push_back(packet),
        }
    }

    /// Render and queue the outgoing message for block `num`.  A no-op for
    /// preset queues and for a dynamic queue whose payload is fully cut.
    pub(crate) fn enqueue_block(
        &mut self,
        num: u32,
        szx: u8,
        rng: &mut impl Rng,
    ) -> Result<(), MessageError> {
        let q = match self {
            MessageQueue::Preset(_) => return Ok(()),
            MessageQueue::Dynamic(q) => q,
        };

        let block_size = BlockValue::new(0, false, szx)?.size();
        let payload = &q.request.payload;

        if num == 0 {
            let mut head = q.request.to_packet(q.token, rng.gen());
            if q.request.observe {
                head.set_observe(ObserveOption::Register);
            }
            if payload.len() > block_size {
                head.payload = payload[..block_size].to_vec();
                head.set_block1(BlockValue::new(0, true, szx)?);
                q.payload_cursor = block_size;
            } else {
                head.payload = payload.clone();
                q.payload_cursor = payload.len();
            }
            q.pending.push_back(head);
            return Ok(());
        }

        if q.payload_cursor >= payload.len() {
            return Ok(());
        }
        let end = (q.payload_cursor + block_size).min(payload.len());
        let mut packet = q.request.to_packet(q.token, rng.gen());
        packet.payload = payload[q.payload_cursor..end].to_vec();
        packet.set_block1(BlockValue::new(num, end < payload.len(), szx)?);
        q.payload_cursor = end;
        q.pending.push_back(packet);
        Ok(())
    }

    pub(crate) fn contains(&self, message_id: u16) -> bool {
        match self {
            MessageQueue::Preset(q) => q
                .messages
                .iter()
                .any(|m| m.message_id == message_id && !q.acknowledged.contains(&message_id)),
            MessageQueue::Dynamic(q) => q.pending.iter().any(|m| m.message_id == message_id),
        }
    }

    pub(crate) fn reset(&mut self) {
        match self {
            MessageQueue::Preset(q) => {
                q.messages.clear();
                q.acknowledged.clear();
            }
            MessageQueue::Dynamic(q) => {
                q.pending.clear();
                q.payload_cursor = 0;
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.next().is_none()
    }
}
