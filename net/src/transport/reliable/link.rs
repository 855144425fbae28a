use std::collections::{BTreeMap, VecDeque};

use thiserror::Error;

use actornet_shared::{wrapping_diff, ErrorCode, Millis, TransportConfig};

use super::packet::{PacketError, Segment, MSG_HEADER_SIZE, PUSH_HEADER_SIZE};

/// Most fragments one message may be split into
pub const MAX_FRAGMENTS: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("Message of {length} bytes needs {fragments} fragments, more than the {MAX_FRAGMENTS} allowed")]
    TooManyFragments { length: usize, fragments: usize },

    #[error("Segment {sn} was sent {transmits} times without being acknowledged")]
    RetransmitLimit { sn: u32, transmits: u32 },

    #[error("Reassembled message of {length} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { length: usize, max: usize },

    #[error(transparent)]
    Packet(#[from] PacketError),
}

impl LinkError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            LinkError::TooManyFragments { .. } | LinkError::MessageTooLarge { .. } => {
                ErrorCode::PACKET_TOO_LARGE
            }
            LinkError::RetransmitLimit { .. } => ErrorCode::RELIABLE_TIMEOUT,
            LinkError::Packet(_) => ErrorCode::DECODE_FAILED,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LinkSettings {
    /// Largest data payload of one PUSH segment
    pub mss: usize,
    pub initial_rto: Millis,
    pub max_rto: Millis,
    pub max_retransmits: u32,
    pub window: usize,
    pub max_message_size: usize,
}

impl LinkSettings {
    pub fn from_config(config: &TransportConfig) -> Self {
        let reliable = &config.reliable;
        Self {
            mss: reliable
                .mtu
                .saturating_sub(MSG_HEADER_SIZE + PUSH_HEADER_SIZE)
                .max(1),
            initial_rto: reliable.initial_rto.as_millis() as Millis,
            max_rto: reliable.max_rto.as_millis() as Millis,
            max_retransmits: reliable.max_retransmits,
            window: reliable.send_window,
            max_message_size: config.max_frame_size,
        }
    }
}

struct InFlight {
    segment: Vec<u8>,
    resend_at: Millis,
    rto: Millis,
    transmits: u32,
}

/// Retransmission state of one reliable channel.
///
/// Messages are split into numbered PUSH segments, at most `window` of them
/// unacknowledged at a time. Each PUSH is acknowledged individually; the
/// receiver reorders by sequence number and reassembles fragments before
/// delivering whole messages in send order.
pub struct ReliableLink {
    settings: LinkSettings,
    next_sn: u32,
    waiting: VecDeque<(u32, Vec<u8>)>,
    in_flight: BTreeMap<u32, InFlight>,
    rcv_next: u32,
    rcv_buf: BTreeMap<u32, (u8, Vec<u8>)>,
    assembly: Vec<u8>,
    outgoing: VecDeque<Vec<u8>>,
    delivered: VecDeque<Vec<u8>>,
}

impl ReliableLink {
    pub fn new(settings: LinkSettings) -> Self {
        Self {
            settings,
            next_sn: 0,
            waiting: VecDeque::new(),
            in_flight: BTreeMap::new(),
            rcv_next: 0,
            rcv_buf: BTreeMap::new(),
            assembly: Vec::new(),
            outgoing: VecDeque::new(),
            delivered: VecDeque::new(),
        }
    }

    /// Splits a message into segments queued behind the send window
    pub fn queue_message(&mut self, message: &[u8]) -> Result<(), LinkError> {
        let fragments = message.len().div_ceil(self.settings.mss).max(1);
        if fragments > MAX_FRAGMENTS {
            return Err(LinkError::TooManyFragments {
                length: message.len(),
                fragments,
            });
        }
        let mut chunks: Vec<&[u8]> = message.chunks(self.settings.mss).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        for (index, data) in chunks.into_iter().enumerate() {
            let sn = self.next_sn;
            self.next_sn = self.next_sn.wrapping_add(1);
            let segment = Segment::Push {
                sn,
                fragments_left: (fragments - 1 - index) as u8,
                data: data.to_vec(),
            };
            self.waiting.push_back((sn, segment.encode()));
        }
        Ok(())
    }

    /// Moves queued segments into the window, transmitting them
    pub fn flush(&mut self, now: Millis) {
        while self.in_flight.len() < self.settings.window {
            let Some((sn, segment)) = self.waiting.pop_front() else {
                break;
            };
            self.outgoing.push_back(segment.clone());
            self.in_flight.insert(
                sn,
                InFlight {
                    segment,
                    resend_at: now + self.settings.initial_rto,
                    rto: self.settings.initial_rto,
                    transmits: 1,
                },
            );
        }
    }

    /// Retransmits overdue segments with exponential back-off
    pub fn update(&mut self, now: Millis) -> Result<(), LinkError> {
        self.flush(now);
        for (sn, entry) in self.in_flight.iter_mut() {
            if entry.resend_at > now {
                continue;
            }
            if entry.transmits > self.settings.max_retransmits {
                return Err(LinkError::RetransmitLimit {
                    sn: *sn,
                    transmits: entry.transmits,
                });
            }
            entry.transmits += 1;
            entry.rto = (entry.rto * 2).min(self.settings.max_rto);
            entry.resend_at = now + entry.rto;
            self.outgoing.push_back(entry.segment.clone());
        }
        Ok(())
    }

    /// Handles one segment received from the peer
    pub fn on_segment(&mut self, bytes: &[u8], now: Millis) -> Result<(), LinkError> {
        match Segment::decode(bytes)? {
            Segment::Ack { sn } => {
                self.in_flight.remove(&sn);
                self.flush(now);
            }
            Segment::Push {
                sn,
                fragments_left,
                data,
            } => {
                let distance = wrapping_diff(self.rcv_next, sn);
                if distance < 0 {
                    // already delivered; the earlier ack was lost
                    self.outgoing.push_back(Segment::Ack { sn }.encode());
                    return Ok(());
                }
                if distance as usize >= self.settings.window * 2 {
                    // ahead of the receive window, the sender will retransmit
                    return Ok(());
                }
                self.outgoing.push_back(Segment::Ack { sn }.encode());
                self.rcv_buf.entry(sn).or_insert((fragments_left, data));
                self.reassemble()?;
            }
        }
        Ok(())
    }

    fn reassemble(&mut self) -> Result<(), LinkError> {
        while let Some((fragments_left, data)) = self.rcv_buf.remove(&self.rcv_next) {
            self.rcv_next = self.rcv_next.wrapping_add(1);
            self.assembly.extend_from_slice(&data);
            if self.assembly.len() > self.settings.max_message_size {
                return Err(LinkError::MessageTooLarge {
                    length: self.assembly.len(),
                    max: self.settings.max_message_size,
                });
            }
            if fragments_left == 0 {
                self.delivered.push_back(std::mem::take(&mut self.assembly));
            }
        }
        Ok(())
    }

    /// Next encoded segment to put on the wire
    pub fn pop_outgoing(&mut self) -> Option<Vec<u8>> {
        self.outgoing.pop_front()
    }

    /// Next complete message received
    pub fn pop_delivered(&mut self) -> Option<Vec<u8>> {
        self.delivered.pop_front()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }
}
