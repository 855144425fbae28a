use thiserror::Error;

use actornet_shared::ErrorCode;

pub const SYN: u8 = 1;
pub const ACK: u8 = 2;
pub const FIN: u8 = 3;
pub const MSG: u8 = 4;

/// Bytes before the segment in a MSG datagram
pub const MSG_HEADER_SIZE: usize = 9;

pub const SEGMENT_PUSH: u8 = 0;
pub const SEGMENT_ACK: u8 = 1;
/// Bytes before the data in a PUSH segment
pub const PUSH_HEADER_SIZE: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("Datagram is empty")]
    Empty,
    #[error("Datagram flag {flag} is not a known packet type")]
    UnknownFlag { flag: u8 },
    #[error("Datagram of {length} bytes is too short for packet type {flag}")]
    Truncated { flag: u8, length: usize },
    #[error("Segment kind {kind} is not known")]
    UnknownSegment { kind: u8 },
}

/// One datagram of the reliable-message handshake or data stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Syn {
        connector: u32,
    },
    Ack {
        acceptor: u32,
        connector: u32,
    },
    Fin {
        sender: u32,
        receiver: u32,
        error: ErrorCode,
    },
    Msg {
        sender: u32,
        receiver: u32,
        segment: Vec<u8>,
    },
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        match self {
            Packet::Syn { connector } => {
                bytes.push(SYN);
                bytes.extend_from_slice(&connector.to_le_bytes());
                bytes.extend_from_slice(&0u32.to_le_bytes());
            }
            Packet::Ack {
                acceptor,
                connector,
            } => {
                bytes.push(ACK);
                bytes.extend_from_slice(&acceptor.to_le_bytes());
                bytes.extend_from_slice(&connector.to_le_bytes());
            }
            Packet::Fin {
                sender,
                receiver,
                error,
            } => {
                bytes.push(FIN);
                bytes.extend_from_slice(&sender.to_le_bytes());
                bytes.extend_from_slice(&receiver.to_le_bytes());
                bytes.extend_from_slice(&error.0.to_le_bytes());
            }
            Packet::Msg {
                sender,
                receiver,
                segment,
            } => {
                bytes.reserve(MSG_HEADER_SIZE + segment.len());
                bytes.push(MSG);
                bytes.extend_from_slice(&sender.to_le_bytes());
                bytes.extend_from_slice(&receiver.to_le_bytes());
                bytes.extend_from_slice(segment);
            }
        }
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Packet, PacketError> {
        let flag = *bytes.first().ok_or(PacketError::Empty)?;
        let needed = match flag {
            SYN | ACK | MSG => 9,
            FIN => 13,
            flag => return Err(PacketError::UnknownFlag { flag }),
        };
        if bytes.len() < needed {
            return Err(PacketError::Truncated {
                flag,
                length: bytes.len(),
            });
        }
        let first = read_u32(&bytes[1..5]);
        let second = read_u32(&bytes[5..9]);
        Ok(match flag {
            SYN => Packet::Syn { connector: first },
            ACK => Packet::Ack {
                acceptor: first,
                connector: second,
            },
            FIN => Packet::Fin {
                sender: first,
                receiver: second,
                error: ErrorCode(i32::from_le_bytes([bytes[9], bytes[10], bytes[11], bytes[12]])),
            },
            _ => Packet::Msg {
                sender: first,
                receiver: second,
                segment: bytes[MSG_HEADER_SIZE..].to_vec(),
            },
        })
    }
}

/// Unit of the retransmission protocol carried inside a MSG
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// `fragments_left` counts fragments of the same message after this one
    Push {
        sn: u32,
        fragments_left: u8,
        data: Vec<u8>,
    },
    Ack {
        sn: u32,
    },
}

impl Segment {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Segment::Push {
                sn,
                fragments_left,
                data,
            } => {
                let mut bytes = Vec::with_capacity(PUSH_HEADER_SIZE + data.len());
                bytes.push(SEGMENT_PUSH);
                bytes.extend_from_slice(&sn.to_le_bytes());
                bytes.push(*fragments_left);
                bytes.extend_from_slice(data);
                bytes
            }
            Segment::Ack { sn } => {
                let mut bytes = Vec::with_capacity(5);
                bytes.push(SEGMENT_ACK);
                bytes.extend_from_slice(&sn.to_le_bytes());
                bytes
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Segment, PacketError> {
        let kind = *bytes.first().ok_or(PacketError::Empty)?;
        match kind {
            SEGMENT_PUSH => {
                if bytes.len() < PUSH_HEADER_SIZE {
                    return Err(PacketError::Truncated {
                        flag: MSG,
                        length: bytes.len(),
                    });
                }
                Ok(Segment::Push {
                    sn: read_u32(&bytes[1..5]),
                    fragments_left: bytes[5],
                    data: bytes[PUSH_HEADER_SIZE..].to_vec(),
                })
            }
            SEGMENT_ACK => {
                if bytes.len() < 5 {
                    return Err(PacketError::Truncated {
                        flag: MSG,
                        length: bytes.len(),
                    });
                }
                Ok(Segment::Ack {
                    sn: read_u32(&bytes[1..5]),
                })
            }
            kind => Err(PacketError::UnknownSegment { kind }),
        }
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
