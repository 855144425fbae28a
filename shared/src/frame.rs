use thiserror::Error;

use crate::{error_code::ErrorCode, ring_buffer::RingBuffer, types::Opcode};

/// Bytes taken by the little-endian length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;
/// Bytes taken by the opcode every frame starts with
pub const OPCODE_SIZE: usize = 2;

/// Errors raised while framing a byte stream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Declared or actual frame length exceeds the configured maximum
    #[error("Frame of {length} bytes exceeds the maximum frame size of {max} bytes")]
    TooLarge { length: usize, max: usize },

    /// Frame is too short to contain an opcode
    #[error("Frame of {length} bytes is too short to hold a 2-byte opcode")]
    TooShort { length: usize },
}

impl FrameError {
    /// Channel error code reported when a receiver hits this error
    pub fn error_code(&self) -> ErrorCode {
        match self {
            FrameError::TooLarge { .. } => ErrorCode::PACKET_TOO_LARGE,
            FrameError::TooShort { .. } => ErrorCode::DECODE_FAILED,
        }
    }
}

/// Reads the opcode at the start of a de-framed message
pub fn peek_opcode(frame: &[u8]) -> Result<Opcode, FrameError> {
    if frame.len() < OPCODE_SIZE {
        return Err(FrameError::TooShort {
            length: frame.len(),
        });
    }
    Ok(u16::from_le_bytes([frame[0], frame[1]]))
}

/// Appends one length-prefixed frame to `buffer`
pub fn write_frame(buffer: &mut RingBuffer, frame: &[u8], max: usize) -> Result<(), FrameError> {
    check_length(frame.len(), max)?;
    buffer.write(&(frame.len() as u32).to_le_bytes());
    buffer.write(frame);
    Ok(())
}

/// Length-prefixes a frame into a fresh vector
pub fn encode_frame(frame: &[u8], max: usize) -> Result<Vec<u8>, FrameError> {
    check_length(frame.len(), max)?;
    let mut bytes = Vec::with_capacity(LENGTH_PREFIX_SIZE + frame.len());
    bytes.extend_from_slice(&(frame.len() as u32).to_le_bytes());
    bytes.extend_from_slice(frame);
    Ok(bytes)
}

fn check_length(length: usize, max: usize) -> Result<(), FrameError> {
    if length < OPCODE_SIZE {
        return Err(FrameError::TooShort { length });
    }
    if length > max {
        return Err(FrameError::TooLarge { length, max });
    }
    Ok(())
}

/// Pulls complete `[length][opcode][body]` frames out of a receive buffer.
///
/// Keeps the length of a frame whose header was read but whose body has not
/// fully arrived yet, so a partially received frame is not re-parsed.
pub struct FrameParser {
    max_frame_size: usize,
    pending_length: Option<usize>,
}

impl FrameParser {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            pending_length: None,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Returns the next frame (opcode + body, without the length prefix) once
    /// all of its bytes are buffered. `Ok(None)` means more bytes are needed.
    pub fn parse(&mut self, buffer: &mut RingBuffer) -> Result<Option<Vec<u8>>, FrameError> {
        let length = match self.pending_length {
            Some(length) => length,
            None => {
                if buffer.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }
                let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
                buffer
                    .read_into(&mut prefix)
                    .map_err(|_| FrameError::TooShort { length: 0 })?;
                let length = u32::from_le_bytes(prefix) as usize;
                check_length(length, self.max_frame_size)?;
                self.pending_length = Some(length);
                length
            }
        };

        if buffer.len() < length {
            return Ok(None);
        }
        self.pending_length = None;
        let frame = buffer
            .read(length)
            .map_err(|_| FrameError::TooShort { length })?;
        Ok(Some(frame))
    }

    /// Parses every complete frame currently buffered
    pub fn parse_all(&mut self, buffer: &mut RingBuffer) -> Result<Vec<Vec<u8>>, FrameError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.parse(buffer)? {
            frames.push(frame);
        }
        Ok(frames)
    }
}
