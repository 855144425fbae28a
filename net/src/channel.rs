use std::{fmt, net::SocketAddr};

use thiserror::Error;

use actornet_shared::{ChannelId, ChannelKind, ErrorCode};

/// Lifecycle of one channel. `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Created,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ChannelState {
    /// Whether moving from `self` to `to` is a legal step.
    /// Every non-terminal state may jump straight to `Closed`.
    pub fn can_transition(self, to: ChannelState) -> bool {
        use ChannelState::*;
        match (self, to) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Created, Connecting) | (Connecting, Open) | (Open, Closing) => true,
            _ => false,
        }
    }

    /// Whether `send` may still enqueue bytes
    pub fn accepts_sends(self) -> bool {
        matches!(
            self,
            ChannelState::Created | ChannelState::Connecting | ChannelState::Open
        )
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Errors returned synchronously by channel and service operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("Channel {channel_id} does not exist")]
    NotFound { channel_id: ChannelId },

    #[error("Channel {channel_id} has failed with error {error} and accepts no further sends")]
    Failed {
        channel_id: ChannelId,
        error: ErrorCode,
    },

    #[error("Channel {channel_id} is {state} and accepts no further sends")]
    NotWritable {
        channel_id: ChannelId,
        state: ChannelState,
    },

    #[error("Frame of {length} bytes exceeds the maximum frame size of {max} bytes")]
    FrameTooLarge { length: usize, max: usize },

    #[error("Frame of {length} bytes is too short to hold a 2-byte opcode")]
    FrameTooShort { length: usize },

    #[error("Channel cannot move from {from} to {to}")]
    InvalidTransition { from: ChannelState, to: ChannelState },

    #[error("Service has been disposed")]
    ServiceDisposed,

    #[error("Failed to bind {address}: {message}")]
    Bind { address: SocketAddr, message: String },

    #[error("Transport runtime could not be started: {message}")]
    Runtime { message: String },
}

/// Bookkeeping for one channel, owned by its service
#[derive(Clone, Debug)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub kind: ChannelKind,
    pub remote: SocketAddr,
    state: ChannelState,
    error: ErrorCode,
}

impl ChannelInfo {
    pub fn new(id: ChannelId, kind: ChannelKind, remote: SocketAddr) -> Self {
        Self {
            id,
            kind,
            remote,
            state: ChannelState::Created,
            error: ErrorCode::NONE,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Non-zero once the channel has failed
    pub fn error(&self) -> ErrorCode {
        self.error
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    pub fn transition(&mut self, to: ChannelState) -> Result<(), ChannelError> {
        if !self.state.can_transition(to) {
            return Err(ChannelError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Steps a fresh or connecting channel forward to `Open`
    pub fn open(&mut self) -> Result<(), ChannelError> {
        if self.state == ChannelState::Created {
            self.transition(ChannelState::Connecting)?;
        }
        self.transition(ChannelState::Open)
    }

    /// Records a terminal error. Returns false if the channel already failed or
    /// closed, in which case nothing changes and no error event may be raised.
    pub fn fail(&mut self, error: ErrorCode) -> bool {
        if self.state == ChannelState::Closed {
            return false;
        }
        self.state = ChannelState::Closed;
        self.error = error;
        true
    }

    /// Ends the channel. An open channel passes through `Closing`, and only then
    /// is the peer owed a goodbye; the return value says whether it is.
    pub fn close(&mut self) -> bool {
        let orderly = self.transition(ChannelState::Closing).is_ok();
        self.state = ChannelState::Closed;
        orderly
    }

    /// Fails fast when the channel can no longer take sends
    pub fn check_writable(&self) -> Result<(), ChannelError> {
        if self.error.is_error() {
            return Err(ChannelError::Failed {
                channel_id: self.id,
                error: self.error,
            });
        }
        if !self.state.accepts_sends() {
            return Err(ChannelError::NotWritable {
                channel_id: self.id,
                state: self.state,
            });
        }
        Ok(())
    }
}

/// Checks a frame (opcode + body) against the configured maximum before it is queued
pub fn check_frame_size(frame: &[u8], max: usize) -> Result<(), ChannelError> {
    if frame.len() < actornet_shared::OPCODE_SIZE {
        return Err(ChannelError::FrameTooShort {
            length: frame.len(),
        });
    }
    if frame.len() > max {
        return Err(ChannelError::FrameTooLarge {
            length: frame.len(),
            max,
        });
    }
    Ok(())
}
