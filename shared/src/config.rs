use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while validating configuration at start-up
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A size or count that must be non-zero was zero
    #[error("Configuration value `{field}` must be greater than zero")]
    Zero { field: &'static str },

    /// Two related values are inconsistent
    #[error("Configuration value `{field}` ({value}) must not exceed `{limit_field}` ({limit})")]
    Exceeds {
        field: &'static str,
        value: u64,
        limit_field: &'static str,
        limit: u64,
    },

    /// A transport that needs an address to listen on was given none
    #[error("Transport {transport} requires a listen address but none was configured")]
    MissingListenAddress { transport: &'static str },
}

fn non_zero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::Zero { field })
    } else {
        Ok(())
    }
}

fn not_exceeding(
    field: &'static str,
    value: u64,
    limit_field: &'static str,
    limit: u64,
) -> Result<(), ConfigError> {
    if value > limit {
        Err(ConfigError::Exceeds {
            field,
            value,
            limit_field,
            limit,
        })
    } else {
        Ok(())
    }
}

/// Settings for the reliable-message (UDP) transport
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReliableConfig {
    /// Largest UDP datagram sent, headers included
    pub mtu: usize,
    /// Retransmission timeout for the first resend of a segment
    pub initial_rto: Duration,
    /// Upper bound for the exponential retransmission back-off
    pub max_rto: Duration,
    /// A segment resent this many times without an ack kills the channel
    pub max_retransmits: u32,
    /// Segments in flight before further messages are queued
    pub send_window: usize,
    /// Interval between SYN resends while connecting
    pub syn_interval: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            mtu: 1400,
            initial_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(3),
            max_retransmits: 20,
            send_window: 128,
            syn_interval: Duration::from_millis(300),
        }
    }
}

impl ReliableConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // room for the MSG header and the PUSH segment header plus at least one byte
        if self.mtu <= 19 {
            return Err(ConfigError::Zero { field: "reliable.mtu" });
        }
        non_zero("reliable.initial_rto", self.initial_rto.as_millis() as u64)?;
        not_exceeding(
            "reliable.initial_rto",
            self.initial_rto.as_millis() as u64,
            "reliable.max_rto",
            self.max_rto.as_millis() as u64,
        )?;
        non_zero("reliable.max_retransmits", self.max_retransmits as u64)?;
        non_zero("reliable.send_window", self.send_window as u64)?;
        non_zero("reliable.syn_interval", self.syn_interval.as_millis() as u64)?;
        Ok(())
    }
}

/// Settings shared by every transport
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Largest frame (opcode + body) accepted or sent
    pub max_frame_size: usize,
    /// Chunk size of the ring buffers used by stream channels
    pub chunk_size: usize,
    /// Outgoing connects, and accepted reliable channels, fail after this long
    pub connect_timeout: Duration,
    pub reliable: ReliableConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 64 * 1024,
            chunk_size: 8192,
            connect_timeout: Duration::from_secs(20),
            reliable: ReliableConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("transport.max_frame_size", self.max_frame_size as u64)?;
        not_exceeding(
            "transport.max_frame_size",
            self.max_frame_size as u64,
            "u32::MAX",
            u32::MAX as u64,
        )?;
        non_zero("transport.chunk_size", self.chunk_size as u64)?;
        non_zero(
            "transport.connect_timeout",
            self.connect_timeout.as_millis() as u64,
        )?;
        self.reliable.validate()
    }
}

/// Liveness supervision of sessions
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How often every session is checked for idleness
    pub idle_check_interval: Duration,
    /// A session with neither sends nor receives for this long is disposed
    pub idle_timeout: Duration,
    /// An accepted session that receives nothing for this long is disposed
    pub accept_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_check_interval: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(30),
            accept_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero(
            "session.idle_check_interval",
            self.idle_check_interval.as_millis() as u64,
        )?;
        non_zero("session.idle_timeout", self.idle_timeout.as_millis() as u64)?;
        non_zero(
            "session.accept_timeout",
            self.accept_timeout.as_millis() as u64,
        )?;
        not_exceeding(
            "session.idle_check_interval",
            self.idle_check_interval.as_millis() as u64,
            "session.idle_timeout",
            self.idle_timeout.as_millis() as u64,
        )
    }
}

/// Everything a fiber needs to know to start
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FiberConfig {
    /// Process this fiber belongs to, compared against `ActorId::process`
    pub process: u32,
    pub session: SessionConfig,
    pub transport: TransportConfig,
}

impl FiberConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()?;
        self.transport.validate()
    }
}
