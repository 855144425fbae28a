use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable numeric reason a channel, session or rpc ended.
///
/// Codes below [`ErrorCode::RPC_BOUNDARY`] come from the transport layer and
/// always terminate the channel; codes at or above it are carried inside
/// responses and only fail the single call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const NONE: ErrorCode = ErrorCode(0);

    // transport
    pub const PEER_DISCONNECT: ErrorCode = ErrorCode(100);
    pub const SOCKET_ERROR: ErrorCode = ErrorCode(101);
    pub const CONNECT_FAILED: ErrorCode = ErrorCode(102);
    pub const CONNECT_TIMEOUT: ErrorCode = ErrorCode(103);
    pub const PACKET_TOO_LARGE: ErrorCode = ErrorCode(104);
    pub const DECODE_FAILED: ErrorCode = ErrorCode(105);
    pub const RELIABLE_TIMEOUT: ErrorCode = ErrorCode(106);
    pub const ACCEPT_TIMEOUT: ErrorCode = ErrorCode(107);
    pub const SERVICE_DISPOSED: ErrorCode = ErrorCode(108);
    pub const CHANNEL_NOT_FOUND: ErrorCode = ErrorCode(109);

    // session liveness
    pub const SESSION_IDLE_TIMEOUT: ErrorCode = ErrorCode(200);
    pub const SESSION_ACCEPT_TIMEOUT: ErrorCode = ErrorCode(201);
    pub const SESSION_DISPOSED: ErrorCode = ErrorCode(202);

    pub const RPC_BOUNDARY: i32 = 100_000;

    // rpc / application
    pub const RPC_FAIL: ErrorCode = ErrorCode(100_001);
    pub const HANDLER_NOT_FOUND: ErrorCode = ErrorCode(100_002);
    pub const ACTOR_NOT_FOUND: ErrorCode = ErrorCode(100_003);
    pub const ACTOR_UNROUTABLE: ErrorCode = ErrorCode(100_004);

    pub fn is_error(self) -> bool {
        self.0 != 0
    }

    /// Whether this code was produced by an rpc handler rather than the transport
    pub fn is_rpc_error(self) -> bool {
        self.0 >= Self::RPC_BOUNDARY
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::NONE => "none",
            Self::PEER_DISCONNECT => "peer disconnect",
            Self::SOCKET_ERROR => "socket error",
            Self::CONNECT_FAILED => "connect failed",
            Self::CONNECT_TIMEOUT => "connect timeout",
            Self::PACKET_TOO_LARGE => "packet too large",
            Self::DECODE_FAILED => "decode failed",
            Self::RELIABLE_TIMEOUT => "reliable link timeout",
            Self::ACCEPT_TIMEOUT => "accept timeout",
            Self::SERVICE_DISPOSED => "service disposed",
            Self::CHANNEL_NOT_FOUND => "channel not found",
            Self::SESSION_IDLE_TIMEOUT => "session idle timeout",
            Self::SESSION_ACCEPT_TIMEOUT => "session accept timeout",
            Self::SESSION_DISPOSED => "session disposed",
            Self::RPC_FAIL => "rpc failed",
            Self::HANDLER_NOT_FOUND => "handler not found",
            Self::ACTOR_NOT_FOUND => "actor not found",
            Self::ACTOR_UNROUTABLE => "actor unroutable",
            _ => "application error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

impl From<i32> for ErrorCode {
    fn from(code: i32) -> Self {
        ErrorCode(code)
    }
}
