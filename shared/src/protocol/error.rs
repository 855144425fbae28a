use thiserror::Error;

use crate::{message::MessageClass, types::Opcode};

/// Errors that can occur during protocol operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Protocol is locked and cannot be modified
    #[error("Protocol is already locked and cannot be modified. Protocol.lock() has been called and no further changes are allowed")]
    AlreadyLocked,

    /// Two registrations claim the same opcode
    #[error("Opcode {opcode} is registered twice: first by {existing}, again by {duplicate}")]
    DuplicateOpcode {
        opcode: Opcode,
        existing: String,
        duplicate: String,
    },

    /// A request/response pair was declared with classes that do not answer each other
    #[error("{name} (opcode {opcode}) has class {actual:?} but {expected:?} was required")]
    ClassMismatch {
        opcode: Opcode,
        name: &'static str,
        expected: MessageClass,
        actual: MessageClass,
    },
}
