use thiserror::Error;

/// All errors produced by the cTCP transport.
#[derive(Debug, Error)]
pub enum CtcpError {
    #[error("segment too short: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("segment length field {0} is smaller than the header")]
    MalformedLength(u16),

    #[error("checksum mismatch: segment carries 0x{carried:04x}, computed 0x{computed:04x}")]
    ChecksumMismatch { carried: u16, computed: u16 },

    #[error("connection {0} is closed")]
    ConnectionClosed(u64),

    #[error("connection {0} not found")]
    ConnectionNotFound(u64),

    #[error("FIN already created for this connection")]
    FinAlreadySent,

    #[error("sequence space exhausted")]
    SequenceSpaceExhausted,

    #[error("maximum retransmissions ({retries}) exceeded for segment {seqno} on connection {conn}")]
    RetransmissionExhausted { conn: u64, seqno: u32, retries: u32 },

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("no tokio runtime available to run the sender task")]
    NoRuntime,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CtcpError {
    /// Whether the error describes a segment that failed validation on
    /// receipt. Such segments are dropped without an acknowledgment.
    pub fn is_invalid_segment(&self) -> bool {
        matches!(
            self,
            CtcpError::Truncated { .. }
                | CtcpError::MalformedLength(_)
                | CtcpError::ChecksumMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CtcpError>;
