//! Error types for the MIL-STD-1553B bus interface engine

use thiserror::Error;

/// Result type for bus interface operations
pub type Result<T> = std::result::Result<T, BiuError>;

/// Reason an instruction-table line failed to compile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CompileErrorKind {
    /// The same label appears on more than one line
    DuplicateLabel,
    /// A branch references a label that no line carries
    UnresolvedLabel,
    /// A branch or skip was given an operand of zero
    ZeroOperand,
    /// Transfer id outside the descriptor area
    TransferOutOfRange,
    /// The table does not fit the instruction area at the requested offset
    DestinationOverflow,
    /// Unknown opcode in the table
    UnknownOpcode,
}

impl std::fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            CompileErrorKind::DuplicateLabel => "duplicate label",
            CompileErrorKind::UnresolvedLabel => "unresolved label",
            CompileErrorKind::ZeroOperand => "operand must not be zero",
            CompileErrorKind::TransferOutOfRange => "transfer id out of range",
            CompileErrorKind::DestinationOverflow => "destination exceeds instruction area",
            CompileErrorKind::UnknownOpcode => "unknown opcode",
        };
        f.write_str(text)
    }
}

/// Failure of the underlying command transport
///
/// Kept apart from [`BiuError`] so that a dropped link is never confused with
/// a protocol-level status code returned by the device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The remote side did not answer
    #[error("Transport timed out")]
    Timeout,

    /// The link is gone
    #[error("Transport disconnected: {0}")]
    Disconnected(String),

    /// A frame could not be decoded
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// Error types reported by the bus interface engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BiuError {
    /// A definition parameter is outside its legal range
    #[error("Parameter {position} ({field}) not in range: {value}")]
    ParamOutOfRange {
        /// One-based parameter position in the definition call
        position: u8,
        /// Name of the offending field
        field: &'static str,
        /// Rejected value
        value: u32,
    },

    /// Instruction-table compilation failed
    #[error("Compile error at line {line}: {kind}")]
    Compile {
        /// Zero-based table index of the first failing line
        line: usize,
        /// What went wrong
        kind: CompileErrorKind,
    },

    /// No transfer is defined for this id
    #[error("Transfer {0} is not defined")]
    UndefinedTransfer(u16),

    /// No buffer header is defined for this id
    #[error("Buffer header {0} is not defined")]
    UndefinedHeader(u16),

    /// No minor frame is defined for this id
    #[error("Minor frame {0} is not defined")]
    UndefinedFrame(u16),

    /// Access outside device memory
    #[error("Address 0x{0:08X} out of range")]
    AddressOutOfRange(u32),

    /// A region of device memory cannot hold what was asked of it
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Operation not allowed in the current engine state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Polling for a device status bit ran past its deadline
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// A built-in test phase failed
    #[error("BITE failure in phase {phase}, sub-code {sub_code}")]
    BiteFailure {
        /// Test phase (board enable, memory region, transfer, timing)
        phase: u8,
        /// Step within the phase that failed
        sub_code: u8,
    },

    /// Command frame could not be interpreted
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Configuration is inconsistent or could not be parsed
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The device rejected a command; carries the acknowledged status code
    #[error("Device status 0x{code:X}: {message}")]
    Device {
        /// Status code from the acknowledge
        code: u32,
        /// Text sent with the acknowledge
        message: String,
    },

    /// The transport failed before a status code was received
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl BiuError {
    /// Create a new ParamOutOfRange error
    pub fn param(position: u8, field: &'static str, value: impl Into<u32>) -> Self {
        BiuError::ParamOutOfRange {
            position,
            field,
            value: value.into(),
        }
    }

    /// Create a new Compile error
    pub fn compile(line: usize, kind: CompileErrorKind) -> Self {
        BiuError::Compile { line, kind }
    }

    /// Create a new ResourceExhausted error
    pub fn exhausted(msg: impl Into<String>) -> Self {
        BiuError::ResourceExhausted(msg.into())
    }

    /// Create a new InvalidState error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        BiuError::InvalidState(msg.into())
    }

    /// Create a new Timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        BiuError::Timeout(msg.into())
    }

    /// Create a new BiteFailure error
    pub fn bite(phase: u8, sub_code: u8) -> Self {
        BiuError::BiteFailure { phase, sub_code }
    }

    /// Create a new InvalidCommand error
    pub fn invalid_command(msg: impl Into<String>) -> Self {
        BiuError::InvalidCommand(msg.into())
    }

    /// Create a new Config error
    pub fn config(msg: impl Into<String>) -> Self {
        BiuError::Config(msg.into())
    }

    /// Status code carried in a command acknowledge
    ///
    /// Zero is reserved for success. Transport failures have no status code
    /// because they never reach the device.
    pub fn status_code(&self) -> u32 {
        match self {
            BiuError::ParamOutOfRange { position, .. } => 0x100 | *position as u32,
            BiuError::Compile { .. } => 0x200,
            BiuError::UndefinedTransfer(_) => 0x301,
            BiuError::UndefinedHeader(_) => 0x302,
            BiuError::UndefinedFrame(_) => 0x303,
            BiuError::AddressOutOfRange(_) => 0x401,
            BiuError::ResourceExhausted(_) => 0x402,
            BiuError::InvalidState(_) => 0x501,
            BiuError::Timeout(_) => 0x502,
            BiuError::BiteFailure { .. } => 0x600,
            BiuError::InvalidCommand(_) => 0x701,
            BiuError::Config(_) => 0x801,
            BiuError::Device { code, .. } => *code,
            BiuError::Transport(_) => 0xFFFF_FFFF,
        }
    }
}
