use thiserror::Error;

/// All errors produced by a tunnelled virtual connection.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid frame header: 0x{0:02x}")]
    InvalidFrameHeader(u8),

    #[error("invalid frame length: {0}")]
    InvalidFrameLength(u16),

    #[error("join request too short: {0} bytes")]
    JoinRequestTooShort(usize),

    #[error("rewritten join request too long: {0} bytes")]
    JoinRequestTooLong(usize),

    #[error("string field is not NUL-terminated")]
    UnterminatedString,

    #[error("user name {0:?} is reserved")]
    ReservedName(String),

    #[error("destination port {0} is not allowed")]
    PortNotAllowed(u16),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
