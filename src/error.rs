use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;

/// Errors surfaced anywhere in the core: framing, extension negotiation, I/O, or
/// misuse of the public endpoint API. Protocol-level variants carry the close code
/// RFC 6455 maps them to, via [`Error::close_code`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("{source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    #[error("{source}")]
    FromUtf8Error {
        #[from]
        source: FromUtf8Error,
    },

    #[error("channel communication error")]
    CommunicationError,

    // Framing errors
    #[error("reserved bit set without a negotiated extension")]
    ReservedBitsSet,

    #[error("invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    #[error("control frames must not be fragmented")]
    ControlFramesFragmented,

    #[error("control frame with invalid payload size, must not be greater than 125")]
    ControlFramePayloadSize,

    #[error("frame length used a non-minimal or invalid encoding")]
    InvalidLengthEncoding,

    #[error("max message size reached")]
    MaxMessageSize,

    #[error("incoming fragmented message but there is one already in progress")]
    FragmentedInProgress,

    #[error("invalid continuation frame: no fragmented message to continue")]
    InvalidContinuationFrame,

    #[error("close frame payload is malformed")]
    BadClosePayload,

    #[error("close code {0} is not permitted on the wire")]
    InvalidCloseCode(u16),

    #[error("frame masking direction violates the endpoint's role")]
    MaskDirectionViolation,

    // Extension errors
    #[error("permessage-deflate payload failed to decompress: {0}")]
    DecompressionFailure(String),

    #[error("permessage-deflate payload failed to compress: {0}")]
    CompressionFailure(String),

    #[error("permessage-deflate extension was not negotiated")]
    ExtensionNotNegotiated,

    #[error("permessage-deflate negotiation failed: {0}")]
    ExtensionNegotiation(String),

    #[error("max_window_bits should be a value between 8 and 15")]
    InvalidMaxWindowBits,

    // Endpoint usage errors
    #[error("endpoint is not open")]
    NotOpen,

    #[error("endpoint is closed")]
    Closed,
}

impl Error {
    /// The RFC 6455 close code this error maps to when the endpoint closes the
    /// connection because of it, or `None` for errors that never reach the wire
    /// (negotiation failures at upgrade time, user-facing misuse errors).
    pub fn close_code(&self) -> Option<u16> {
        use Error::*;
        match self {
            ReservedBitsSet
            | InvalidOpcode(_)
            | ControlFramesFragmented
            | ControlFramePayloadSize
            | InvalidLengthEncoding
            | FragmentedInProgress
            | InvalidContinuationFrame
            | BadClosePayload
            | InvalidCloseCode(_)
            | MaskDirectionViolation => Some(1002),
            FromUtf8Error { .. } | DecompressionFailure(_) | ExtensionNotNegotiated => Some(1007),
            MaxMessageSize => Some(1009),
            CompressionFailure(_) | CommunicationError => Some(1011),
            IOError { .. } => Some(1006),
            ExtensionNegotiation(_) | InvalidMaxWindowBits | NotOpen | Closed => None,
        }
    }
}
