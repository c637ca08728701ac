use flate2::Compression;

/// Which side of the connection an endpoint plays, controlling the mask
/// direction matrix required by RFC 6455 section 5.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    /// Whether outbound frames produced by this role must be masked.
    pub fn masks_outbound(&self) -> bool {
        matches!(self, Role::Client)
    }

    /// Whether inbound frames received by this role are required to be masked.
    pub fn requires_masked_inbound(&self) -> bool {
        matches!(self, Role::Server)
    }
}

/// Negotiated permessage-deflate parameters and local compression tuning,
/// per RFC 7692.
#[derive(Debug, Clone)]
pub struct DeflateConfig {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: u8,
    pub client_max_window_bits: u8,
    pub compression_level: Compression,
    /// Payloads smaller than this are sent uncompressed; deflating tiny
    /// messages tends to grow them once framing overhead is included.
    pub compression_threshold: usize,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        DeflateConfig {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: 15,
            client_max_window_bits: 15,
            compression_level: Compression::fast(),
            compression_threshold: 32,
        }
    }
}

/// Tunables for an [`crate::endpoint::Endpoint`]: size limits and, optionally,
/// the negotiated extension parameters.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConfig {
    /// Maximum accumulated size, in bytes, of a single message (after any
    /// decompression). `None` means unbounded.
    pub max_message_size: Option<usize>,
    pub deflate: Option<DeflateConfig>,
}
