//! Close code constants (RFC 6455 section 7.4) and the validation rule for
//! codes a peer is allowed to send on the wire.

pub const NORMAL: u16 = 1000;
pub const GOING_AWAY: u16 = 1001;
pub const PROTOCOL_ERROR: u16 = 1002;
pub const UNSUPPORTED_DATA: u16 = 1003;
pub const NO_STATUS_RECEIVED: u16 = 1005;
pub const ABNORMAL_CLOSURE: u16 = 1006;
pub const INVALID_PAYLOAD: u16 = 1007;
pub const POLICY_VIOLATION: u16 = 1008;
pub const MESSAGE_TOO_BIG: u16 = 1009;
pub const MANDATORY_EXTENSION: u16 = 1010;
pub const INTERNAL_ERROR: u16 = 1011;

/// Whether a peer is permitted to send this code on the wire (RFC 6455
/// section 7.4.2 plus the 3000-4999 application/library-registered range).
pub fn is_valid_received_code(code: u16) -> bool {
    matches!(code, NORMAL | GOING_AWAY | PROTOCOL_ERROR | UNSUPPORTED_DATA)
        || (INVALID_PAYLOAD..=INTERNAL_ERROR).contains(&code)
        || (3000..=4999).contains(&code)
}
