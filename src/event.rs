use crate::error::Error;
use crate::message::Message;

/// Events an [`crate::endpoint::Endpoint`] surfaces to its consumer, in
/// delivery order, via [`crate::endpoint::Endpoint::next_event`].
#[derive(Debug)]
pub enum Event {
    /// The endpoint has transitioned to the OPEN state.
    Open,
    /// A complete message was received.
    Message(Message),
    /// A ping was received; the endpoint has already emitted the pong reply.
    Ping(Vec<u8>),
    /// A pong was received (either solicited or unsolicited).
    Pong(Vec<u8>),
    /// The endpoint finished closing. Emitted exactly once per lifetime.
    Close { code: u16, reason: String },
    /// A protocol or I/O error occurred; the endpoint is closing or closed.
    Error { source: Error, close_code: Option<u16> },
}

/// Internal events produced by the [`crate::receiver::Receiver`] state
/// machine, consumed by the endpoint before being translated into the
/// public [`Event`] variants above (e.g. a `Ping` triggers an autoreply
/// before the endpoint surfaces it to the user).
#[derive(Debug)]
pub(crate) enum RecvEvent {
    Message(Message),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close { code: Option<u16>, reason: String },
}
