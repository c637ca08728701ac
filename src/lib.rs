//! Core WebSocket protocol machinery for the Tokio stack.
//!
//! This crate implements the parts of [RFC 6455](https://datatracker.ietf.org/doc/html/rfc6455)
//! that sit below the HTTP upgrade handshake: frame parsing and
//! reassembly, masking, fragmentation, the closing handshake, and the
//! [RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692) permessage-deflate
//! extension. It does not perform the HTTP upgrade itself — callers hand it
//! an already-upgraded, duplex byte stream (a `TcpStream`, a TLS stream, an
//! in-memory pipe for tests) and it takes over framing from there.

pub mod close;
pub mod config;
pub mod deflate;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod extensions;
pub mod frame;
pub mod message;
pub mod receiver;
pub mod sender;
