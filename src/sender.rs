//! The outbound half of the protocol core: a pure framer that turns logical
//! send operations into wire-format byte buffers. Owns no socket; the
//! endpoint hands the returned buffers to the socket itself.

use log::trace;
use rand::Rng;

use crate::close;
use crate::config::Role;
use crate::deflate::Deflator;
use crate::error::Error;
use crate::frame::{apply_mask, encode_header, OpCode};

#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    pub binary: bool,
    pub compress: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        SendOptions { binary: false, compress: true }
    }
}

pub struct Sender {
    role: Role,
    deflator: Option<Deflator>,
    /// Tracks whether the next frame of the current outbound message should
    /// use a data opcode (first fragment) or `Continuation`.
    message_in_progress: bool,
}

impl Sender {
    pub fn new(role: Role, deflator: Option<Deflator>) -> Self {
        Sender { role, deflator, message_in_progress: false }
    }

    fn mask_key() -> [u8; 4] {
        rand::rng().random()
    }

    /// Frames one fragment of a message. `fin` marks the final fragment;
    /// passing `fin = false` repeatedly streams a message as a sequence of
    /// `Continuation` frames. Compression, when enabled, only ever applies to
    /// the first fragment of an atomic (non-streamed) message, matching the
    /// RSV1-on-first-frame-only rule.
    pub fn frame_message(&mut self, payload: &[u8], fin: bool, opts: SendOptions) -> Result<Vec<u8>, Error> {
        let is_first_fragment = !self.message_in_progress;
        let opcode = if is_first_fragment {
            if opts.binary { OpCode::Binary } else { OpCode::Text }
        } else {
            OpCode::Continuation
        };

        let mut rsv1 = false;
        let mut out_payload = payload.to_vec();
        if is_first_fragment && opts.compress {
            if let Some(deflator) = self.deflator.as_mut() {
                if deflator.should_compress(payload.len()) {
                    out_payload = deflator.compress(payload)?;
                    rsv1 = true;
                }
            }
        }

        trace!("framing {opcode:?} fin={fin} rsv1={rsv1} len={}", out_payload.len());
        let frame = self.build_frame(fin, rsv1, opcode, &out_payload);
        self.message_in_progress = !fin;
        Ok(frame)
    }

    pub fn frame_ping(&self, payload: &[u8]) -> Vec<u8> {
        self.build_frame(true, false, OpCode::Ping, payload)
    }

    pub fn frame_pong(&self, payload: &[u8]) -> Vec<u8> {
        self.build_frame(true, false, OpCode::Pong, payload)
    }

    pub fn frame_close(&self, code: Option<u16>, reason: &str) -> Vec<u8> {
        let payload = match code {
            Some(code) => {
                let mut p = code.to_be_bytes().to_vec();
                p.extend_from_slice(reason.as_bytes());
                p
            }
            None => Vec::new(),
        };
        self.build_frame(true, false, OpCode::Close, &payload)
    }

    fn build_frame(&self, fin: bool, rsv1: bool, opcode: OpCode, payload: &[u8]) -> Vec<u8> {
        let masked = self.role.masks_outbound();
        let mut out = encode_header(fin, rsv1, opcode, masked, payload.len());

        if masked {
            let key = Self::mask_key();
            out.extend_from_slice(&key);
            let mut masked_payload = payload.to_vec();
            apply_mask(&mut masked_payload, key, 0);
            out.extend_from_slice(&masked_payload);
        } else {
            out.extend_from_slice(payload);
        }
        out
    }
}

/// Close codes outbound code is allowed to send locally: the standard
/// application-initiated codes plus the registered range. 1006 and 1005
/// are local-only sentinels and must never be framed onto the wire.
pub fn is_valid_outbound_code(code: u16) -> bool {
    code != close::ABNORMAL_CLOSURE && code != close::NO_STATUS_RECEIVED && close::is_valid_received_code(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::Receiver;
    use crate::event::RecvEvent;
    use crate::message::Message;

    #[test]
    fn client_masked_frame_round_trips_through_receiver() {
        let mut sender = Sender::new(Role::Client, None);
        let frame = sender
            .frame_message(b"hi", true, SendOptions { binary: false, compress: false })
            .unwrap();

        assert_eq!(frame[0], 0x81);
        assert_eq!(frame[1] & 0x80, 0x80);

        let mut receiver = Receiver::new(Role::Server, None, None);
        receiver.add(&frame).unwrap();
        match receiver.poll_event().unwrap() {
            RecvEvent::Message(Message::Text(s)) => assert_eq!(s, "hi"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn server_frames_are_unmasked() {
        let mut sender = Sender::new(Role::Server, None);
        let frame = sender
            .frame_message(b"hi", true, SendOptions { binary: false, compress: false })
            .unwrap();
        assert_eq!(frame[1] & 0x80, 0);
    }

    #[test]
    fn streamed_message_uses_continuation_frames() {
        let mut sender = Sender::new(Role::Server, None);
        let first = sender
            .frame_message(b"hel", false, SendOptions { binary: true, compress: false })
            .unwrap();
        let last = sender
            .frame_message(b"lo", true, SendOptions { binary: true, compress: false })
            .unwrap();
        assert_eq!(first[0] & 0x0F, OpCode::Binary.as_u8());
        assert_eq!(first[0] & 0x80, 0);
        assert_eq!(last[0] & 0x0F, OpCode::Continuation.as_u8());
        assert_eq!(last[0] & 0x80, 0x80);
    }

    #[test]
    fn close_frame_encodes_code_and_reason() {
        let sender = Sender::new(Role::Server, None);
        let frame = sender.frame_close(Some(1000), "bye");
        assert_eq!(frame[0], 0x88);
        assert_eq!(&frame[2..4], &1000u16.to_be_bytes());
        assert_eq!(&frame[4..], b"bye");
    }
}
