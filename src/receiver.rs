//! The inbound half of the protocol core: a pure state machine that consumes
//! byte chunks of arbitrary size and boundary and emits, in order, the
//! logical WebSocket events (complete messages, ping/pong, close). It owns no
//! socket; callers `add()` bytes as they arrive and `poll_event()` to drain
//! whatever became ready.

use std::collections::VecDeque;

use log::{debug, trace, warn};

use crate::close;
use crate::config::Role;
use crate::deflate::Inflator;
use crate::error::Error;
use crate::event::RecvEvent;
use crate::frame::OpCode;
use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    Len16,
    Len64,
    MaskKey,
    Payload,
}

struct PendingFrame {
    fin: bool,
    rsv1: bool,
    opcode: OpCode,
    masked: bool,
    mask_key: [u8; 4],
    payload_len: usize,
    payload: Vec<u8>,
}

struct MessageAssembly {
    opcode: OpCode,
    compressed: bool,
    data: Vec<u8>,
}

pub struct Receiver {
    role: Role,
    max_message_size: Option<usize>,
    inflator: Option<Inflator>,
    buf: Vec<u8>,
    state: State,
    pending: Option<PendingFrame>,
    message: Option<MessageAssembly>,
    events: VecDeque<RecvEvent>,
    terminated: bool,
}

impl Receiver {
    pub fn new(role: Role, max_message_size: Option<usize>, inflator: Option<Inflator>) -> Self {
        Receiver {
            role,
            max_message_size,
            inflator,
            buf: Vec::new(),
            state: State::Header,
            pending: None,
            message: None,
            events: VecDeque::new(),
            terminated: false,
        }
    }

    /// Appends a chunk of bytes read from the socket and parses as many
    /// complete frames as are now available. Non-blocking, tolerates splits
    /// at any byte boundary (including mid-header and mid-payload), and is a
    /// no-op once the receiver has terminated (on error or after `cleanup`).
    pub fn add(&mut self, chunk: &[u8]) -> Result<(), Error> {
        if self.terminated || chunk.is_empty() {
            return Ok(());
        }
        self.buf.extend_from_slice(chunk);

        loop {
            match self.advance() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    self.terminated = true;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Pops the next decoded event in arrival order, or `None` if nothing is
    /// ready yet.
    pub(crate) fn poll_event(&mut self) -> Option<RecvEvent> {
        self.events.pop_front()
    }

    /// Releases buffers and puts the receiver in a terminal state; further
    /// `add` calls become no-ops.
    pub fn cleanup(&mut self) {
        self.terminated = true;
        self.buf.clear();
        self.buf.shrink_to_fit();
        self.pending = None;
        self.message = None;
        self.events.clear();
    }

    /// Tries to make one unit of parsing progress. Returns `Ok(true)` if the
    /// state machine advanced (and should be called again), `Ok(false)` if
    /// more bytes are needed before it can proceed.
    fn advance(&mut self) -> Result<bool, Error> {
        match self.state {
            State::Header => self.advance_header(),
            State::Len16 => self.advance_len16(),
            State::Len64 => self.advance_len64(),
            State::MaskKey => self.advance_mask_key(),
            State::Payload => self.advance_payload(),
        }
    }

    fn advance_header(&mut self) -> Result<bool, Error> {
        if self.buf.len() < 2 {
            return Ok(false);
        }
        let b0 = self.buf[0];
        let b1 = self.buf[1];
        self.buf.drain(..2);

        let fin = b0 & 0x80 != 0;
        let rsv1 = b0 & 0x40 != 0;
        let rsv2 = b0 & 0x20 != 0;
        let rsv3 = b0 & 0x10 != 0;
        let opcode = OpCode::from_u8(b0 & 0x0F)?;

        if rsv2 || rsv3 || (rsv1 && self.inflator.is_none()) {
            warn!("rejecting frame with reserved bits set, opcode={opcode:?}");
            return Err(Error::ReservedBitsSet);
        }
        if opcode == OpCode::Continuation && rsv1 {
            // RSV1 only ever marks the first frame of a compressed message.
            return Err(Error::ReservedBitsSet);
        }

        let masked = b1 & 0x80 != 0;
        if masked != self.role.requires_masked_inbound() {
            warn!("rejecting frame with wrong mask direction for role {:?}", self.role);
            return Err(Error::MaskDirectionViolation);
        }

        let len7 = b1 & 0x7F;
        if opcode.is_control() {
            if !fin {
                return Err(Error::ControlFramesFragmented);
            }
            if len7 > 125 {
                return Err(Error::ControlFramePayloadSize);
            }
        }

        self.pending = Some(PendingFrame {
            fin,
            rsv1,
            opcode,
            masked,
            mask_key: [0; 4],
            payload_len: 0,
            payload: Vec::new(),
        });

        trace!("decoded header: fin={fin} rsv1={rsv1} opcode={opcode:?} masked={masked} len7={len7}");

        self.state = match len7 {
            126 => State::Len16,
            127 => State::Len64,
            n => {
                self.finish_length(n as usize)?;
                if masked {
                    State::MaskKey
                } else {
                    State::Payload
                }
            }
        };
        Ok(true)
    }

    fn advance_len16(&mut self) -> Result<bool, Error> {
        if self.buf.len() < 2 {
            return Ok(false);
        }
        let bytes: [u8; 2] = self.buf[..2].try_into().unwrap();
        self.buf.drain(..2);
        self.finish_length(u16::from_be_bytes(bytes) as usize)?;
        self.state = if self.pending.as_ref().unwrap().masked {
            State::MaskKey
        } else {
            State::Payload
        };
        Ok(true)
    }

    fn advance_len64(&mut self) -> Result<bool, Error> {
        if self.buf.len() < 8 {
            return Ok(false);
        }
        let bytes: [u8; 8] = self.buf[..8].try_into().unwrap();
        self.buf.drain(..8);
        let len = u64::from_be_bytes(bytes);
        if len & (1 << 63) != 0 {
            return Err(Error::InvalidLengthEncoding);
        }
        self.finish_length(len as usize)?;
        self.state = if self.pending.as_ref().unwrap().masked {
            State::MaskKey
        } else {
            State::Payload
        };
        Ok(true)
    }

    fn advance_mask_key(&mut self) -> Result<bool, Error> {
        if self.buf.len() < 4 {
            return Ok(false);
        }
        let key: [u8; 4] = self.buf[..4].try_into().unwrap();
        self.buf.drain(..4);
        self.pending.as_mut().unwrap().mask_key = key;
        self.state = State::Payload;
        Ok(true)
    }

    fn advance_payload(&mut self) -> Result<bool, Error> {
        let pending = self.pending.as_mut().unwrap();
        let remaining = pending.payload_len - pending.payload.len();
        if remaining == 0 {
            return self.dispatch_pending();
        }
        if self.buf.is_empty() {
            return Ok(false);
        }

        let take = remaining.min(self.buf.len());
        let start = pending.payload.len();
        pending.payload.extend_from_slice(&self.buf[..take]);
        if pending.masked {
            crate::frame::apply_mask(&mut pending.payload[start..], pending.mask_key, start);
        }
        self.buf.drain(..take);

        if pending.payload.len() == pending.payload_len {
            self.dispatch_pending()
        } else {
            Ok(false)
        }
    }

    /// Records the declared payload length and, per the frame-header-time
    /// bound, rejects an oversized message before a single payload byte is
    /// read (so an attacker can't force a large allocation with a single
    /// declared length).
    fn finish_length(&mut self, len: usize) -> Result<(), Error> {
        let pending = self.pending.as_mut().unwrap();
        pending.payload_len = len;
        pending.payload.reserve(len.min(1 << 20));

        if let Some(limit) = self.max_message_size {
            let so_far = if pending.opcode == OpCode::Continuation {
                self.message.as_ref().map(|m| m.data.len()).unwrap_or(0)
            } else {
                0
            };
            if so_far.saturating_add(len) > limit {
                return Err(Error::MaxMessageSize);
            }
        }
        Ok(())
    }

    fn dispatch_pending(&mut self) -> Result<bool, Error> {
        let frame = self.pending.take().unwrap();
        self.state = State::Header;

        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.message.is_some() {
                    return Err(Error::FragmentedInProgress);
                }
                if frame.fin {
                    self.finalize_message(frame.opcode, frame.rsv1, frame.payload)?;
                } else {
                    self.message = Some(MessageAssembly {
                        opcode: frame.opcode,
                        compressed: frame.rsv1,
                        data: frame.payload,
                    });
                }
            }
            OpCode::Continuation => {
                let assembly = self
                    .message
                    .as_mut()
                    .ok_or(Error::InvalidContinuationFrame)?;
                assembly.data.extend_from_slice(&frame.payload);
                if frame.fin {
                    let assembly = self.message.take().unwrap();
                    self.finalize_message(assembly.opcode, assembly.compressed, assembly.data)?;
                }
            }
            OpCode::Close => self.dispatch_close(frame.payload)?,
            OpCode::Ping => self.events.push_back(RecvEvent::Ping(frame.payload)),
            OpCode::Pong => self.events.push_back(RecvEvent::Pong(frame.payload)),
        }
        Ok(true)
    }

    fn finalize_message(&mut self, opcode: OpCode, compressed: bool, data: Vec<u8>) -> Result<(), Error> {
        let bytes = if compressed {
            let inflator = self.inflator.as_mut().ok_or(Error::ExtensionNotNegotiated)?;
            inflator.decompress(&data, self.max_message_size)?
        } else {
            data
        };

        debug!("dispatching {opcode:?} message of {} bytes (compressed={compressed})", bytes.len());
        let message = match opcode {
            OpCode::Binary => Message::Binary(bytes),
            OpCode::Text => Message::Text(String::from_utf8(bytes)?),
            _ => unreachable!("finalize_message only called for data opcodes"),
        };
        self.events.push_back(RecvEvent::Message(message));
        Ok(())
    }

    fn dispatch_close(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        if payload.is_empty() {
            self.events.push_back(RecvEvent::Close { code: None, reason: String::new() });
            return Ok(());
        }
        if payload.len() == 1 {
            return Err(Error::BadClosePayload);
        }
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        if !close::is_valid_received_code(code) {
            return Err(Error::InvalidCloseCode(code));
        }
        let reason = String::from_utf8(payload[2..].to_vec())?;
        self.events.push_back(RecvEvent::Close { code: Some(code), reason });
        Ok(())
    }
}
