//! permessage-deflate (RFC 7692): negotiation of extension parameters and the
//! streaming DEFLATE codec used to compress/decompress message payloads.

use crate::config::{DeflateConfig, Role};
use crate::error::Error;
use crate::extensions::ExtensionOffer;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

pub const EXTENSION_NAME: &str = "permessage-deflate";

const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Negotiates permessage-deflate from a parsed extension offer, from the point
/// of view of `role`. Returns `Ok(None)` when the offer's name doesn't match
/// permessage-deflate at all (the caller should try the next offer); returns
/// `Err` when the offer names permessage-deflate but carries a parameter this
/// implementation can't honor. On success, returns the effective extension
/// session: `config`'s local preferences (compression level, threshold) with
/// the four negotiable parameters overridden by whatever the offer requested.
pub fn negotiate(
    offer: &ExtensionOffer,
    role: Role,
    config: &DeflateConfig,
) -> Result<Option<DeflateConfig>, Error> {
    if !offer.name.eq_ignore_ascii_case(EXTENSION_NAME) {
        return Ok(None);
    }

    let mut session = config.clone();

    for (key, value) in &offer.params {
        match key.as_str() {
            "server_no_context_takeover" => session.server_no_context_takeover = true,
            "client_no_context_takeover" => session.client_no_context_takeover = true,
            "server_max_window_bits" => {
                session.server_max_window_bits = parse_window_bits(value.as_deref(), role == Role::Server)?
                    .unwrap_or(session.server_max_window_bits);
            }
            "client_max_window_bits" => {
                session.client_max_window_bits = parse_window_bits(value.as_deref(), true)?
                    .unwrap_or(session.client_max_window_bits);
            }
            other => {
                return Err(Error::ExtensionNegotiation(format!(
                    "unsupported permessage-deflate parameter: {other}"
                )))
            }
        }
    }

    Ok(Some(session))
}

/// `value_required` is false only for `server_max_window_bits` appearing
/// bare in a client *offer* (meaning "any"); every other position requires a
/// concrete value once the parameter is present at all.
fn parse_window_bits(value: Option<&str>, value_required: bool) -> Result<Option<u8>, Error> {
    match value {
        None if value_required => Err(Error::InvalidMaxWindowBits),
        None => Ok(None),
        Some(raw) => {
            let bits: u8 = raw.parse().map_err(|_| Error::InvalidMaxWindowBits)?;
            if (8..=15).contains(&bits) {
                Ok(Some(bits))
            } else {
                Err(Error::InvalidMaxWindowBits)
            }
        }
    }
}

/// zlib's deflate implementation treats a window of 2^8 as 2^9, so request one
/// extra bit to get the window size the peer actually asked for.
fn effective_window_bits(bits: u8) -> u8 {
    if bits == 8 {
        9
    } else {
        bits
    }
}

/// Builds the compressor/decompressor pair for one endpoint from its role and
/// the negotiated session, picking the window bits and context-takeover flag
/// that apply to each direction per RFC 7692 section 7.
pub fn build_codecs(role: Role, session: &DeflateConfig) -> (Deflator, Inflator) {
    let (send_window_bits, send_reset, recv_window_bits, recv_reset) = match role {
        Role::Server => (
            session.server_max_window_bits,
            session.server_no_context_takeover,
            session.client_max_window_bits,
            session.client_no_context_takeover,
        ),
        Role::Client => (
            session.client_max_window_bits,
            session.client_no_context_takeover,
            session.server_max_window_bits,
            session.server_no_context_takeover,
        ),
    };

    (
        Deflator::new(
            send_window_bits,
            session.compression_level,
            send_reset,
            session.compression_threshold,
        ),
        Inflator::new(recv_window_bits, recv_reset),
    )
}

/// Owns the compressor used for one direction of a connection.
pub struct Deflator {
    compress: Compress,
    reset_after_message: bool,
    threshold: usize,
}

impl Deflator {
    pub fn new(window_bits: u8, level: Compression, reset_after_message: bool, threshold: usize) -> Self {
        Deflator {
            compress: Compress::new_with_window_bits(level, false, effective_window_bits(window_bits)),
            reset_after_message,
            threshold,
        }
    }

    /// Whether a payload of this length should be deflated at all; payloads
    /// below the configured threshold are sent as-is since framing overhead
    /// tends to make them larger once compressed.
    pub fn should_compress(&self, payload_len: usize) -> bool {
        payload_len >= self.threshold
    }

    /// Compresses a full message payload, stripping the trailing empty
    /// deflate block (`00 00 FF FF`) that a sync flush always appends.
    pub fn compress(&mut self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let mut output = Vec::with_capacity(payload.len());
        stream_compress(&mut self.compress, payload, &mut output)?;
        debug_assert!(output.ends_with(&DEFLATE_TRAILER));
        output.truncate(output.len() - DEFLATE_TRAILER.len());

        if self.reset_after_message {
            self.compress.reset();
        }
        Ok(output)
    }
}

/// Owns the decompressor used for one direction of a connection.
pub struct Inflator {
    decompress: Decompress,
    reset_after_message: bool,
}

impl Inflator {
    pub fn new(window_bits: u8, reset_after_message: bool) -> Self {
        Inflator {
            decompress: Decompress::new_with_window_bits(false, effective_window_bits(window_bits)),
            reset_after_message,
        }
    }

    /// Decompresses one message's compressed payload, re-appending the
    /// `00 00 FF FF` trailer the sender stripped before framing. Enforces
    /// `max_message_size` while inflating so a maliciously small compressed
    /// payload can't expand to unbounded memory.
    pub fn decompress(&mut self, payload: &[u8], max_message_size: Option<usize>) -> Result<Vec<u8>, Error> {
        let mut input = Vec::with_capacity(payload.len() + DEFLATE_TRAILER.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&DEFLATE_TRAILER);

        let mut output = Vec::with_capacity(payload.len() * 2);
        stream_decompress(&mut self.decompress, &input, &mut output, max_message_size)?;

        if self.reset_after_message {
            self.decompress.reset(false);
        }
        Ok(output)
    }
}

fn stream_compress(compress: &mut Compress, input: &[u8], output: &mut Vec<u8>) -> Result<(), Error> {
    let mut chunk = [0u8; 8192];
    loop {
        let consumed_so_far = compress.total_in() as usize;
        let before_out = compress.total_out();
        let status = compress
            .compress(&input[consumed_so_far..], &mut chunk, FlushCompress::Sync)
            .map_err(|e| Error::CompressionFailure(e.to_string()))?;
        let produced = (compress.total_out() - before_out) as usize;
        output.extend_from_slice(&chunk[..produced]);

        let done_consuming = compress.total_in() as usize >= input.len();
        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                if done_consuming && produced == 0 {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn stream_decompress(
    decompress: &mut Decompress,
    input: &[u8],
    output: &mut Vec<u8>,
    max_message_size: Option<usize>,
) -> Result<(), Error> {
    let mut chunk = [0u8; 8192];
    loop {
        let before_in = decompress.total_in();
        let before_out = decompress.total_out();
        let status = decompress
            .decompress(&input[before_in as usize..], &mut chunk, FlushDecompress::Sync)
            .map_err(|e| Error::DecompressionFailure(e.to_string()))?;
        let produced = (decompress.total_out() - before_out) as usize;
        output.extend_from_slice(&chunk[..produced]);

        if let Some(limit) = max_message_size {
            if output.len() > limit {
                return Err(Error::MaxMessageSize);
            }
        }

        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                if decompress.total_in() as usize >= input.len() && produced == 0 {
                    break;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec_pair(window_bits: u8) -> (Deflator, Inflator) {
        (
            Deflator::new(window_bits, Compression::fast(), false, 0),
            Inflator::new(window_bits, false),
        )
    }

    #[test]
    fn compress_then_decompress_round_trips() {
        let (mut deflator, mut inflator) = codec_pair(15);
        let payload = "a".repeat(4096).into_bytes();
        let compressed = deflator.compress(&payload).unwrap();
        assert!(compressed.len() < payload.len());
        let decompressed = inflator.decompress(&compressed, None).unwrap();
        assert_eq!(decompressed, payload);
    }

    #[test]
    fn context_takeover_reset_still_round_trips() {
        let mut deflator = Deflator::new(10, Compression::fast(), true, 0);
        let mut inflator = Inflator::new(10, true);
        for msg in ["first message", "second, unrelated message"] {
            let compressed = deflator.compress(msg.as_bytes()).unwrap();
            let decompressed = inflator.decompress(&compressed, None).unwrap();
            assert_eq!(decompressed, msg.as_bytes());
        }
    }

    #[test]
    fn decompression_enforces_max_message_size() {
        let (mut deflator, mut inflator) = codec_pair(15);
        let payload = vec![0u8; 1 << 16];
        let compressed = deflator.compress(&payload).unwrap();
        let result = inflator.decompress(&compressed, Some(1024));
        assert!(result.is_err());
    }

    #[test]
    fn deflator_skips_payloads_below_threshold() {
        let deflator = Deflator::new(15, Compression::fast(), false, 32);
        assert!(!deflator.should_compress(10));
        assert!(deflator.should_compress(32));
    }

    #[test]
    fn negotiate_rejects_unknown_parameter() {
        let offer = ExtensionOffer {
            name: EXTENSION_NAME.to_string(),
            params: vec![("not_a_real_param".to_string(), None)],
        };
        let result = negotiate(&offer, Role::Server, &DeflateConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn negotiate_rejects_out_of_range_window_bits() {
        let offer = ExtensionOffer {
            name: EXTENSION_NAME.to_string(),
            params: vec![("client_max_window_bits".to_string(), Some("20".to_string()))],
        };
        let result = negotiate(&offer, Role::Server, &DeflateConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn negotiate_ignores_non_matching_offer() {
        let offer = ExtensionOffer {
            name: "x-webkit-deflate-frame".to_string(),
            params: vec![],
        };
        let result = negotiate(&offer, Role::Server, &DeflateConfig::default()).unwrap();
        assert!(result.is_none());
    }
}
