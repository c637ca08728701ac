//! Parsing and formatting for the `Sec-WebSocket-Extensions` header grammar
//! (RFC 6455 section 9.1): a comma-separated list of extension offers, each an
//! extension token followed by semicolon-separated parameters that may carry a
//! bare-token or quoted-string value.

use std::fmt;

/// One `;`-separated extension offer, e.g. `permessage-deflate; client_max_window_bits`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOffer {
    pub name: String,
    pub params: Vec<(String, Option<String>)>,
}

impl ExtensionOffer {
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }
}

/// Parses the value of a `Sec-WebSocket-Extensions` header into its list of
/// offers. Malformed segments (empty extension name) are skipped rather than
/// failing the whole header, matching how permissive peers behave in practice.
pub fn parse_extensions_header(value: &str) -> Vec<ExtensionOffer> {
    value
        .split(',')
        .filter_map(|offer| parse_offer(offer.trim()))
        .collect()
}

fn parse_offer(offer: &str) -> Option<ExtensionOffer> {
    let mut parts = offer.split(';').map(str::trim);
    let name = parts.next()?;
    if name.is_empty() {
        return None;
    }

    let mut params = Vec::new();
    for part in parts {
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((key, value)) => {
                let key = key.trim().to_string();
                let value = unquote(value.trim()).to_string();
                params.push((key, Some(value)));
            }
            None => params.push((part.to_string(), None)),
        }
    }

    Some(ExtensionOffer {
        name: name.to_string(),
        params,
    })
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Formats a list of offers back into a header value, quoting parameter
/// values that contain characters not safe as a bare token.
pub fn format_extensions_header(offers: &[ExtensionOffer]) -> String {
    let mut formatted = String::new();
    for (i, offer) in offers.iter().enumerate() {
        if i > 0 {
            formatted.push_str(", ");
        }
        write_offer(&mut formatted, offer);
    }
    formatted
}

fn write_offer(out: &mut String, offer: &ExtensionOffer) {
    out.push_str(&offer.name);
    for (key, value) in &offer.params {
        out.push_str("; ");
        out.push_str(key);
        if let Some(value) = value {
            out.push('=');
            if needs_quoting(value) {
                out.push('"');
                out.push_str(value);
                out.push('"');
            } else {
                out.push_str(value);
            }
        }
    }
}

fn needs_quoting(value: &str) -> bool {
    !value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
}

impl fmt::Display for ExtensionOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::new();
        write_offer(&mut s, self);
        f.write_str(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_extension() {
        let offers = parse_extensions_header("permessage-deflate");
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].name, "permessage-deflate");
        assert!(offers[0].params.is_empty());
    }

    #[test]
    fn parses_parameters_with_and_without_values() {
        let offers = parse_extensions_header(
            "permessage-deflate; client_no_context_takeover; server_max_window_bits=10",
        );
        let offer = &offers[0];
        assert_eq!(offer.param("client_no_context_takeover"), Some(None));
        assert_eq!(offer.param("server_max_window_bits"), Some(Some("10")));
    }

    #[test]
    fn parses_quoted_values() {
        let offers = parse_extensions_header("permessage-deflate; server_max_window_bits=\"12\"");
        assert_eq!(offers[0].param("server_max_window_bits"), Some(Some("12")));
    }

    #[test]
    fn parses_multiple_offers() {
        let offers = parse_extensions_header("permessage-deflate, x-webkit-deflate-frame");
        assert_eq!(offers.len(), 2);
        assert_eq!(offers[1].name, "x-webkit-deflate-frame");
    }

    #[test]
    fn format_round_trips_through_parse() {
        let offers = parse_extensions_header("permessage-deflate; client_max_window_bits=12");
        let formatted = format_extensions_header(&offers);
        let reparsed = parse_extensions_header(&formatted);
        assert_eq!(offers, reparsed);
    }
}
