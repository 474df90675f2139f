//! Kerberos message encryption envelope.
//!
//! With Kerberos, SOAP bodies travel as a two-part MIME-like document:
//!
//! ```text
//! --Encrypted Boundary\r\n
//! \tContent-Type: application/HTTP-Kerberos-session-encrypted\r\n
//! \tOriginalContent: type=application/soap+xml;charset=UTF-8;Length=<n>\r\n
//! --Encrypted Boundary\r\n
//! \tContent-Type: application/octet-stream\r\n
//! <u32 LE header length><GSS wrap header><encrypted data>--Encrypted Boundary--\r\n
//! ```

use crate::error::{Error, Result};

use super::kerberos::WrappedMessage;

pub const BOUNDARY_MARKER: &[u8] = b"--Encrypted Boundary";

pub const ENCRYPTED_CONTENT_TYPE: &str = "multipart/encrypted;\
protocol=\"application/HTTP-Kerberos-session-encrypted\";boundary=\"Encrypted Boundary\"";

const SESSION_PART: &str = "\tContent-Type: application/HTTP-Kerberos-session-encrypted\r\n";
const OCTET_STREAM_PART: &[u8] = b"\tContent-Type: application/octet-stream\r\n";
const LENGTH_PREFIX: &[u8] = b"Length=";
const CLOSING_MARKER: &[u8] = b"--Encrypted Boundary--";

/// Whether a body is wrapped in the encryption envelope.
pub fn is_encrypted(body: &[u8]) -> bool {
    body.starts_with(BOUNDARY_MARKER)
}

/// Wrap an encrypted message in the envelope.
pub fn encode_envelope(original_length: usize, message: &WrappedMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.header.len() + message.data.len() + 256);
    out.extend_from_slice(BOUNDARY_MARKER);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(SESSION_PART.as_bytes());
    out.extend_from_slice(
        format!(
            "\tOriginalContent: type=application/soap+xml;charset=UTF-8;Length={}\r\n",
            original_length
        )
        .as_bytes(),
    );
    out.extend_from_slice(BOUNDARY_MARKER);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(OCTET_STREAM_PART);
    out.extend_from_slice(&(message.header.len() as u32).to_le_bytes());
    out.extend_from_slice(&message.header);
    out.extend_from_slice(&message.data);
    out.extend_from_slice(CLOSING_MARKER);
    out.extend_from_slice(b"\r\n");
    out
}

/// Split an envelope into the declared plaintext length and the wrapped
/// message.
pub fn decode_envelope(body: &[u8]) -> Result<(usize, WrappedMessage)> {
    if !is_encrypted(body) {
        return Err(Error::Kerberos("Body is not an encrypted envelope".to_string()));
    }

    let length_at = find(body, LENGTH_PREFIX, 0)
        .ok_or_else(|| Error::Kerberos("Encrypted envelope has no Length".to_string()))?;
    let digits: Vec<u8> = body[length_at + LENGTH_PREFIX.len()..]
        .iter()
        .copied()
        .take_while(u8::is_ascii_digit)
        .collect();
    let original_length: usize = std::str::from_utf8(&digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Kerberos("Encrypted envelope has an invalid Length".to_string()))?;

    let part_at = find(body, OCTET_STREAM_PART, length_at).ok_or_else(|| {
        Error::Kerberos("Encrypted envelope has no octet-stream part".to_string())
    })?;
    let payload_start = part_at + OCTET_STREAM_PART.len();
    let payload_end = rfind(body, CLOSING_MARKER)
        .filter(|end| *end >= payload_start)
        .ok_or_else(|| Error::Kerberos("Encrypted envelope is not terminated".to_string()))?;
    let payload = &body[payload_start..payload_end];

    if payload.len() < 4 {
        return Err(Error::Kerberos("Encrypted payload too short".to_string()));
    }
    let header_len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    if payload.len() < 4 + header_len {
        return Err(Error::Kerberos(format!(
            "Encrypted payload shorter than its header length {}",
            header_len
        )));
    }

    Ok((
        original_length,
        WrappedMessage {
            header: payload[4..4 + header_len].to_vec(),
            data: payload[4 + header_len..].to_vec(),
        },
    ))
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}
