//! ESPHome native-API framing.
//!
//! A frame on the wire is:
//!
//! ```text
//! [0x00][varint payload_len][varint msg_type][payload(payload_len)]
//! ```
//!
//! `payload_len` counts payload bytes only; it does not include the
//! `msg_type` varint. The preamble byte is always `0x00` — the mainline
//! controller treats any other value as the start of a Noise-encrypted frame,
//! which this proxy never sends, so a non-zero preamble here is always a
//! protocol violation.
//!
//! This codec is synchronous and allocates only for the returned frame; it
//! does no I/O of its own.

use thiserror::Error;

const PREAMBLE: u8 = 0x00;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("bad preamble byte {0:#04x}, expected 0x00")]
    BadPreamble(u8),
    #[error("truncated varint in frame header")]
    TruncatedVarint,
}

/// Encodes a single frame: preamble, varint length, varint message type,
/// payload.
pub fn encode(msg_type: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 5 + 5 + payload.len());
    out.push(PREAMBLE);
    encode_varint(payload.len() as u32, &mut out);
    encode_varint(msg_type, &mut out);
    out.extend_from_slice(payload);
    out
}

/// Attempts to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` if `buf` does not yet contain a complete frame (the
/// caller should read more bytes and retry). Returns
/// `Ok(Some((msg_type, payload, consumed)))` on success, where `consumed` is
/// the number of bytes of `buf` that made up the frame (the caller should
/// drop exactly that many bytes from its receive buffer). Returns `Err` only
/// for a non-zero preamble, which is unrecoverable: the session must close.
pub fn decode(buf: &[u8]) -> Result<Option<(u32, &[u8], usize)>, FrameError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != PREAMBLE {
        return Err(FrameError::BadPreamble(buf[0]));
    }

    let mut pos = 1;
    let (payload_len, n) = match decode_varint(&buf[pos..]) {
        Some(v) => v,
        None => return Ok(None),
    };
    pos += n;

    let (msg_type, n) = match decode_varint(&buf[pos..]) {
        Some(v) => v,
        None => return Ok(None),
    };
    pos += n;

    let payload_len = payload_len as usize;
    if buf.len() < pos + payload_len {
        return Ok(None);
    }

    let payload = &buf[pos..pos + payload_len];
    let consumed = pos + payload_len;
    Ok(Some((msg_type, payload, consumed)))
}

/// Appends the LEB128-style varint encoding of `value` to `out`.
pub fn encode_varint(mut value: u32, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        } else {
            out.push(byte | 0x80);
        }
    }
}

/// Decodes a varint from the front of `buf`. Returns `None` if `buf` ends
/// before a terminating byte (high bit clear) is found.
pub fn decode_varint(buf: &[u8]) -> Option<(u32, usize)> {
    let mut result: u32 = 0;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        result |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Some((result, i + 1));
        }
        shift += 7;
        if shift >= 35 {
            // Five groups of 7 bits comfortably cover a u32; bail rather
            // than loop forever on a malformed stream.
            return None;
        }
    }
    None
}

/// Number of bytes `encode_varint` would emit for `value`.
pub fn varint_len(value: u32) -> usize {
    let mut len = 1;
    let mut v = value >> 7;
    while v != 0 {
        len += 1;
        v >>= 7;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() {
        for value in [0u32, 1, 127, 128, 300, 16384, u32::MAX] {
            let mut buf = Vec::new();
            encode_varint(value, &mut buf);
            assert_eq!(buf.len(), varint_len(value));
            let (decoded, consumed) = decode_varint(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn frame_round_trip() {
        for msg_type in [0u32, 1, 7, 66, 300] {
            for payload in [&b""[..], &b"hello"[..], &[0u8; 1024][..]] {
                let encoded = encode(msg_type, payload);
                let (decoded_type, decoded_payload, consumed) =
                    decode(&encoded).unwrap().unwrap();
                assert_eq!(decoded_type, msg_type);
                assert_eq!(decoded_payload, payload);
                assert_eq!(consumed, encoded.len());
            }
        }
    }

    #[test]
    fn length_field_semantics() {
        let payload = vec![0xAB; 42];
        let encoded = encode(9, &payload);
        let expected_len = 1 + varint_len(payload.len() as u32) + varint_len(9) + payload.len();
        assert_eq!(encoded.len(), expected_len);
        let (_, _, consumed) = decode(&encoded).unwrap().unwrap();
        assert_eq!(consumed, expected_len);
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let full = encode(5, b"0123456789");
        for cut in 0..full.len() {
            assert_eq!(decode(&full[..cut]).unwrap(), None);
        }
    }

    #[test]
    fn bad_preamble_is_rejected() {
        let buf = [0x01, 0x02, 0x03];
        assert_eq!(decode(&buf), Err(FrameError::BadPreamble(0x01)));
    }

    #[test]
    fn extra_trailing_bytes_are_not_consumed() {
        let mut buf = encode(1, b"abc");
        buf.extend_from_slice(&encode(2, b"def"));
        let (msg_type, payload, consumed) = decode(&buf).unwrap().unwrap();
        assert_eq!(msg_type, 1);
        assert_eq!(payload, b"abc");
        let (msg_type2, payload2, _) = decode(&buf[consumed..]).unwrap().unwrap();
        assert_eq!(msg_type2, 2);
        assert_eq!(payload2, b"def");
    }
}
