//! Request id header.

use bytes::{BufMut, Bytes, BytesMut};

/// Size of the request id prefix.
pub const ID_LEN: usize = 4;

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// Id and remaining body.
    Complete { id: u32, body: Bytes },
    /// Payload shorter than the id prefix.
    TooShort,
}

/// Split a reply payload into its request id and body.
pub fn parse(mut payload: Bytes) -> ParseResult {
    if payload.len() < ID_LEN {
        return ParseResult::TooShort;
    }
    let id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let body = payload.split_off(ID_LEN);
    ParseResult::Complete { id, body }
}

/// Prefix `body` with `id`.
pub fn encode(id: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ID_LEN + body.len());
    buf.put_u32(id);
    buf.put_slice(body);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        assert_eq!(&encode(7, b"ab")[..], &[0, 0, 0, 7, b'a', b'b']);
        assert_eq!(&encode(0x0102_0304, b"")[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_parse() {
        match parse(encode(42, b"reply")) {
            ParseResult::Complete { id, body } => {
                assert_eq!(id, 42);
                assert_eq!(&body[..], b"reply");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_empty_body() {
        assert_eq!(
            parse(Bytes::from_static(&[0, 0, 1, 0])),
            ParseResult::Complete {
                id: 256,
                body: Bytes::new()
            }
        );
    }

    #[test]
    fn test_too_short() {
        assert_eq!(parse(Bytes::from_static(&[0, 1, 2])), ParseResult::TooShort);
        assert_eq!(parse(Bytes::new()), ParseResult::TooShort);
    }
}
