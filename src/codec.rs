//! Tokio codec for framed lines, for use with `tokio_util::codec::Framed`.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::types::{ShareError, LINE_DELIMITER, MAX_LINE_LEN};

/// Codec producing one `String` per newline-terminated line.
///
/// Wire-compatible with [`crate::frame::read_line`] / [`crate::frame::write_line`].
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_len: usize,
    // Bytes of the buffer already scanned for a delimiter
    next_index: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_len(MAX_LINE_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            max_len,
            next_index: 0,
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = ShareError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let scan_to = src.len().min(self.max_len + 1);
        // The caller may hand over a different or drained buffer.
        let start = self.next_index.min(scan_to);
        let found = src[start..scan_to]
            .iter()
            .position(|b| *b == LINE_DELIMITER);

        match found {
            Some(offset) => {
                let end = start + offset;
                self.next_index = 0;
                let mut line = src.split_to(end + 1);
                line.truncate(end);
                String::from_utf8(line.to_vec()).map(Some).map_err(|_| {
                    ShareError::ProtocolFraming("line is not valid UTF-8".to_string())
                })
            }
            None if src.len() > self.max_len => {
                self.next_index = 0;
                Err(ShareError::ProtocolFraming(format!(
                    "line exceeds {} bytes",
                    self.max_len
                )))
            }
            None => {
                self.next_index = scan_to;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let decoded = self.decode(src);
        if !matches!(decoded, Ok(Some(_))) {
            self.next_index = 0;
        }
        match decoded? {
            Some(line) => Ok(Some(line)),
            None if src.is_empty() => Ok(None),
            None => Err(ShareError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed before end of line",
            ))),
        }
    }
}

impl<T: AsRef<str>> Encoder<T> for LineCodec {
    type Error = ShareError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = item.as_ref();
        if line.len() > self.max_len {
            return Err(ShareError::ProtocolFraming(format!(
                "line exceeds {} bytes",
                self.max_len
            )));
        }
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(LINE_DELIMITER);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_across_partial_reads() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"hel"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"lo\nnext");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("hello".to_string()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], b"next");
    }

    #[test]
    fn encode_appends_delimiter() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("CODE:400", &mut buf).unwrap();
        assert_eq!(&buf[..], b"CODE:400\n");
    }

    #[test]
    fn rejects_overlong_line() {
        let mut codec = LineCodec::with_max_len(4);
        let mut buf = BytesMut::from(&b"abcdefgh"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ShareError::ProtocolFraming(_))
        ));
    }

    #[test]
    fn partial_line_at_eof_is_error() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"dangling"[..]);
        assert!(matches!(codec.decode_eof(&mut buf), Err(ShareError::Io(_))));
        let mut empty = BytesMut::new();
        assert_eq!(codec.decode_eof(&mut empty).unwrap(), None);
    }

    #[test]
    fn fresh_buffer_after_partial_line_decodes() {
        let mut codec = LineCodec::new();
        let mut partial = BytesMut::from(&b"partial"[..]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);

        let mut fresh = BytesMut::from(&b"ok\n"[..]);
        assert_eq!(codec.decode(&mut fresh).unwrap(), Some("ok".to_string()));
    }

    #[test]
    fn codec_recovers_after_overlong_line() {
        let mut codec = LineCodec::with_max_len(4);
        let mut buf = BytesMut::from(&b"ab"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"cdefgh");
        assert!(codec.decode(&mut buf).is_err());

        let mut next = BytesMut::from(&b"x\n"[..]);
        assert_eq!(codec.decode(&mut next).unwrap(), Some("x".to_string()));
    }
}
