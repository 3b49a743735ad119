//! Builders for binary COPY payloads, shared by unit tests, integration
//! tests and benches.

use bytes::{BufMut, Bytes, BytesMut};
use std::str::FromStr;

use crate::copy_stream::COPY_SIGNATURE;
use crate::fallback::ReferenceNumeric;

/// Writes a COPY payload row by row: header first, trailer on `finish`.
#[derive(Debug)]
pub struct CopyWriter {
    buf: BytesMut,
}

impl CopyWriter {
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(1024);
        buf.put_slice(COPY_SIGNATURE);
        buf.put_i32(0);
        buf.put_i32(0);
        Self { buf }
    }

    /// Append one row; `None` fields are written as NULL.
    pub fn row(&mut self, fields: &[Option<&[u8]>]) -> &mut Self {
        self.buf.put_i16(fields.len() as i16);
        for field in fields {
            match field {
                Some(data) => {
                    self.buf.put_i32(data.len() as i32);
                    self.buf.put_slice(data);
                }
                None => self.buf.put_i32(-1),
            }
        }
        self
    }

    /// Bytes written so far, without a trailer.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() <= COPY_SIGNATURE.len() + 8
    }

    pub fn finish(mut self) -> Bytes {
        self.buf.put_i16(-1);
        self.buf.freeze()
    }
}

impl Default for CopyWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire encoding of a decimal literal such as `"-12.50"`, `"NaN"` or
/// `"Infinity"`.
///
/// # Panics
///
/// On text that is not a numeric literal.
pub fn encode_numeric(text: &str) -> Vec<u8> {
    ReferenceNumeric::from_str(text)
        .unwrap_or_else(|e| panic!("bad numeric literal {:?}: {}", text, e))
        .to_wire()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_frames_rows() {
        let mut writer = CopyWriter::new();
        assert!(writer.is_empty());
        writer.row(&[Some(&b"hi"[..]), None]);
        let data = writer.finish();

        let body = &data[COPY_SIGNATURE.len() + 8..];
        assert_eq!(&body[..2], &2i16.to_be_bytes());
        assert_eq!(&body[2..6], &2i32.to_be_bytes());
        assert_eq!(&body[6..8], b"hi");
        assert_eq!(&body[8..12], &(-1i32).to_be_bytes());
        assert_eq!(&body[12..], &(-1i16).to_be_bytes());
    }

    #[test]
    fn test_numeric_literal_groups() {
        // 123.456 = groups [123, 4560], weight 0, dscale 3.
        let wire = encode_numeric("123.456");
        assert_eq!(
            wire,
            [0, 2, 0, 0, 0, 0, 0, 3, 0, 123, 0x11, 0xD0].to_vec()
        );
    }
}
