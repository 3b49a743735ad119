//! Host-side framing of a binary COPY stream into [`RawChunk`]s.
//!
//! ```text
//! header:  "PGCOPY\n\xff\r\n\0" | flags i32 | ext_len i32 | ext bytes
//! row:     field_count i16 | (length i32 | data)*    length -1 = NULL
//! trailer: -1 i16
//! ```

use bytes::Bytes;
use gpu_decode_kernels::wire::{read_i16, read_i32, NULL_LENGTH};
use tracing::{debug, info};

use crate::error::DecodeError;
use crate::raw_chunk::RawChunk;

pub const COPY_SIGNATURE: &[u8; 11] = b"PGCOPY\n\xff\r\n\0";
/// Flag bit announcing an OID column in every row.
pub const FLAG_HAS_OIDS: i32 = 1 << 16;
const HEADER_FIXED_BYTES: usize = COPY_SIGNATURE.len() + 8;
const TRAILER: i16 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyHeader {
    pub flags: i32,
    pub extension: Bytes,
    /// Bytes the header occupies, extension included.
    pub len: usize,
}

impl CopyHeader {
    pub fn parse(data: &Bytes) -> Result<Self, DecodeError> {
        if data.len() < HEADER_FIXED_BYTES {
            return Err(DecodeError::Header(format!(
                "{} bytes is shorter than the fixed header",
                data.len()
            )));
        }
        if &data[..COPY_SIGNATURE.len()] != COPY_SIGNATURE {
            return Err(DecodeError::Header("signature mismatch".to_string()));
        }
        let at = COPY_SIGNATURE.len();
        let flags = read_i32(data, at).unwrap_or_default();
        if flags & FLAG_HAS_OIDS != 0 {
            return Err(DecodeError::UnsupportedFlags(flags));
        }
        let ext_len = read_i32(data, at + 4).unwrap_or_default();
        let ext_start = HEADER_FIXED_BYTES;
        let ext_end = usize::try_from(ext_len)
            .ok()
            .and_then(|n| ext_start.checked_add(n))
            .filter(|&end| end <= data.len())
            .ok_or_else(|| DecodeError::Header(format!("bad extension length {}", ext_len)))?;

        Ok(Self {
            flags,
            extension: data.slice(ext_start..ext_end),
            len: ext_end,
        })
    }
}

/// Iterator of row chunks over a complete COPY payload.
///
/// Rows are walked on the host only far enough to find their boundaries;
/// field contents are left to the device. Reaching the end of the data
/// without a trailer ends the stream like a trailer would.
#[derive(Debug)]
pub struct CopyStream {
    data: Bytes,
    header: CopyHeader,
    pos: usize,
    rows_per_chunk: usize,
    rows_seen: usize,
    finished: bool,
}

impl CopyStream {
    pub fn new(data: Bytes, rows_per_chunk: usize) -> Result<Self, DecodeError> {
        let header = CopyHeader::parse(&data)?;
        info!(
            "COPY stream: {} bytes, flags {:#x}, {} extension bytes",
            data.len(),
            header.flags,
            header.extension.len()
        );
        Ok(Self {
            pos: header.len,
            data,
            header,
            rows_per_chunk: rows_per_chunk.max(1),
            rows_seen: 0,
            finished: false,
        })
    }

    pub fn header(&self) -> &CopyHeader {
        &self.header
    }

    pub fn rows_seen(&self) -> usize {
        self.rows_seen
    }

    /// End of the row starting at `pos`, or `None` at the trailer.
    fn row_end(&self, pos: usize) -> Result<Option<usize>, DecodeError> {
        let malformed = |column: usize, detail: String| DecodeError::Malformed {
            row: self.rows_seen,
            column,
            detail,
        };
        let count = read_i16(&self.data, pos)
            .ok_or_else(|| malformed(0, "truncated field count".to_string()))?;
        if count == TRAILER {
            return Ok(None);
        }
        if count < 0 {
            return Err(malformed(0, format!("negative field count {}", count)));
        }

        let mut at = pos + 2;
        for column in 0..count as usize {
            let length = read_i32(&self.data, at)
                .ok_or_else(|| malformed(column, "truncated length prefix".to_string()))?;
            at += 4;
            match length {
                NULL_LENGTH => {}
                n if n < 0 => return Err(malformed(column, format!("invalid field length {}", n))),
                n => {
                    at += n as usize;
                    if at > self.data.len() {
                        return Err(malformed(column, format!("field of {} bytes is truncated", n)));
                    }
                }
            }
        }
        Ok(Some(at))
    }

    fn next_chunk(&mut self) -> Result<Option<RawChunk>, DecodeError> {
        let start = self.pos;
        let first_row = self.rows_seen;
        let mut row_starts = vec![0u32];
        while row_starts.len() <= self.rows_per_chunk {
            if self.pos >= self.data.len() {
                self.finished = true;
                break;
            }
            match self.row_end(self.pos)? {
                Some(end) => {
                    let relative = u32::try_from(end - start).map_err(|_| {
                        DecodeError::Invariant(format!(
                            "chunk spans more than {} bytes; lower rows_per_chunk",
                            u32::MAX
                        ))
                    })?;
                    row_starts.push(relative);
                    self.pos = end;
                    self.rows_seen += 1;
                }
                None => {
                    self.pos += 2;
                    self.finished = true;
                    if self.pos != self.data.len() {
                        debug!("{} bytes after the COPY trailer ignored", self.data.len() - self.pos);
                    }
                    break;
                }
            }
        }
        if row_starts.len() == 1 {
            return Ok(None);
        }
        let end = start + row_starts[row_starts.len() - 1] as usize;
        let chunk = RawChunk::new(self.data.slice(start..end), row_starts)?.with_first_row(first_row);
        debug!("Framed chunk of {} rows", chunk.row_count());
        Ok(Some(chunk))
    }
}

impl Iterator for CopyStream {
    type Item = Result<RawChunk, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CopyWriter;

    fn three_rows() -> Bytes {
        let mut writer = CopyWriter::new();
        writer.row(&[Some(&b"a"[..]), None]);
        writer.row(&[None, Some(&b"bb"[..])]);
        writer.row(&[Some(&b""[..]), Some(&b"ccc"[..])]);
        writer.finish()
    }

    #[test]
    fn test_header_is_validated() {
        assert!(matches!(
            CopyStream::new(Bytes::from_static(b"PGCOPY\n"), 10),
            Err(DecodeError::Header(_))
        ));
        let mut bad = three_rows().to_vec();
        bad[0] = b'X';
        assert!(matches!(
            CopyStream::new(Bytes::from(bad), 10),
            Err(DecodeError::Header(_))
        ));

        let mut oids = three_rows().to_vec();
        oids[11..15].copy_from_slice(&FLAG_HAS_OIDS.to_be_bytes());
        assert!(matches!(
            CopyStream::new(Bytes::from(oids), 10),
            Err(DecodeError::UnsupportedFlags(_))
        ));
    }

    #[test]
    fn test_header_extension_is_skipped() {
        let mut data = COPY_SIGNATURE.to_vec();
        data.extend_from_slice(&0i32.to_be_bytes());
        data.extend_from_slice(&3i32.to_be_bytes());
        data.extend_from_slice(b"ext");
        data.extend_from_slice(&1i16.to_be_bytes());
        data.extend_from_slice(&(-1i32).to_be_bytes());
        data.extend_from_slice(&TRAILER.to_be_bytes());

        let mut stream = CopyStream::new(Bytes::from(data), 10).unwrap();
        assert_eq!(&stream.header().extension[..], b"ext");
        let chunk = stream.next().unwrap().unwrap();
        assert_eq!(chunk.row_count(), 1);
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_chunks_respect_row_limit() {
        let stream = CopyStream::new(three_rows(), 2).unwrap();
        let chunks: Vec<RawChunk> = stream.collect::<Result<_, _>>().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].row_count(), 2);
        assert_eq!(chunks[1].row_count(), 1);
        assert_eq!(chunks[0].first_row(), 0);
        assert_eq!(chunks[1].first_row(), 2);
        assert_eq!(chunks[1].row_starts(), &[0, 13]);
        assert_eq!(&chunks[1].row(0)[10..], b"ccc");
    }

    #[test]
    fn test_missing_trailer_ends_the_stream() {
        let data = three_rows();
        let without = data.slice(..data.len() - 2);
        let rows: usize = CopyStream::new(without, 10)
            .unwrap()
            .map(|c| c.unwrap().row_count())
            .sum();
        assert_eq!(rows, 3);
    }

    #[test]
    fn test_truncated_row_is_malformed() {
        let data = three_rows();
        let cut = data.slice(..data.len() - 4);
        let result: Result<Vec<_>, _> = CopyStream::new(cut, 10).unwrap().collect();
        assert!(matches!(result, Err(DecodeError::Malformed { row: 2, column: 1, .. })));
    }

    #[test]
    fn test_framing_rows_count_from_stream_start() {
        // The bad row sits in the second chunk; its position is still the
        // stream row.
        let data = three_rows();
        let cut = data.slice(..data.len() - 4);
        let mut stream = CopyStream::new(cut, 1).unwrap();
        assert_eq!(stream.next().unwrap().unwrap().first_row(), 0);
        assert_eq!(stream.next().unwrap().unwrap().first_row(), 1);
        assert!(matches!(
            stream.next(),
            Some(Err(DecodeError::Malformed { row: 2, column: 1, .. }))
        ));
        assert!(stream.next().is_none());
    }
}
