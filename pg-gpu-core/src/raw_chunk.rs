use bytes::Bytes;

use crate::error::DecodeError;

/// A run of complete COPY rows handed to one pipeline invocation.
///
/// `row_starts` holds `row_count + 1` byte offsets into `bytes`; row `r`
/// spans `row_starts[r]..row_starts[r + 1]`. `first_row` is the index of
/// row 0 in the whole COPY stream and only feeds error positions.
#[derive(Debug, Clone)]
pub struct RawChunk {
    bytes: Bytes,
    row_starts: Vec<u32>,
    first_row: usize,
}

impl RawChunk {
    pub fn new(bytes: Bytes, row_starts: Vec<u32>) -> Result<Self, DecodeError> {
        if bytes.len() > i32::MAX as usize {
            return Err(DecodeError::Invariant(format!(
                "chunk of {} bytes exceeds i32 field offsets",
                bytes.len()
            )));
        }
        let Some(&end) = row_starts.last() else {
            return Err(DecodeError::Invariant(
                "row_starts needs row_count + 1 entries".to_string(),
            ));
        };
        if row_starts.windows(2).any(|w| w[0] > w[1]) {
            return Err(DecodeError::Invariant("row_starts is not sorted".to_string()));
        }
        if end as usize > bytes.len() {
            return Err(DecodeError::Invariant(format!(
                "last row ends at byte {}, chunk holds {}",
                end,
                bytes.len()
            )));
        }
        Ok(Self {
            bytes,
            row_starts,
            first_row: 0,
        })
    }

    /// Place the chunk at stream row `first_row`.
    pub fn with_first_row(mut self, first_row: usize) -> Self {
        self.first_row = first_row;
        self
    }

    pub fn first_row(&self) -> usize {
        self.first_row
    }

    pub fn row_count(&self) -> usize {
        self.row_starts.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn row_starts(&self) -> &[u32] {
        &self.row_starts
    }

    /// Raw bytes of row `r`, field count included.
    pub fn row(&self, r: usize) -> &[u8] {
        &self.bytes[self.row_starts[r] as usize..self.row_starts[r + 1] as usize]
    }

    /// Split before row `at`, for retrying a chunk that did not fit. Both
    /// halves share the original allocation.
    pub fn split_at_row(self, at: usize) -> (RawChunk, RawChunk) {
        let at = at.min(self.row_count());
        let cut = self.row_starts[at];
        let end = self.row_starts[self.row_count()];

        let head = RawChunk {
            bytes: self.bytes.slice(..cut as usize),
            row_starts: self.row_starts[..=at].to_vec(),
            first_row: self.first_row,
        };
        let tail = RawChunk {
            bytes: self.bytes.slice(cut as usize..end as usize),
            row_starts: self.row_starts[at..].iter().map(|s| s - cut).collect(),
            first_row: self.first_row + at,
        };
        (head, tail)
    }
}
