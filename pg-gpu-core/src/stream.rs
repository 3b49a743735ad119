//! Overlapped decoding of many chunks.
//!
//! Framing runs on a blocking thread and feeds a dispatcher that keeps up
//! to `max_inflight_chunks` chunk pipelines busy on blocking workers.
//! Results come back in input order no matter which chunk finishes first.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::copy_stream::CopyStream;
use crate::error::DecodeError;
use crate::pipeline::DecodedBatch;
use crate::raw_chunk::RawChunk;
use crate::Decoder;

type ChunkResult = Result<Vec<DecodedBatch>, DecodeError>;

enum InFlight {
    Running(JoinHandle<ChunkResult>),
    Failed(DecodeError),
}

#[derive(Debug, Clone)]
pub struct StreamDecoder {
    decoder: Decoder,
    permits: Arc<Semaphore>,
    max_inflight: usize,
}

impl StreamDecoder {
    pub fn new(decoder: Decoder) -> Self {
        let max_inflight = decoder.config().decode.max_inflight_chunks;
        Self {
            decoder,
            permits: Arc::new(Semaphore::new(max_inflight)),
            max_inflight,
        }
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// Decode `chunks` in the background. The receiver yields batches in
    /// chunk order and stops after the first error.
    ///
    /// `chunks` is pulled on a blocking thread, so it may do real work
    /// such as framing. Must be called inside a Tokio runtime.
    pub fn decode_stream<I>(&self, chunks: I) -> mpsc::Receiver<Result<DecodedBatch, DecodeError>>
    where
        I: IntoIterator<Item = Result<RawChunk, DecodeError>> + Send + 'static,
        I::IntoIter: Send,
    {
        let (chunk_tx, mut chunk_rx) = mpsc::channel(self.max_inflight);
        let (handle_tx, mut handle_rx) = mpsc::channel::<InFlight>(self.max_inflight);
        let (out_tx, out_rx) = mpsc::channel(self.max_inflight);

        tokio::task::spawn_blocking(move || {
            for chunk in chunks {
                let failed = chunk.is_err();
                if chunk_tx.blocking_send(chunk).is_err() || failed {
                    break;
                }
            }
        });

        let decoder = self.decoder.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let mut index = 0usize;
            while let Some(chunk) = chunk_rx.recv().await {
                let entry = match chunk {
                    Ok(chunk) => {
                        let permit = match permits.clone().acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => break,
                        };
                        let decoder = decoder.clone();
                        InFlight::Running(tokio::task::spawn_blocking(move || {
                            debug!("Chunk {} started ({} rows)", index, chunk.row_count());
                            let result = decoder
                                .check_field_count(&chunk)
                                .and_then(|()| decoder.decode_chunk_split(chunk));
                            drop(permit);
                            result
                        }))
                    }
                    Err(e) => InFlight::Failed(e),
                };
                index += 1;
                let failed = matches!(entry, InFlight::Failed(_));
                if handle_tx.send(entry).await.is_err() || failed {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(entry) = handle_rx.recv().await {
                let result = match entry {
                    InFlight::Running(handle) => handle.await.unwrap_or_else(|e| {
                        Err(DecodeError::Invariant(format!("decode task failed: {}", e)))
                    }),
                    InFlight::Failed(e) => Err(e),
                };
                match result {
                    Ok(batches) => {
                        for batch in batches {
                            if out_tx.send(Ok(batch)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Stream decode stopped: {}", e);
                        let _ = out_tx.send(Err(e)).await;
                        return;
                    }
                }
            }
        });

        out_rx
    }

    /// Frame and decode a complete COPY payload, overlapping chunks.
    ///
    /// Header errors surface here. Chunks are sized so that all in-flight
    /// chunks share the free budget; batches the consumer drops give their
    /// budget back, so a payload larger than the budget decodes as long as
    /// the receiver is drained.
    pub fn decode_copy(
        &self,
        data: Bytes,
    ) -> Result<mpsc::Receiver<Result<DecodedBatch, DecodeError>>, DecodeError> {
        let rows_per_chunk = (self.decoder.rows_per_chunk() / self.max_inflight).max(1);
        let stream = CopyStream::new(data, rows_per_chunk)?;
        Ok(self.decode_stream(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecoderConfig;
    use crate::logging::init_for_tests;
    use crate::testing::CopyWriter;
    use arrow_array::cast::AsArray;
    use arrow_array::types::Int64Type;
    use arrow_interop::oid;

    fn stream_decoder(inflight: usize) -> StreamDecoder {
        let mut config = DecoderConfig::default();
        config.device.threads_per_block = 8;
        config.device.worker_threads = 2;
        config.memory.budget_bytes = Some(1 << 22);
        config.decode.rows_per_chunk = 7;
        config.decode.max_inflight_chunks = inflight;
        let decoder =
            Decoder::for_wire_types(config, &[("n", oid::INT8, -1), ("s", oid::TEXT, -1)]).unwrap();
        StreamDecoder::new(decoder)
    }

    fn payload(rows: i64) -> Bytes {
        let mut writer = CopyWriter::new();
        for n in 0..rows {
            let text = "x".repeat((n % 5) as usize);
            writer.row(&[Some(&n.to_be_bytes()[..]), Some(text.as_bytes())]);
        }
        writer.finish()
    }

    async fn collect(
        mut rx: mpsc::Receiver<Result<DecodedBatch, DecodeError>>,
    ) -> Result<Vec<DecodedBatch>, DecodeError> {
        let mut batches = Vec::new();
        while let Some(batch) = rx.recv().await {
            batches.push(batch?);
        }
        Ok(batches)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_batches_arrive_in_row_order() {
        init_for_tests();
        let decoder = stream_decoder(3);
        let batches = collect(decoder.decode_copy(payload(100)).unwrap()).await.unwrap();
        assert!(batches.len() >= 100 / 7);

        let values: Vec<i64> = batches
            .iter()
            .flat_map(|b| b.batch.column(0).as_primitive::<Int64Type>().values().to_vec())
            .collect();
        assert_eq!(values, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_framing_error_ends_the_stream() {
        let decoder = stream_decoder(2);
        let data = payload(20);
        let cut = data.slice(..data.len() - 5);
        let err = collect(decoder.decode_copy(cut).unwrap()).await.unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { row: 19, .. }), "{:?}", err);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_explicit_chunks_keep_their_order() {
        let decoder = stream_decoder(4);
        let chunks: Vec<_> = CopyStream::new(payload(30), 4).unwrap().collect();
        let mut rx = decoder.decode_stream(chunks);
        let mut rows = Vec::new();
        while let Some(batch) = rx.recv().await {
            rows.push(batch.unwrap().num_rows());
        }
        assert_eq!(rows, vec![4, 4, 4, 4, 4, 4, 4, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_header_error_is_immediate() {
        let decoder = stream_decoder(2);
        let err = decoder.decode_copy(Bytes::from_static(b"PGCOPY")).unwrap_err();
        assert!(matches!(err, DecodeError::Header(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drained_stream_decodes_past_the_budget() {
        let mut config = DecoderConfig::default();
        config.device.worker_threads = 2;
        config.memory.budget_bytes = Some(64 << 10);
        config.decode.max_inflight_chunks = 2;
        let decoder = StreamDecoder::new(
            Decoder::for_wire_types(config, &[("n", oid::INT8, -1)]).unwrap(),
        );
        let mut writer = CopyWriter::new();
        for n in 0..10_000i64 {
            writer.row(&[Some(&n.to_be_bytes()[..])]);
        }

        let mut rx = decoder.decode_copy(writer.finish()).unwrap();
        let mut next = 0i64;
        while let Some(batch) = rx.recv().await {
            let batch = batch.unwrap();
            for &value in batch.batch.column(0).as_primitive::<Int64Type>().values() {
                assert_eq!(value, next);
                next += 1;
            }
        }
        assert_eq!(next, 10_000);
        assert_eq!(decoder.decoder().memory().usage().in_use, 0);
    }
}
