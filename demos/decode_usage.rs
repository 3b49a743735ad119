use anyhow::Result;
use arrow_array::cast::AsArray;
use arrow_array::types::{Decimal128Type, Int64Type};
use arrow_array::Array;
use bytes::Bytes;
use pg_gpu_core::testing::{encode_numeric, CopyWriter};
use pg_gpu_decode::{oid, ColumnMeta, Decoder, DecoderConfig, StreamDecoder};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = DecoderConfig::from_toml_str(include_str!("../config/default.toml"))?;
    config.init_logging()?;

    info!("PostgreSQL binary COPY decoder - usage examples");

    // Example 1: Decode a small payload
    basic_decode_example()?;

    // Example 2: Numerics the device hands back to the CPU
    fallback_example()?;

    // Example 3: Overlapping chunks on a Tokio runtime
    stream_example().await?;

    // Example 4: A payload larger than the memory budget
    small_budget_example()?;

    Ok(())
}

fn orders_payload(rows: i64) -> Bytes {
    let mut writer = CopyWriter::new();
    for id in 0..rows {
        let amount = encode_numeric(&format!("{}.{:02}", id * 3, id % 100));
        let note = format!("order {}", id);
        let note = (id % 4 != 0).then_some(note.as_bytes());
        writer.row(&[Some(&id.to_be_bytes()[..]), Some(&amount[..]), note]);
    }
    writer.finish()
}

fn orders_decoder(config: DecoderConfig) -> Result<Decoder> {
    // Same columns as `COPY orders (id bigint, amount numeric(18,2), note text)`.
    Decoder::for_wire_types(
        config,
        &[
            ("id", oid::INT8, -1),
            ("amount", oid::NUMERIC, ((18 << 16) | 2) + 4),
            ("note", oid::TEXT, -1),
        ],
    )
}

fn basic_decode_example() -> Result<()> {
    info!("=== Example 1: Basic decode ===");

    let decoder = orders_decoder(DecoderConfig::default())?;
    info!("Schema: {:?}", decoder.schema());

    for batch in decoder.decode_iter(orders_payload(8))? {
        let batch = batch?;
        let ids = batch.batch.column(0).as_primitive::<Int64Type>();
        let amounts = batch.batch.column(1).as_primitive::<Decimal128Type>();
        let notes = batch.batch.column(2).as_string::<i32>();
        for row in 0..batch.num_rows() {
            let note = if notes.is_null(row) { "<null>" } else { notes.value(row) };
            info!(
                "id={} amount={} note={}",
                ids.value(row),
                amounts.value_as_string(row),
                note
            );
        }
    }

    Ok(())
}

fn fallback_example() -> Result<()> {
    info!("=== Example 2: CPU fallback ===");

    let decoder = Decoder::new(
        DecoderConfig::default(),
        vec![ColumnMeta::decimal("reading", 38, 6)],
    )?;

    let mut writer = CopyWriter::new();
    for text in ["12.5", "NaN", "100000000000000000000000000000000000", "-0.000001"] {
        writer.row(&[Some(&encode_numeric(text)[..])]);
    }

    for batch in decoder.decode_iter(writer.finish())? {
        let batch = batch?;
        let readings = batch.batch.column(0).as_primitive::<Decimal128Type>();
        info!(
            "{} rows decoded on the device, {} left for the CPU",
            readings.len() - readings.null_count(),
            batch.fallback.len()
        );
        for row in &batch.fallback {
            let value = row.decode()?;
            info!("row {} deferred ({:?}): {}", row.row, row.reason, value);
        }
    }

    Ok(())
}

async fn stream_example() -> Result<()> {
    info!("=== Example 3: Stream decoding ===");

    let mut config = DecoderConfig::default();
    config.decode.rows_per_chunk = 10_000;
    config.decode.max_inflight_chunks = 4;
    let stream = StreamDecoder::new(orders_decoder(config)?);

    let mut rx = stream.decode_copy(orders_payload(100_000))?;
    let mut batches = 0;
    let mut rows = 0;
    while let Some(batch) = rx.recv().await {
        rows += batch?.num_rows();
        batches += 1;
    }
    info!("Streamed {} rows in {} batches", rows, batches);

    Ok(())
}

fn small_budget_example() -> Result<()> {
    info!("=== Example 4: Memory budget ===");

    let mut config = DecoderConfig::default();
    config.memory.budget_bytes = Some(256 * 1024);
    let decoder = orders_decoder(config)?;

    let data = orders_payload(50_000);
    info!(
        "{} byte payload, {} byte budget, {} rows per chunk",
        data.len(),
        decoder.memory().budget(),
        decoder.rows_per_chunk()
    );

    let mut total = 0i64;
    for batch in decoder.decode_iter(data)? {
        // Each batch is dropped before the next is decoded.
        let batch = batch?;
        total += batch.batch.column(0).as_primitive::<Int64Type>().values().iter().sum::<i64>();
    }
    let usage = decoder.memory().usage();
    info!("Sum of ids: {}, peak memory {} bytes", total, usage.peak);

    Ok(())
}
