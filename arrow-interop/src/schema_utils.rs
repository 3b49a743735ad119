use anyhow::Result;
use arrow_schema::{Schema, SchemaRef};
use std::sync::Arc;

use crate::column_meta::{ColumnClass, ColumnMeta};

/// Working bytes the scanner keeps per field (one descriptor).
const DESCRIPTOR_BYTES: usize = 8;
/// Per-field wire overhead: the 4-byte length prefix.
const FIELD_PREFIX_BYTES: usize = 4;

pub trait SchemaExt {
    fn validate_all(&self) -> Result<()>;
    fn to_arrow_schema(&self) -> SchemaRef;
    /// Rough device bytes per row: raw row, descriptor table and
    /// destination slots. Variable-length values count `varlen_guess` bytes.
    fn device_bytes_per_row(&self, varlen_guess: usize) -> usize;
    fn variable_columns(&self) -> Vec<usize>;
}

impl SchemaExt for [ColumnMeta] {
    fn validate_all(&self) -> Result<()> {
        for meta in self {
            meta.validate()?;
        }
        Ok(())
    }

    fn to_arrow_schema(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.iter().map(ColumnMeta::arrow_field).collect::<Vec<_>>(),
        ))
    }

    fn device_bytes_per_row(&self, varlen_guess: usize) -> usize {
        let per_column: usize = self
            .iter()
            .map(|m| {
                let (wire, dest) = match m.class() {
                    ColumnClass::Fixed { width, .. } => (width as usize, width as usize),
                    // Wire numerics are header plus a handful of digit groups.
                    ColumnClass::Decimal { .. } => (8 + 2 * 9, 16),
                    ColumnClass::Variable => (varlen_guess, varlen_guess + 4),
                };
                FIELD_PREFIX_BYTES + wire + DESCRIPTOR_BYTES + dest
            })
            .sum();
        // Field count prefix and the row start offset.
        per_column + 2 + 4
    }

    fn variable_columns(&self) -> Vec<usize> {
        self.iter()
            .enumerate()
            .filter(|(_, m)| m.is_variable())
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column_meta::{oid, TypeDefaults};
    use arrow_schema::DataType;

    fn metas() -> Vec<ColumnMeta> {
        let d = TypeDefaults::default();
        vec![
            ColumnMeta::from_pg_type("id", oid::INT8, -1, &d),
            ColumnMeta::from_pg_type("name", oid::TEXT, -1, &d),
            ColumnMeta::decimal("price", 38, 6),
        ]
    }

    #[test]
    fn test_to_arrow_schema() {
        let schema = metas().to_arrow_schema();
        assert_eq!(schema.fields().len(), 3);
        assert_eq!(schema.field(2).data_type(), &DataType::Decimal128(38, 6));
    }

    #[test]
    fn test_device_bytes_per_row() {
        // int8: 4+8+8+8, text(16): 4+16+8+20, numeric: 4+26+8+16, row: 6
        assert_eq!(metas().device_bytes_per_row(16), 28 + 48 + 54 + 6);
        assert_eq!(metas().variable_columns(), vec![1]);
    }
}
