//! Column metadata: wire type identity and the Arrow type it decodes into.

use anyhow::{bail, Result};
use arrow_schema::{DataType, Field, TimeUnit};
use gpu_memory_manager::ColumnLayout;
use std::collections::HashMap;

/// PostgreSQL type OIDs the decoder knows about.
pub mod oid {
    pub const BOOL: u32 = 16;
    pub const BYTEA: u32 = 17;
    pub const NAME: u32 = 19;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const TEXT: u32 = 25;
    pub const JSON: u32 = 114;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const BPCHAR: u32 = 1042;
    pub const VARCHAR: u32 = 1043;
    pub const DATE: u32 = 1082;
    pub const TIMESTAMP: u32 = 1114;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const NUMERIC: u32 = 1700;
    pub const UUID: u32 = 2950;
}

/// Arrow field metadata key holding the wire type OID.
pub const WIRE_TYPE_KEY: &str = "pg.type_oid";

/// Days between 1970-01-01 and the PostgreSQL epoch 2000-01-01.
pub const PG_EPOCH_DAYS: i32 = 10_957;
/// Microseconds between 1970-01-01 and 2000-01-01.
pub const PG_EPOCH_MICROS: i64 = 946_684_800_000_000;

/// Largest precision a Decimal128 can hold.
pub const DECIMAL128_MAX_PRECISION: u8 = 38;

/// Arrow type a column decodes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrowKind {
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Date32,
    /// Microseconds since the Unix epoch, optionally UTC-zoned.
    TimestampMicros { utc: bool },
    FixedSizeBinary,
    /// Precision and scale live in [`ColumnMeta::decimal_param`].
    Decimal128,
    Utf8,
    Binary,
}

/// How the fixed-width scatter turns wire bytes into Arrow bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixedTransform {
    /// Big-endian to little-endian.
    ByteSwap,
    /// Byte swap, then add a day offset to an `i32`.
    ShiftDays(i32),
    /// Byte swap, then add a microsecond offset to an `i64`.
    ShiftMicros(i64),
    /// Copy unchanged.
    Verbatim,
}

/// Which Pass-2 kernel decodes a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnClass {
    Fixed { width: u32, transform: FixedTransform },
    Variable,
    Decimal { precision: u8, scale: i8 },
}

/// Defaults applied when the wire type does not pin everything down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeDefaults {
    /// Scale used for `numeric` columns declared without a type modifier.
    pub unconstrained_numeric_scale: i8,
}

impl Default for TypeDefaults {
    fn default() -> Self {
        Self {
            unconstrained_numeric_scale: 9,
        }
    }
}

/// Immutable description of one column of the row stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub wire_type_id: u32,
    pub arrow_kind: ArrowKind,
    /// `Some(width)` for fixed-width columns, `None` for variable-length.
    pub byte_width: Option<u32>,
    pub decimal_param: Option<(u8, i8)>,
}

impl ColumnMeta {
    pub fn new(
        name: impl Into<String>,
        wire_type_id: u32,
        arrow_kind: ArrowKind,
        byte_width: Option<u32>,
        decimal_param: Option<(u8, i8)>,
    ) -> Self {
        Self {
            name: name.into(),
            wire_type_id,
            arrow_kind,
            byte_width,
            decimal_param,
        }
    }

    /// A `numeric(precision, scale)` column.
    pub fn decimal(name: impl Into<String>, precision: u8, scale: i8) -> Self {
        Self::new(
            name,
            oid::NUMERIC,
            ArrowKind::Decimal128,
            Some(16),
            Some((precision, scale)),
        )
    }

    /// Resolve a column from its wire type OID and type modifier.
    ///
    /// Types without a dedicated decoder come back as opaque `Binary`.
    pub fn from_pg_type(
        name: impl Into<String>,
        type_oid: u32,
        typmod: i32,
        defaults: &TypeDefaults,
    ) -> Self {
        let name = name.into();
        let fixed = |kind, width| Self::new(name.clone(), type_oid, kind, Some(width), None);
        match type_oid {
            oid::INT2 => fixed(ArrowKind::Int16, 2),
            oid::INT4 => fixed(ArrowKind::Int32, 4),
            oid::INT8 => fixed(ArrowKind::Int64, 8),
            oid::FLOAT4 => fixed(ArrowKind::Float32, 4),
            oid::FLOAT8 => fixed(ArrowKind::Float64, 8),
            oid::DATE => fixed(ArrowKind::Date32, 4),
            oid::TIMESTAMP => fixed(ArrowKind::TimestampMicros { utc: false }, 8),
            oid::TIMESTAMPTZ => fixed(ArrowKind::TimestampMicros { utc: true }, 8),
            oid::UUID => fixed(ArrowKind::FixedSizeBinary, 16),
            oid::NUMERIC => {
                let (precision, scale) = numeric_typmod(typmod, defaults);
                let mut meta = Self::decimal(name.clone(), precision, scale);
                meta.wire_type_id = type_oid;
                meta
            }
            oid::TEXT | oid::VARCHAR | oid::BPCHAR | oid::NAME | oid::JSON => {
                Self::new(name, type_oid, ArrowKind::Utf8, None, None)
            }
            _ => Self::new(name, type_oid, ArrowKind::Binary, None, None),
        }
    }

    pub fn is_variable(&self) -> bool {
        self.byte_width.is_none()
    }

    /// Check the combination of kind, width and decimal parameters.
    pub fn validate(&self) -> Result<()> {
        match (self.arrow_kind, self.byte_width) {
            (ArrowKind::Utf8 | ArrowKind::Binary, None) => {}
            (ArrowKind::Utf8 | ArrowKind::Binary, Some(w)) => {
                bail!("column '{}': variable-length kind with byte width {}", self.name, w)
            }
            (kind, None) => bail!("column '{}': {:?} needs a byte width", self.name, kind),
            (kind, Some(width)) => {
                let expected = match kind {
                    ArrowKind::Int16 => 2,
                    ArrowKind::Int32 | ArrowKind::Float32 | ArrowKind::Date32 => 4,
                    ArrowKind::Int64 | ArrowKind::Float64 | ArrowKind::TimestampMicros { .. } => 8,
                    ArrowKind::Decimal128 => 16,
                    ArrowKind::FixedSizeBinary | ArrowKind::Utf8 | ArrowKind::Binary => width,
                };
                if width != expected || width == 0 {
                    bail!(
                        "column '{}': {:?} has byte width {}, expected {}",
                        self.name,
                        kind,
                        width,
                        expected
                    );
                }
            }
        }

        match (self.arrow_kind, self.decimal_param) {
            (ArrowKind::Decimal128, Some((precision, scale))) => {
                if precision == 0 || precision > DECIMAL128_MAX_PRECISION {
                    bail!("column '{}': precision {} out of range", self.name, precision);
                }
                if scale > 0 && scale as u8 > precision {
                    bail!(
                        "column '{}': scale {} exceeds precision {}",
                        self.name,
                        scale,
                        precision
                    );
                }
            }
            (ArrowKind::Decimal128, None) => {
                bail!("column '{}': Decimal128 without precision/scale", self.name)
            }
            (_, Some(_)) => bail!("column '{}': decimal parameters on a non-decimal column", self.name),
            (_, None) => {}
        }
        Ok(())
    }

    /// Pass-2 kernel class. Call [`ColumnMeta::validate`] first.
    pub fn class(&self) -> ColumnClass {
        match (self.arrow_kind, self.byte_width, self.decimal_param) {
            (ArrowKind::Decimal128, _, Some((precision, scale))) => {
                ColumnClass::Decimal { precision, scale }
            }
            (_, None, _) => ColumnClass::Variable,
            (kind, Some(width), _) => ColumnClass::Fixed {
                width,
                transform: match kind {
                    ArrowKind::Date32 => FixedTransform::ShiftDays(PG_EPOCH_DAYS),
                    ArrowKind::TimestampMicros { .. } => FixedTransform::ShiftMicros(PG_EPOCH_MICROS),
                    ArrowKind::FixedSizeBinary => FixedTransform::Verbatim,
                    _ => FixedTransform::ByteSwap,
                },
            },
        }
    }

    /// Destination buffer layout for the memory manager.
    pub fn layout(&self) -> ColumnLayout {
        match self.class() {
            ColumnClass::Decimal { .. } => ColumnLayout::Fixed { stride: 16 },
            ColumnClass::Fixed { width, .. } => ColumnLayout::Fixed { stride: width },
            ColumnClass::Variable => ColumnLayout::Variable,
        }
    }

    pub fn data_type(&self) -> DataType {
        match self.arrow_kind {
            ArrowKind::Int16 => DataType::Int16,
            ArrowKind::Int32 => DataType::Int32,
            ArrowKind::Int64 => DataType::Int64,
            ArrowKind::Float32 => DataType::Float32,
            ArrowKind::Float64 => DataType::Float64,
            ArrowKind::Date32 => DataType::Date32,
            ArrowKind::TimestampMicros { utc: false } => {
                DataType::Timestamp(TimeUnit::Microsecond, None)
            }
            ArrowKind::TimestampMicros { utc: true } => {
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
            }
            ArrowKind::FixedSizeBinary => {
                DataType::FixedSizeBinary(self.byte_width.unwrap_or(0) as i32)
            }
            ArrowKind::Decimal128 => {
                let (precision, scale) = self.decimal_param.unwrap_or((DECIMAL128_MAX_PRECISION, 0));
                DataType::Decimal128(precision, scale)
            }
            ArrowKind::Utf8 => DataType::Utf8,
            ArrowKind::Binary => DataType::Binary,
        }
    }

    /// Nullable Arrow field tagged with the wire type OID.
    pub fn arrow_field(&self) -> Field {
        Field::new(&self.name, self.data_type(), true).with_metadata(HashMap::from([(
            WIRE_TYPE_KEY.to_string(),
            self.wire_type_id.to_string(),
        )]))
    }
}

/// Decode a `numeric` type modifier into `(precision, scale)`.
///
/// The modifier is `((precision << 16) | scale) + 4` with an 11-bit signed
/// scale; anything below 4 means "unconstrained". Precisions above 38 are
/// capped so values that do not fit are deferred row by row.
pub fn numeric_typmod(typmod: i32, defaults: &TypeDefaults) -> (u8, i8) {
    if typmod < 4 {
        return (DECIMAL128_MAX_PRECISION, defaults.unconstrained_numeric_scale);
    }
    let packed = typmod - 4;
    let precision = ((packed >> 16) & 0xffff) as u32;
    let scale = (((packed & 0x7ff) ^ 1024) - 1024) as i32;
    let precision = precision.clamp(1, DECIMAL128_MAX_PRECISION as u32) as u8;
    let scale = scale.clamp(i8::MIN as i32, precision as i32) as i8;
    (precision, scale)
}
