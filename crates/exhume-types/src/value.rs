//! Decoded column values and declared-type affinity.

use std::fmt;

use exhume_error::{ExhumeError, Result};
use serde::Serialize;

use crate::TextEncoding;
use crate::serial_type::{SerialTypeClass, be_f64, classify_serial_type, serial_type_len, signed_be};

/// A dynamically-typed column value decoded from a record payload.
///
/// The five SQLite storage classes: NULL, INTEGER, REAL, TEXT, BLOB.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Render the value for CSV/diagnostic output. NULL renders empty,
    /// blobs render as lowercase hex.
    #[must_use]
    pub fn to_display_string(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Text(s) => s.clone(),
            Self::Blob(b) => {
                let mut out = String::with_capacity(2 * b.len());
                for byte in b {
                    out.push_str(&format!("{byte:02x}"));
                }
                out
            }
        }
    }

    /// Soft compatibility check against a declared column affinity.
    ///
    /// NULL is compatible with everything. Permissive affinities
    /// ([`Affinity::Any`], [`Affinity::Numeric`], [`Affinity::Blob`])
    /// accept any storage class; the strict ones accept only their own
    /// class (REAL also accepts integers, as SQLite stores exact reals
    /// as integers on disk).
    #[must_use]
    pub fn compatible_with(&self, affinity: Affinity) -> bool {
        match (self, affinity) {
            (Self::Null, _) => true,
            (_, Affinity::Any | Affinity::Blob | Affinity::Numeric) => true,
            (Self::Integer(_), Affinity::Integer | Affinity::Real) => true,
            (Self::Float(_), Affinity::Real) => true,
            (Self::Text(_), Affinity::Text) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Blob(b) => write!(f, "<blob {} bytes>", b.len()),
        }
    }
}

/// One decoded column: its on-disk serial type, the value, and whether
/// text decoding had to substitute replacement characters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub serial_type: u64,
    pub value: Value,
    /// True when invalid code units were replaced with U+FFFD.
    pub lossy: bool,
}

/// Declared-type affinity, derived from the column's type token in the
/// CREATE TABLE statement using SQLite's substring rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Affinity {
    Integer,
    Real,
    Text,
    Blob,
    Numeric,
    /// No declared type at all.
    Any,
}

impl Affinity {
    /// Derive the affinity of a declared type name.
    ///
    /// Substring rules: INT → INTEGER; CHAR/CLOB/TEXT → TEXT; BLOB (or
    /// empty) → BLOB; REAL/FLOA/DOUB → REAL; anything else → NUMERIC.
    #[must_use]
    pub fn from_type_name(decl: &str) -> Self {
        if decl.is_empty() {
            return Self::Any;
        }
        let upper = decl.to_ascii_uppercase();
        if upper.contains("INT") {
            Self::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            Self::Text
        } else if upper.contains("BLOB") {
            Self::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            Self::Real
        } else {
            Self::Numeric
        }
    }

    /// Whether this affinity accepts any storage class in the soft check.
    #[must_use]
    pub const fn is_permissive(self) -> bool {
        matches!(self, Self::Any | Self::Numeric | Self::Blob)
    }
}

/// Decode one column from `payload` given its serial type.
///
/// `payload` must hold at least the serial type's declared byte length;
/// text is decoded per `encoding`, preserving invalid code units as
/// U+FFFD with the column's `lossy` flag set.
pub fn decode_column(serial_type: u64, payload: &[u8], encoding: TextEncoding) -> Result<Column> {
    let len = serial_type_len(serial_type).ok_or(ExhumeError::ReservedSerialType { serial_type })?
        as usize;
    if payload.len() < len {
        return Err(ExhumeError::Truncated {
            needed: len,
            available: payload.len(),
        });
    }
    let bytes = &payload[..len];

    let (value, lossy) = match classify_serial_type(serial_type) {
        SerialTypeClass::Null => (Value::Null, false),
        SerialTypeClass::Integer => (Value::Integer(signed_be(bytes, len)?), false),
        SerialTypeClass::Float => (Value::Float(be_f64(bytes)?), false),
        SerialTypeClass::Zero => (Value::Integer(0), false),
        SerialTypeClass::One => (Value::Integer(1), false),
        SerialTypeClass::Blob => (Value::Blob(bytes.to_vec()), false),
        SerialTypeClass::Text => decode_text(bytes, encoding),
        SerialTypeClass::Reserved => {
            return Err(ExhumeError::ReservedSerialType { serial_type });
        }
    };

    Ok(Column {
        serial_type,
        value,
        lossy,
    })
}

fn decode_text(bytes: &[u8], encoding: TextEncoding) -> (Value, bool) {
    match encoding {
        TextEncoding::Utf8 => match std::str::from_utf8(bytes) {
            Ok(s) => (Value::Text(s.to_owned()), false),
            Err(_) => (
                Value::Text(String::from_utf8_lossy(bytes).into_owned()),
                true,
            ),
        },
        TextEncoding::Utf16Le | TextEncoding::Utf16Be => {
            // An odd trailing byte cannot form a code unit; drop it and
            // flag the column.
            let odd_tail = bytes.len() % 2 != 0;
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| {
                    if encoding == TextEncoding::Utf16Le {
                        u16::from_le_bytes([pair[0], pair[1]])
                    } else {
                        u16::from_be_bytes([pair[0], pair[1]])
                    }
                })
                .collect();
            match String::from_utf16(&units) {
                Ok(s) => (Value::Text(s), odd_tail),
                Err(_) => (Value::Text(String::from_utf16_lossy(&units)), true),
            }
        }
    }
}
