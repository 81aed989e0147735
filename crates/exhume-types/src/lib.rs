//! Primitive types shared across the exhume workspace: page numbers, text
//! encodings, decoded column values, and the serial-type/varint codec.

pub mod serial_type;
pub mod value;

pub use value::{Affinity, Column, Value};

use std::fmt;
use std::num::NonZeroU32;

/// A page number in the database file.
///
/// Page numbers are 1-based; page 0 does not exist. On-disk fields use 0 to
/// mean "no page", which maps to `Option<PageNumber>` at parse boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PageNumber(NonZeroU32);

impl PageNumber {
    /// Page 1 holds the file header and the schema table root.
    pub const ONE: Self = Self(NonZeroU32::MIN);

    /// Create a page number from a raw u32. Returns `None` for 0.
    #[inline]
    #[must_use]
    pub const fn new(n: u32) -> Option<Self> {
        match NonZeroU32::new(n) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Get the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The text encoding declared in the database header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    /// Header value 1.
    Utf8,
    /// Header value 2.
    Utf16Le,
    /// Header value 3.
    Utf16Be,
}

impl TextEncoding {
    /// Parse the header's text-encoding field.
    #[must_use]
    pub const fn from_header_value(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Utf8),
            2 => Some(Self::Utf16Le),
            3 => Some(Self::Utf16Be),
            _ => None,
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Utf8 => write!(f, "UTF-8"),
            Self::Utf16Le => write!(f, "UTF-16LE"),
            Self::Utf16Be => write!(f, "UTF-16BE"),
        }
    }
}
