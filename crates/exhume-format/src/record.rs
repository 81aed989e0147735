//! Record decoding: the serial-type header and the column payload.
//!
//! A record is `(header_length varint, serial_type varint × k,
//! column_bytes × k)`, where `header_length` covers itself and the serial
//! type array. Two decoding modes exist:
//!
//! - **live**: the payload length is known from the enclosing cell and
//!   the whole payload (including overflow) is in hand;
//! - **carved**: the framing varints are gone, so the payload length is
//!   synthesized from the serial-type sum and decoding is constrained to
//!   an expected column count.

use exhume_error::{ExhumeError, Result};
use exhume_types::serial_type::{read_varint, serial_type_len, varint_len};
use exhume_types::value::decode_column;
use exhume_types::{Column, TextEncoding};

/// Upper bound on columns in one record, matching the format's
/// SQLITE_MAX_COLUMN ceiling. Candidates implying more are garbage.
pub const MAX_COLUMNS: usize = 32767;

/// A fully decoded record.
#[derive(Debug, Clone)]
pub struct Record {
    /// Length of the record header in bytes (including its own varint).
    pub header_len: usize,
    /// The serial types, in column order.
    pub serial_types: Vec<u64>,
    /// Decoded column values.
    pub columns: Vec<Column>,
    /// Total bytes the record occupies: header plus payload.
    pub total_len: usize,
}

impl Record {
    /// Decode a live record from a complete payload buffer.
    ///
    /// `payload` must be exactly the cell's payload (local bytes plus any
    /// reassembled overflow).
    pub fn decode(payload: &[u8], encoding: TextEncoding) -> Result<Self> {
        let (serial_types, header_len) = parse_header(payload, None)?;
        let record = decode_body(payload, serial_types, header_len, encoding)?;

        // In a well-formed record, the serial-type sizes account for the
        // whole payload.
        if record.total_len != payload.len() {
            return Err(ExhumeError::bad_record_header(format!(
                "serial types cover {} bytes, payload holds {}",
                record.total_len,
                payload.len()
            )));
        }
        Ok(record)
    }

    /// Decode a carved candidate starting at the front of `buf`.
    ///
    /// The candidate's true payload length is unknown, so the body length
    /// is synthesized from the serial types; `buf` only needs to be long
    /// enough to contain it. The serial-type count must equal
    /// `expected_columns`.
    pub fn decode_carved(
        buf: &[u8],
        expected_columns: usize,
        encoding: TextEncoding,
    ) -> Result<Self> {
        let (serial_types, header_len) = parse_header(buf, Some(expected_columns))?;
        if serial_types.len() != expected_columns {
            return Err(ExhumeError::bad_record_header(format!(
                "candidate has {} columns, table has {}",
                serial_types.len(),
                expected_columns
            )));
        }
        decode_body(buf, serial_types, header_len, encoding)
    }
}

/// Parse the record header: `header_length` varint followed by serial
/// types until the declared length is consumed.
fn parse_header(buf: &[u8], column_cap: Option<usize>) -> Result<(Vec<u64>, usize)> {
    let (header_len_raw, n) = read_varint(buf)?;
    let header_len = header_len_raw as usize;
    if header_len < 1 || header_len_raw > buf.len() as u64 {
        return Err(ExhumeError::bad_record_header(format!(
            "header length {} outside payload of {} bytes",
            header_len_raw,
            buf.len()
        )));
    }
    if header_len < n {
        return Err(ExhumeError::bad_record_header(format!(
            "header length {header_len} shorter than its own varint"
        )));
    }

    let cap = column_cap.unwrap_or(MAX_COLUMNS);
    let mut serial_types = Vec::new();
    let mut offset = n;
    while offset < header_len {
        let (serial_type, consumed) = read_varint(&buf[offset..header_len])?;
        if serial_type_len(serial_type).is_none() {
            return Err(ExhumeError::ReservedSerialType { serial_type });
        }
        serial_types.push(serial_type);
        if serial_types.len() > cap {
            return Err(ExhumeError::bad_record_header(format!(
                "more than {cap} serial types in header"
            )));
        }
        offset += consumed;
    }
    debug_assert_eq!(offset, header_len);

    Ok((serial_types, header_len))
}

/// Decode the column bodies following the header.
fn decode_body(
    buf: &[u8],
    serial_types: Vec<u64>,
    header_len: usize,
    encoding: TextEncoding,
) -> Result<Record> {
    let mut columns = Vec::with_capacity(serial_types.len());
    let mut offset = header_len;
    for &serial_type in &serial_types {
        let len = serial_type_len(serial_type)
            .ok_or(ExhumeError::ReservedSerialType { serial_type })? as usize;
        let body = buf.get(offset..).ok_or(ExhumeError::Truncated {
            needed: len,
            available: 0,
        })?;
        columns.push(decode_column(serial_type, body, encoding)?);
        offset += len;
    }

    Ok(Record {
        header_len,
        serial_types,
        columns,
        total_len: offset,
    })
}

/// The sizes implied by a carved candidate's record header, read without
/// decoding the body.
///
/// For a deleted row the cell's payload-length varint is gone, but the
/// serial types pin down the payload size exactly; when that size
/// exceeds the page's overflow threshold, the freed cell must have
/// carried an overflow pointer after its local payload, and the caller
/// can chase it.
#[derive(Debug, Clone)]
pub struct CarvedExtent {
    pub header_len: usize,
    pub serial_types: Vec<u64>,
    /// Synthesized payload length: header plus the serial-type sum.
    pub payload_len: u64,
}

impl CarvedExtent {
    /// Parse just the record header at the front of `buf`, requiring
    /// exactly `expected_columns` serial types.
    pub fn parse(buf: &[u8], expected_columns: usize) -> Result<Self> {
        let (serial_types, header_len) = parse_header(buf, Some(expected_columns))?;
        if serial_types.len() != expected_columns {
            return Err(ExhumeError::bad_record_header(format!(
                "candidate has {} columns, table has {}",
                serial_types.len(),
                expected_columns
            )));
        }
        let body: u64 = serial_types
            .iter()
            .map(|&t| serial_type_len(t).unwrap_or(0))
            .sum();
        Ok(Self {
            header_len,
            serial_types,
            payload_len: header_len as u64 + body,
        })
    }
}

/// Decode a record from a payload reassembled by the caller (for carved
/// candidates whose payload spilled into an overflow chain).
pub fn decode_reassembled(
    payload: &[u8],
    expected_columns: usize,
    encoding: TextEncoding,
) -> Result<Record> {
    let record = Record::decode(payload, encoding)?;
    if record.columns.len() != expected_columns {
        return Err(ExhumeError::bad_record_header(format!(
            "candidate has {} columns, table has {}",
            record.columns.len(),
            expected_columns
        )));
    }
    Ok(record)
}

/// The number of bytes a record with these serial types occupies,
/// including the header-length varint itself.
#[must_use]
pub fn record_size(serial_types: &[u64]) -> u64 {
    let types_len: u64 = serial_types.iter().map(|&t| varint_len(t) as u64).sum();
    // The header length varint covers itself; sizing it is iterative in
    // the rare case the header straddles a varint-length boundary.
    let mut header_len = types_len + 1;
    while varint_len(header_len) as u64 + types_len != header_len {
        header_len = varint_len(header_len) as u64 + types_len;
    }
    let body: u64 = serial_types
        .iter()
        .map(|&t| serial_type_len(t).unwrap_or(0))
        .sum();
    header_len + body
}
