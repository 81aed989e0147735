//! Overflow page chains.
//!
//! Payload that does not fit on a leaf page spills into a singly-linked
//! chain of overflow pages. Each overflow page starts with the 4-byte
//! page number of the next page in the chain (0 terminates), followed by
//! up to `usable_size - 4` payload bytes.

use std::collections::HashSet;

use exhume_error::{ExhumeError, Result};
use exhume_types::PageNumber;
use exhume_types::serial_type::be_u32;
use tracing::warn;

/// Reassemble a payload that spans local data and an overflow chain.
///
/// `local_data` is the on-page portion, `first_overflow` the head of the
/// chain, and `total_payload_size` the full payload length. `read_page`
/// reads a raw page by number. Revisiting a page fails with
/// [`ExhumeError::OverflowCycle`]; a chain that terminates early fails
/// with [`ExhumeError::OverflowTruncated`].
pub fn read_overflow_chain<F>(
    local_data: &[u8],
    first_overflow: PageNumber,
    total_payload_size: u64,
    usable_size: u32,
    read_page: &mut F,
) -> Result<Vec<u8>>
where
    F: FnMut(PageNumber) -> Result<std::rc::Rc<[u8]>>,
{
    let total = total_payload_size as usize;
    let bytes_per_page = (usable_size as usize).saturating_sub(4);
    if bytes_per_page == 0 {
        return Err(ExhumeError::bad_file_header(format!(
            "usable page size {usable_size} cannot hold overflow data"
        )));
    }

    let mut payload = Vec::with_capacity(total);
    payload.extend_from_slice(local_data);

    let mut visited: HashSet<PageNumber> = HashSet::new();
    let mut next = Some(first_overflow);

    while payload.len() < total {
        let Some(pgno) = next else {
            warn!(
                expected = total,
                got = payload.len(),
                "overflow chain ended before supplying the full payload"
            );
            return Err(ExhumeError::OverflowTruncated {
                got: payload.len(),
                expected: total,
            });
        };
        if !visited.insert(pgno) {
            warn!(page = pgno.get(), "overflow chain revisited a page");
            return Err(ExhumeError::OverflowCycle { page: pgno.get() });
        }

        let page = read_page(pgno)?;
        let next_raw = be_u32(&page, 0)?;
        next = PageNumber::new(next_raw);

        let remaining = total - payload.len();
        let available = page.len().saturating_sub(4).min(bytes_per_page);
        let take = remaining.min(available);
        payload.extend_from_slice(&page[4..4 + take]);
    }

    Ok(payload)
}
