//! Value cells and overflow chains.
//!
//! A leaf stores each value as a *value cell*:
//!
//! ```text
//! [flags: 1][total_len: 4][first_overflow: 8, if flagged][inline bytes]
//! ```
//!
//! Values that fit the cell budget are stored whole. Larger values keep a
//! prefix inline and put the rest in a chain of overflow pages:
//!
//! ```text
//! [Page Header: 16][next: 8][len: 2][data]
//! ```
//!
//! Chains are written once and never modified; replacing or deleting the
//! value frees the whole chain.

use super::{
    PageProvider, PageProviderMut,
    node::{LEAF_CELL_OVERHEAD, cell_budget},
};
use crate::{
    error::{Error, PageId, PageType, Result},
    page::{PAGE_HEADER_SIZE, Page, read_u16, read_u32, read_u64},
};

const FLAG_OVERFLOW: u8 = 0x01;
const INLINE_HEADER: usize = 1 + 4;
const OVERFLOW_HEADER: usize = INLINE_HEADER + 8;
const NEXT_OFFSET: usize = PAGE_HEADER_SIZE;
const LEN_OFFSET: usize = PAGE_HEADER_SIZE + 8;
const DATA_OFFSET: usize = PAGE_HEADER_SIZE + 10;

/// Payload bytes carried by one overflow page.
pub fn overflow_capacity(page_size: usize) -> usize {
    page_size - DATA_OFFSET
}

/// Parsed view of a value cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueCell<'a> {
    /// Full value length.
    pub total_len: u32,
    /// First overflow page, if the value spills.
    pub overflow: Option<PageId>,
    /// Bytes stored in the leaf.
    pub inline: &'a [u8],
}

impl<'a> ValueCell<'a> {
    /// Parses an encoded value cell.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the cell is truncated or its lengths
    /// disagree.
    pub fn parse(cell: &'a [u8]) -> Result<Self> {
        if cell.len() < INLINE_HEADER {
            return Err(Error::corrupted("value cell truncated"));
        }
        let total_len = read_u32(cell, 1);
        let (overflow, inline) = if cell[0] & FLAG_OVERFLOW != 0 {
            if cell.len() < OVERFLOW_HEADER {
                return Err(Error::corrupted("overflow value cell truncated"));
            }
            let first = read_u64(cell, INLINE_HEADER);
            if first == 0 {
                return Err(Error::corrupted("overflow value cell has null chain"));
            }
            (Some(first), &cell[OVERFLOW_HEADER..])
        } else {
            (None, &cell[INLINE_HEADER..])
        };
        let consistent = match overflow {
            Some(_) => inline.len() < total_len as usize,
            None => inline.len() == total_len as usize,
        };
        if !consistent {
            return Err(Error::corrupted("value cell length mismatch"));
        }
        Ok(Self { total_len, overflow, inline })
    }

    /// Bytes held in the overflow chain.
    pub fn spilled_len(&self) -> usize {
        self.total_len as usize - self.inline.len()
    }
}

/// Builds a value cell for `value` under a key of `key_len` bytes, writing
/// an overflow chain when the value does not fit the cell budget.
///
/// # Errors
///
/// Returns [`Error::ValueTooLarge`] for values over `u32::MAX` bytes.
pub fn build_cell<P: PageProviderMut>(provider: &mut P, key_len: usize, value: &[u8]) -> Result<Vec<u8>> {
    let total_len = u32::try_from(value.len())
        .map_err(|_| Error::ValueTooLarge { size: value.len(), max: u32::MAX as usize })?;
    let room = cell_budget(provider.usable_size()) - LEAF_CELL_OVERHEAD - key_len;

    if INLINE_HEADER + value.len() <= room {
        let mut cell = Vec::with_capacity(INLINE_HEADER + value.len());
        cell.push(0);
        cell.extend_from_slice(&total_len.to_le_bytes());
        cell.extend_from_slice(value);
        return Ok(cell);
    }

    let prefix = room - OVERFLOW_HEADER;
    let first = write_chain(provider, &value[prefix..])?;
    let mut cell = Vec::with_capacity(room);
    cell.push(FLAG_OVERFLOW);
    cell.extend_from_slice(&total_len.to_le_bytes());
    cell.extend_from_slice(&first.to_le_bytes());
    cell.extend_from_slice(&value[..prefix]);
    Ok(cell)
}

fn write_chain<P: PageProviderMut>(provider: &mut P, data: &[u8]) -> Result<PageId> {
    let page_size = provider.usable_size();
    let chunks: Vec<&[u8]> = data.chunks(overflow_capacity(page_size)).collect();
    let mut ids = Vec::with_capacity(chunks.len());
    for _ in 0..chunks.len() {
        ids.push(provider.allocate_page()?);
    }
    let commit_seq = provider.commit_seq();
    for (i, chunk) in chunks.iter().enumerate() {
        let next = ids.get(i + 1).copied().unwrap_or(0);
        let mut page = Page::new(ids[i], page_size, PageType::Overflow, commit_seq);
        page.data[NEXT_OFFSET..NEXT_OFFSET + 8].copy_from_slice(&next.to_le_bytes());
        page.data[LEN_OFFSET..LEN_OFFSET + 2].copy_from_slice(&(chunk.len() as u16).to_le_bytes());
        page.data[DATA_OFFSET..DATA_OFFSET + chunk.len()].copy_from_slice(chunk);
        provider.write_page(page);
    }
    Ok(ids[0])
}

/// Visits each page of the chain holding `cell`'s spilled bytes, checking
/// page types, lengths and the page-count bound.
fn walk_chain<P: PageProvider>(
    provider: &P,
    cell: &ValueCell<'_>,
    mut visit: impl FnMut(PageId, &[u8]),
) -> Result<()> {
    let Some(mut page_id) = cell.overflow else {
        return Ok(());
    };
    let mut remaining = cell.spilled_len();
    let per_page = overflow_capacity(provider.usable_size());
    let max_pages = remaining.div_ceil(per_page);

    for _ in 0..max_pages {
        if page_id == 0 || page_id >= provider.page_limit() {
            return Err(Error::corrupted(format!("overflow pointer {page_id} out of range")));
        }
        let page = provider.read_page(page_id)?;
        page.expect_type(PageType::Overflow)?;
        let len = read_u16(&page.data, LEN_OFFSET) as usize;
        if len == 0 || len > remaining || len > per_page {
            return Err(Error::corrupted(format!("overflow page {page_id} has bad length {len}")));
        }
        visit(page_id, &page.data[DATA_OFFSET..DATA_OFFSET + len]);
        remaining -= len;
        let next = read_u64(&page.data, NEXT_OFFSET);
        if remaining == 0 {
            if next != 0 {
                return Err(Error::corrupted(format!("overflow chain continues past page {page_id}")));
            }
            return Ok(());
        }
        page_id = next;
    }
    Err(Error::corrupted("overflow chain shorter than value length"))
}

/// Reassembles the full value stored in `cell`.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if the chain is malformed.
pub fn read_value<P: PageProvider>(provider: &P, cell: &[u8]) -> Result<Vec<u8>> {
    let cell = ValueCell::parse(cell)?;
    let mut value = Vec::with_capacity(cell.total_len as usize);
    value.extend_from_slice(cell.inline);
    walk_chain(provider, &cell, |_, data| value.extend_from_slice(data))?;
    Ok(value)
}

/// Returns the overflow page ids referenced by `cell`, in chain order.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if the chain is malformed.
pub fn chain_pages<P: PageProvider>(provider: &P, cell: &[u8]) -> Result<Vec<PageId>> {
    let cell = ValueCell::parse(cell)?;
    let mut pages = Vec::new();
    walk_chain(provider, &cell, |page_id, _| pages.push(page_id))?;
    Ok(pages)
}

/// Frees the overflow chain referenced by `cell`, if any.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if the chain is malformed.
pub fn free_chain<P: PageProviderMut>(provider: &mut P, cell: &[u8]) -> Result<()> {
    for page_id in chain_pages(&*provider, cell)? {
        provider.free_page(page_id);
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::btree::tests::MemProvider;

    #[test]
    fn test_small_value_stays_inline() {
        let mut provider = MemProvider::new(472);
        let cell = build_cell(&mut provider, 4, b"hello").unwrap();
        let parsed = ValueCell::parse(&cell).unwrap();
        assert_eq!(parsed.overflow, None);
        assert_eq!(parsed.inline, b"hello");
        assert_eq!(provider.page_count(), 0);
        assert_eq!(read_value(&provider, &cell).unwrap(), b"hello");
    }

    #[test]
    fn test_large_value_spills() {
        let mut provider = MemProvider::new(472);
        let value: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        let cell = build_cell(&mut provider, 10, &value).unwrap();

        assert!(cell.len() + 10 + LEAF_CELL_OVERHEAD <= cell_budget(472));
        let parsed = ValueCell::parse(&cell).unwrap();
        assert!(parsed.overflow.is_some());
        assert_eq!(parsed.total_len, 5000);

        let pages = chain_pages(&provider, &cell).unwrap();
        assert_eq!(pages.len(), parsed.spilled_len().div_ceil(overflow_capacity(472)));
        assert_eq!(read_value(&provider, &cell).unwrap(), value);
    }

    #[test]
    fn test_boundary_value_sizes() {
        let mut provider = MemProvider::new(472);
        let room = cell_budget(472) - LEAF_CELL_OVERHEAD - 3;
        for len in [room - INLINE_HEADER - 1, room - INLINE_HEADER, room - INLINE_HEADER + 1] {
            let value = vec![7u8; len];
            let cell = build_cell(&mut provider, 3, &value).unwrap();
            assert!(cell.len() <= room);
            assert_eq!(read_value(&provider, &cell).unwrap(), value);
        }
    }

    #[test]
    fn test_free_chain_frees_every_page() {
        let mut provider = MemProvider::new(472);
        let cell = build_cell(&mut provider, 1, &vec![1u8; 2000]).unwrap();
        let pages = chain_pages(&provider, &cell).unwrap();
        free_chain(&mut provider, &cell).unwrap();
        assert_eq!(provider.freed, pages);
    }

    #[test]
    fn test_broken_chain_detected() {
        let mut provider = MemProvider::new(472);
        let cell = build_cell(&mut provider, 1, &vec![1u8; 2000]).unwrap();
        let pages = chain_pages(&provider, &cell).unwrap();
        provider.pages.remove(pages.last().unwrap());
        assert!(read_value(&provider, &cell).is_err());
    }

    #[test]
    fn test_parse_rejects_inconsistent_lengths() {
        let mut cell = vec![0u8];
        cell.extend_from_slice(&10u32.to_le_bytes());
        cell.extend_from_slice(b"short");
        assert!(matches!(ValueCell::parse(&cell), Err(Error::Corrupted { .. })));
        assert!(matches!(ValueCell::parse(&[0, 1]), Err(Error::Corrupted { .. })));
    }
}
