//! In-memory storage backend for tests and ephemeral stores.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::{FileHeader, HEADER_SIZE, StorageBackend};
use crate::error::{Error, PageId, Result};

/// In-memory storage backend.
///
/// All data is stored in memory and lost when the backend is dropped. Pages
/// still pass through the cipher, so the contents are ciphertext just like
/// on disk.
pub struct InMemoryBackend {
    /// The database header.
    header: RwLock<Vec<u8>>,
    /// Pages indexed by page ID.
    pages: RwLock<HashMap<PageId, Vec<u8>>>,
    /// Page size in bytes.
    page_size: usize,
    /// Simulated file size.
    file_size: RwLock<u64>,
}

impl InMemoryBackend {
    /// Creates an empty backend holding `header`.
    pub fn new(header: &FileHeader) -> Self {
        Self {
            header: RwLock::new(header.to_bytes().to_vec()),
            pages: RwLock::new(HashMap::new()),
            page_size: header.page_size(),
            file_size: RwLock::new(HEADER_SIZE as u64),
        }
    }

    /// Returns the number of pages currently stored.
    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_header(&self) -> Result<Vec<u8>> {
        Ok(self.header.read().clone())
    }

    fn write_header(&self, header: &[u8]) -> Result<()> {
        if header.len() != HEADER_SIZE {
            return Err(Error::Corrupted {
                reason: format!("Invalid header size: {} (expected {})", header.len(), HEADER_SIZE),
            });
        }

        *self.header.write() = header.to_vec();
        Ok(())
    }

    fn read_page(&self, page_id: PageId) -> Result<Vec<u8>> {
        let pages = self.pages.read();
        match pages.get(&page_id) {
            Some(data) => Ok(data.clone()),
            None => Ok(vec![0u8; self.page_size]),
        }
    }

    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size {
            return Err(Error::Corrupted {
                reason: format!(
                    "Invalid page data size: {} (expected {})",
                    data.len(),
                    self.page_size
                ),
            });
        }

        self.pages.write().insert(page_id, data.to_vec());

        let required_size = self.page_offset(page_id) + self.page_size as u64;
        let mut file_size = self.file_size.write();
        if *file_size < required_size {
            *file_size = required_size;
        }

        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(*self.file_size.read())
    }

    fn extend(&self, new_size: u64) -> Result<()> {
        let mut file_size = self.file_size.write();
        if new_size > *file_size {
            *file_size = new_size;
        }
        Ok(())
    }

    fn replace_all(
        &mut self,
        header: &[u8],
        page_count: u64,
        page: &mut dyn FnMut(PageId, Vec<u8>) -> Result<Vec<u8>>,
    ) -> Result<()> {
        let mut pages = HashMap::with_capacity(page_count as usize);
        for page_id in 0..page_count {
            pages.insert(page_id, page(page_id, self.read_page(page_id)?)?);
        }

        self.write_header(header)?;
        *self.pages.get_mut() = pages;
        *self.file_size.get_mut() = self.page_offset(page_count);
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}
