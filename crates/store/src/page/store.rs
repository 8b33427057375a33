//! Encrypted page store over a storage backend.

use std::io;

use super::Page;
use crate::{
    backend::{FileHeader, HEADER_SIZE, StorageBackend},
    cipher::{PAGE_OVERHEAD, PageCipher},
    error::{Error, PageId, Result},
};

/// Reads and writes logical pages through the cipher.
///
/// The backend only ever sees physical (encrypted) images. Free-list and
/// allocation policy live in [`super::PageAllocator`]; this type is pure
/// addressing plus encryption.
pub struct PageStore<B: StorageBackend> {
    backend: B,
    cipher: PageCipher,
    header: FileHeader,
}

impl<B: StorageBackend> PageStore<B> {
    /// Wraps an opened backend with the cipher unlocked for it.
    pub fn new(backend: B, cipher: PageCipher, header: FileHeader) -> Self {
        Self { backend, cipher, header }
    }

    /// Physical page size (as stored in the file).
    pub fn physical_page_size(&self) -> usize {
        self.backend.page_size()
    }

    /// Logical page size: what the B-tree sees after the cipher overhead.
    pub fn usable_size(&self) -> usize {
        self.backend.page_size() - PAGE_OVERHEAD
    }

    /// The file header.
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// The cipher in use.
    pub fn cipher(&self) -> &PageCipher {
        &self.cipher
    }

    /// The underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Number of page slots present in the main file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file size cannot be read.
    pub fn page_count(&self) -> Result<u64> {
        let size = self.backend.file_size()?;
        Ok(size.saturating_sub(HEADER_SIZE as u64) / self.physical_page_size() as u64)
    }

    /// Reads the physical image of a page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the page lies beyond the end of the file or
    /// the read fails.
    pub fn read_physical(&self, page_id: PageId) -> Result<Vec<u8>> {
        let count = self.page_count()?;
        if page_id >= count {
            return Err(Error::Io {
                source: io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("page {page_id} is beyond the end of the file ({count} pages)"),
                ),
            });
        }
        self.backend.read_page(page_id)
    }

    /// Writes a physical image, growing the file if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the write fails.
    pub fn write_physical(&self, page_id: PageId, image: &[u8]) -> Result<()> {
        self.backend.write_page(page_id, image)
    }

    /// Decrypts a physical image read from the file or the log.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] if the image does not verify.
    pub fn decrypt(&self, page_id: PageId, image: &[u8]) -> Result<Page> {
        Ok(Page::from_bytes(page_id, self.cipher.decrypt_page(page_id, image)?))
    }

    /// Encrypts a logical page into its physical image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the page has the wrong size, or
    /// [`Error::Io`] if the RNG fails.
    pub fn encrypt(&self, page: &Page) -> Result<Vec<u8>> {
        if page.size() != self.usable_size() {
            return Err(Error::corrupted(format!(
                "page {} is {} bytes, expected {}",
                page.id,
                page.size(),
                self.usable_size()
            )));
        }
        self.cipher.encrypt_page(page.id, &page.data)
    }

    /// Reads and decrypts a page directly from the main file.
    ///
    /// Slots at or past `next_page` never held a committed page, so a
    /// zero-filled one reads as an empty page. Below `next_page` every image
    /// must verify.
    ///
    /// # Errors
    ///
    /// See [`Self::read_physical`] and [`Self::decrypt`].
    pub fn read(&self, page_id: PageId, next_page: PageId) -> Result<Page> {
        let image = self.read_physical(page_id)?;
        if page_id >= next_page && image.iter().all(|&b| b == 0) {
            return Ok(Page::from_bytes(page_id, vec![0u8; self.usable_size()]));
        }
        self.decrypt(page_id, &image)
    }

    /// Encrypts and writes a page directly to the main file.
    ///
    /// # Errors
    ///
    /// See [`Self::encrypt`] and [`Self::write_physical`].
    pub fn write(&self, page: &Page) -> Result<()> {
        let image = self.encrypt(page)?;
        self.write_physical(page.id, &image)
    }

    /// Grows the file so it holds at least `page_count` pages.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be extended.
    pub fn grow(&self, page_count: u64) -> Result<()> {
        let size = HEADER_SIZE as u64 + page_count * self.physical_page_size() as u64;
        self.backend.extend(size)
    }

    /// Flushes the main file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the sync fails.
    pub fn sync(&self) -> Result<()> {
        self.backend.sync()
    }

    /// Re-encrypts the first `page_count` pages of the main file under
    /// `cipher` and atomically replaces the file, adopting the new header
    /// and cipher as soon as the backend serves the new file.
    ///
    /// The main file must be current (log checkpointed) and every page
    /// below `page_count` committed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] if a current page does not verify
    /// and [`Error::Io`] if the new file cannot be staged; the store then
    /// keeps its old file and key. A failure after the swap is
    /// [`Error::Corrupted`] and the store already uses the new key.
    pub fn reencrypt(&mut self, header: FileHeader, cipher: PageCipher, page_count: u64) -> Result<()> {
        let old = &self.cipher;
        let header_bytes = header.to_bytes();
        let replaced = self.backend.replace_all(&header_bytes, page_count, &mut |page_id, image| {
            let plaintext = old.decrypt_page(page_id, &image)?;
            cipher.encrypt_page(page_id, &plaintext)
        });

        let swapped = match &replaced {
            Ok(()) => true,
            Err(_) => self.backend.read_header().is_ok_and(|current| current == header_bytes),
        };
        if swapped {
            self.header = header;
            self.cipher = cipher;
        }
        replaced
    }
}
