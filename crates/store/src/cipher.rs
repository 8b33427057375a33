//! Per-page authenticated encryption.
//!
//! Every byte that reaches the main file or the WAL goes through
//! [`PageCipher`]. The passphrase is stretched once with Argon2id and the
//! per-file salt; HKDF-SHA256 then expands the result into the page key.
//!
//! Physical page layout:
//!
//! ```text
//! [ nonce: 24 ][ ciphertext: page_size - 40 ][ tag: 16 ]
//! ```
//!
//! Pages use XChaCha20-Poly1305 with a fresh random nonce on every write and
//! the page id bound in as associated data, so a page copied to another slot
//! fails authentication and rewriting identical plaintext never repeats
//! ciphertext.

use std::{fmt, io};

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    Key, Tag, XChaCha20Poly1305, XNonce,
    aead::{AeadInPlace, KeyInit},
};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Error, PageId, Result};

/// KDF salt length stored in the file header.
pub const SALT_SIZE: usize = 16;
/// XChaCha20 nonce length.
pub const NONCE_SIZE: usize = 24;
/// Poly1305 tag length.
pub const TAG_SIZE: usize = 16;
/// Bytes of each physical page consumed by the nonce and tag.
pub const PAGE_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

const KEY_SIZE: usize = 32;
const KEY_CHECK_PLAINTEXT: &[u8; 32] = b"sealdb key-check block, format 1";
/// Size of the sealed key-check block in the header.
pub const KEY_CHECK_SIZE: usize = NONCE_SIZE + KEY_CHECK_PLAINTEXT.len() + TAG_SIZE;

const PAGE_AAD_LABEL: &[u8] = b"sealdb:page:";
const KEY_CHECK_AAD: &[u8] = b"sealdb:key-check";
const PAGE_KEY_INFO: &[u8] = b"sealdb page key v1";

/// Argon2id cost parameters.
///
/// Stored in the file header at creation, so a store always reopens with
/// the parameters it was created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism (lanes).
    pub parallelism: u32,
}

impl KdfParams {
    /// Creates a parameter set.
    pub const fn new(memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        Self { memory_kib, iterations, parallelism }
    }

    fn to_argon2(self) -> Result<Params> {
        Params::new(self.memory_kib, self.iterations, self.parallelism, Some(KEY_SIZE))
            .map_err(|e| Error::InvalidConfig { reason: format!("KDF parameters: {e}") })
    }

    /// Checks the parameters against Argon2's limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when Argon2 rejects them.
    pub fn validate(&self) -> Result<()> {
        self.to_argon2().map(|_| ())
    }
}

impl Default for KdfParams {
    /// 19 MiB, 2 passes, 1 lane.
    fn default() -> Self {
        Self { memory_kib: 19 * 1024, iterations: 2, parallelism: 1 }
    }
}

/// Raw 256-bit key material, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct KeyBytes([u8; KEY_SIZE]);

/// Encrypts and decrypts individual pages.
#[derive(Clone)]
pub struct PageCipher {
    page_key: KeyBytes,
}

impl PageCipher {
    /// Derives the page key from a passphrase and the file salt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the KDF parameters are rejected.
    pub fn derive(passphrase: &[u8], salt: &[u8; SALT_SIZE], params: &KdfParams) -> Result<Self> {
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2()?);

        let mut master = Zeroizing::new([0u8; KEY_SIZE]);
        argon2
            .hash_password_into(passphrase, salt, &mut master[..])
            .map_err(|e| Error::InvalidConfig { reason: format!("key derivation failed: {e}") })?;

        let hk = Hkdf::<Sha256>::new(Some(salt), &master[..]);
        let mut page_key = KeyBytes([0u8; KEY_SIZE]);
        hk.expand(PAGE_KEY_INFO, &mut page_key.0)
            .map_err(|e| Error::InvalidConfig { reason: format!("key expansion failed: {e}") })?;

        Ok(Self { page_key })
    }

    fn aead(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.page_key.0))
    }

    /// Encrypts a logical page into its physical form (`plaintext.len() + PAGE_OVERHEAD` bytes).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the system RNG fails.
    pub fn encrypt_page(&self, page_id: PageId, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = generate_nonce()?;
        let mut out = Vec::with_capacity(plaintext.len() + PAGE_OVERHEAD);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(plaintext);

        let tag = self
            .aead()
            .encrypt_in_place_detached(
                XNonce::from_slice(&nonce),
                &page_aad(page_id),
                &mut out[NONCE_SIZE..],
            )
            .map_err(|_| Error::corrupted(format!("page {page_id} could not be encrypted")))?;
        out.extend_from_slice(tag.as_slice());
        Ok(out)
    }

    /// Decrypts a physical page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] if the tag does not verify (wrong
    /// key, tampering, or a page image stored under the wrong id).
    pub fn decrypt_page(&self, page_id: PageId, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < PAGE_OVERHEAD {
            return Err(Error::corrupted(format!(
                "page {page_id} image is {} bytes, shorter than the cipher overhead",
                ciphertext.len()
            )));
        }
        let (nonce, rest) = ciphertext.split_at(NONCE_SIZE);
        let (body, tag) = rest.split_at(rest.len() - TAG_SIZE);
        let mut plaintext = body.to_vec();
        self.aead()
            .decrypt_in_place_detached(
                XNonce::from_slice(nonce),
                &page_aad(page_id),
                &mut plaintext,
                Tag::from_slice(tag),
            )
            .map_err(|_| Error::Authentication { page_id })?;
        Ok(plaintext)
    }

    /// Seals the fixed key-check plaintext for the file header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the system RNG fails.
    pub fn seal_key_check(&self) -> Result<[u8; KEY_CHECK_SIZE]> {
        let nonce = generate_nonce()?;
        let mut body = *KEY_CHECK_PLAINTEXT;
        let tag = self
            .aead()
            .encrypt_in_place_detached(XNonce::from_slice(&nonce), KEY_CHECK_AAD, &mut body)
            .map_err(|_| Error::corrupted("key-check block could not be sealed"))?;

        let mut block = [0u8; KEY_CHECK_SIZE];
        block[..NONCE_SIZE].copy_from_slice(&nonce);
        block[NONCE_SIZE..NONCE_SIZE + body.len()].copy_from_slice(&body);
        block[NONCE_SIZE + body.len()..].copy_from_slice(tag.as_slice());
        Ok(block)
    }

    /// Confirms this key opens the header's key-check block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongPassphrase`] if it does not.
    pub fn verify_key_check(&self, block: &[u8; KEY_CHECK_SIZE]) -> Result<()> {
        let body_len = KEY_CHECK_PLAINTEXT.len();
        let nonce = &block[..NONCE_SIZE];
        let mut body = [0u8; KEY_CHECK_PLAINTEXT.len()];
        body.copy_from_slice(&block[NONCE_SIZE..NONCE_SIZE + body_len]);
        let tag = &block[NONCE_SIZE + body_len..];

        self.aead()
            .decrypt_in_place_detached(
                XNonce::from_slice(nonce),
                KEY_CHECK_AAD,
                &mut body,
                Tag::from_slice(tag),
            )
            .map_err(|_| Error::WrongPassphrase)?;

        if &body != KEY_CHECK_PLAINTEXT {
            return Err(Error::WrongPassphrase);
        }
        Ok(())
    }
}

impl fmt::Debug for PageCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageCipher").field("page_key", &"[REDACTED]").finish()
    }
}

fn page_aad(page_id: PageId) -> [u8; PAGE_AAD_LABEL.len() + 8] {
    let mut aad = [0u8; PAGE_AAD_LABEL.len() + 8];
    aad[..PAGE_AAD_LABEL.len()].copy_from_slice(PAGE_AAD_LABEL);
    aad[PAGE_AAD_LABEL.len()..].copy_from_slice(&page_id.to_le_bytes());
    aad
}

fn generate_nonce() -> Result<[u8; NONCE_SIZE]> {
    let mut nonce = [0u8; NONCE_SIZE];
    getrandom::getrandom(&mut nonce).map_err(io::Error::from)?;
    Ok(nonce)
}

/// Generates a fresh random KDF salt.
///
/// # Errors
///
/// Returns [`Error::Io`] if the system RNG fails.
pub fn generate_salt() -> Result<[u8; SALT_SIZE]> {
    let mut salt = [0u8; SALT_SIZE];
    getrandom::getrandom(&mut salt).map_err(io::Error::from)?;
    Ok(salt)
}
