//! Test configuration helpers.
//!
//! Key derivation is deliberately expensive in production; tests open many
//! stores, so they use the cheapest parameters the KDF accepts.

use sealdb_store::{KdfParams, StoreConfig};

/// Passphrase used by tests that do not care about its value.
pub const TEST_PASSPHRASE: &[u8] = b"correct horse battery staple";

/// Cheapest accepted key derivation parameters.
pub const FAST_KDF: KdfParams = KdfParams::new(64, 1, 1);

/// Returns a store configuration suitable for tests.
///
/// - `kdf`: [`FAST_KDF`]
/// - `sync_on_commit`: true (crash tests rely on it)
#[must_use]
pub fn test_store_config() -> StoreConfig {
    StoreConfig::builder().kdf(FAST_KDF).build()
}

/// Like [`test_store_config`] with 512-byte pages, so small data sets
/// already build deep trees and overflow chains.
#[must_use]
pub fn small_page_config() -> StoreConfig {
    StoreConfig::builder().kdf(FAST_KDF).page_size(512).build()
}
