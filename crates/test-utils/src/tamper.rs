//! Helpers that damage store files the way disks and attackers do.

// Test utilities are expected to panic on failure - that's their purpose
#![allow(clippy::expect_used)]

use std::{
    fs::OpenOptions,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use sealdb_store::{HEADER_SIZE, PageId};

/// Byte offset of `page_id` in a store file with `page_size` pages.
#[must_use]
pub fn page_offset(page_size: usize, page_id: PageId) -> u64 {
    HEADER_SIZE as u64 + page_id * page_size as u64
}

/// XORs the byte at `offset` with `mask`.
///
/// # Panics
///
/// Panics if the file cannot be read or written.
pub fn flip_byte(path: &Path, offset: u64, mask: u8) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).expect("open file to tamper");
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).expect("seek");
    file.read_exact(&mut byte).expect("read byte");
    byte[0] ^= mask;
    file.seek(SeekFrom::Start(offset)).expect("seek");
    file.write_all(&byte).expect("write byte");
    file.sync_all().expect("sync tampered file");
}

/// Flips one bit in the middle of page `page_id`'s ciphertext.
///
/// # Panics
///
/// Panics if the file cannot be read or written.
pub fn corrupt_page(path: &Path, page_size: usize, page_id: PageId) {
    flip_byte(path, page_offset(page_size, page_id) + page_size as u64 / 2, 0x01);
}

/// Overwrites page `page_id` with zeros, as a lost write or a wiped
/// sector would leave it.
///
/// # Panics
///
/// Panics if the file cannot be written.
pub fn zero_page(path: &Path, page_size: usize, page_id: PageId) {
    let mut file = OpenOptions::new().write(true).open(path).expect("open file to tamper");
    file.seek(SeekFrom::Start(page_offset(page_size, page_id))).expect("seek");
    file.write_all(&vec![0u8; page_size]).expect("zero page");
    file.sync_all().expect("sync tampered file");
}

/// Cuts `bytes` off the end of the file, as a torn append would.
///
/// # Panics
///
/// Panics if the file cannot be resized.
pub fn truncate_tail(path: &Path, bytes: u64) {
    let file = OpenOptions::new().write(true).open(path).expect("open file to truncate");
    let len = file.metadata().expect("file metadata").len();
    file.set_len(len.saturating_sub(bytes)).expect("truncate file");
}
