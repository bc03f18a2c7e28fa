//! Hash utilities for pak manifests.
//!
//! Manifest-driven games identify each pak by the lowercase hex MD5 of its
//! content together with its size in bytes.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

/// Digest and size of a pak's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest {
    pub md5: String,
    pub size: u64,
}

/// Compute MD5 and byte count of a stream.
///
/// Uses streaming to handle large paks without loading them into memory.
pub fn md5_reader(reader: &mut dyn Read) -> Result<ContentDigest> {
    let mut context = md5::Context::new();
    let mut buffer = [0u8; 65536]; // 64KB read buffer
    let mut size = 0u64;
    loop {
        let bytes_read = reader.read(&mut buffer).context("Failed to read stream for hashing")?;
        if bytes_read == 0 {
            break;
        }
        context.write_all(&buffer[..bytes_read])?;
        size += bytes_read as u64;
    }

    Ok(ContentDigest {
        md5: format!("{:x}", context.compute()),
        size,
    })
}

/// Compute MD5 and size of a file.
pub fn md5_file(path: &Path) -> Result<ContentDigest> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = BufReader::with_capacity(1024 * 1024, file); // 1MB buffer
    md5_reader(&mut reader).with_context(|| format!("Failed to hash {}", path.display()))
}
