// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Body compression.
//!
//! Bodies larger than `compress_body_threshold` are compressed before
//! dispatch and the request carries the `COMPRESSED` sys flag. Batches are
//! never compressed.

use std::io::{self, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

/// Body compression collaborator.
pub trait Compressor: Send + Sync {
    /// Compress `body` at `level` (0-9).
    fn compress(&self, body: &[u8], level: u32) -> io::Result<Vec<u8>>;
}

/// zlib compression (the broker-side default codec).
#[derive(Debug, Default, Clone, Copy)]
pub struct ZlibCompressor;

impl Compressor for ZlibCompressor {
    fn compress(&self, body: &[u8], level: u32) -> io::Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(body.len() / 2), Compression::new(level));
        encoder.write_all(body)?;
        encoder.finish()
    }
}

/// Inverse of [`ZlibCompressor`], used by tooling and tests that play the
/// broker side.
pub fn zlib_decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 2);
    ZlibDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}
