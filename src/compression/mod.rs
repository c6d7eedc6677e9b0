//! # Compression
//!
//! Block payloads and metadata snapshots are compressed before they are
//! handed to the crypto wrapper for encryption. Three real codecs are
//! supported, plus a pass-through `None`, matching the algorithm set objects
//! are tagged with in their backend metadata map (SPEC_FULL.md §6).

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Compression error types.
#[derive(Debug, Error)]
pub enum CompressionError {
    /// I/O error during compression/decompression.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The algorithm tag on an object's metadata is not one we recognize.
    #[error("unknown compression algorithm: {0}")]
    UnknownAlgorithm(String),
}

pub type Result<T> = std::result::Result<T, CompressionError>;

/// Compression algorithm an object was (or should be) stored with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    None,
    Zlib,
    Bzip2,
    Lzma,
}

impl Algorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::None => "none",
            Algorithm::Zlib => "zlib",
            Algorithm::Bzip2 => "bzip2",
            Algorithm::Lzma => "lzma",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Algorithm::None),
            "zlib" => Ok(Algorithm::Zlib),
            "bzip2" => Ok(Algorithm::Bzip2),
            "lzma" => Ok(Algorithm::Lzma),
            other => Err(CompressionError::UnknownAlgorithm(other.to_string())),
        }
    }
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::Lzma
    }
}

/// Compress `data` with the given algorithm.
pub fn compress(data: &[u8], algo: Algorithm) -> Result<Vec<u8>> {
    match algo {
        Algorithm::None => Ok(data.to_vec()),
        Algorithm::Zlib => {
            let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(data)?;
            Ok(enc.finish()?)
        }
        Algorithm::Bzip2 => {
            let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
            enc.write_all(data)?;
            Ok(enc.finish()?)
        }
        Algorithm::Lzma => {
            let mut enc = xz2::write::XzEncoder::new(Vec::new(), 6);
            enc.write_all(data)?;
            Ok(enc.finish()?)
        }
    }
}

/// Decompress `data` that was compressed with the given algorithm.
pub fn decompress(data: &[u8], algo: Algorithm) -> Result<Vec<u8>> {
    match algo {
        Algorithm::None => Ok(data.to_vec()),
        Algorithm::Zlib => {
            let mut dec = flate2::read::ZlibDecoder::new(data);
            let mut out = Vec::new();
            dec.read_to_end(&mut out)?;
            Ok(out)
        }
        Algorithm::Bzip2 => {
            let mut dec = bzip2::read::BzDecoder::new(data);
            let mut out = Vec::new();
            dec.read_to_end(&mut out)?;
            Ok(out)
        }
        Algorithm::Lzma => {
            let mut dec = xz2::read::XzDecoder::new(data);
            let mut out = Vec::new();
            dec.read_to_end(&mut out)?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(algo: Algorithm) {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(64);
        let compressed = compress(&data, algo).unwrap();
        let restored = decompress(&compressed, algo).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn none_round_trips() {
        round_trip(Algorithm::None);
    }

    #[test]
    fn zlib_round_trips() {
        round_trip(Algorithm::Zlib);
    }

    #[test]
    fn bzip2_round_trips() {
        round_trip(Algorithm::Bzip2);
    }

    #[test]
    fn lzma_round_trips() {
        round_trip(Algorithm::Lzma);
    }

    #[test]
    fn algorithm_name_round_trips() {
        for algo in [Algorithm::None, Algorithm::Zlib, Algorithm::Bzip2, Algorithm::Lzma] {
            assert_eq!(Algorithm::parse(algo.as_str()).unwrap(), algo);
        }
    }

    #[test]
    fn unknown_algorithm_name_errors() {
        assert!(Algorithm::parse("zstd").is_err());
    }
}
