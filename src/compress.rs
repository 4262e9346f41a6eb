//! Compression capability.
//!
//! Everything that needs a compressed size (bundle budgets, page compliance,
//! precompressed output files) goes through the [`Compressor`] trait. The
//! production [`StandardCompressor`] wraps `flate2` for gzip and the `brotli`
//! crate for brotli. Both are deterministic for a given algorithm, level and
//! input: the gzip header is written with a zero mtime and no file name.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Write};
use thiserror::Error;

/// Brotli window size (log2). 22 is the encoder default.
const BROTLI_LGWIN: u32 = 22;
const BROTLI_BUFFER: usize = 4096;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("invalid {algorithm} level {level} (expected 0-{max})")]
    InvalidLevel {
        algorithm: Algorithm,
        level: u32,
        max: u32,
    },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Gzip,
    Brotli,
}

impl Algorithm {
    pub fn max_level(self) -> u32 {
        match self {
            Algorithm::Gzip => 9,
            Algorithm::Brotli => 11,
        }
    }

    /// File extension of a precompressed sibling (`app.css.br`).
    pub fn extension(self) -> &'static str {
        match self {
            Algorithm::Gzip => "gz",
            Algorithm::Brotli => "br",
        }
    }

    /// `Content-Encoding` token.
    pub fn encoding(self) -> &'static str {
        match self {
            Algorithm::Gzip => "gzip",
            Algorithm::Brotli => "br",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Gzip => f.write_str("gzip"),
            Algorithm::Brotli => f.write_str("brotli"),
        }
    }
}

/// Produces compressed encodings of a byte buffer.
///
/// Implementations must be pure: same input, algorithm and level give the
/// same output, and empty input is not an error.
pub trait Compressor: Send + Sync {
    fn compress(
        &self,
        data: &[u8],
        algorithm: Algorithm,
        level: u32,
    ) -> Result<Vec<u8>, CompressionError>;

    /// Compressed length without keeping the bytes around.
    fn compressed_len(
        &self,
        data: &[u8],
        algorithm: Algorithm,
        level: u32,
    ) -> Result<usize, CompressionError> {
        self.compress(data, algorithm, level).map(|out| out.len())
    }
}

/// gzip via `flate2`, brotli via `brotli`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardCompressor;

impl Compressor for StandardCompressor {
    fn compress(
        &self,
        data: &[u8],
        algorithm: Algorithm,
        level: u32,
    ) -> Result<Vec<u8>, CompressionError> {
        check_level(algorithm, level)?;
        match algorithm {
            Algorithm::Gzip => gzip(data, level),
            Algorithm::Brotli => brotli_encode(data, level),
        }
    }
}

/// Reject levels outside the algorithm's range.
pub fn check_level(algorithm: Algorithm, level: u32) -> Result<(), CompressionError> {
    let max = algorithm.max_level();
    if level > max {
        return Err(CompressionError::InvalidLevel {
            algorithm,
            level,
            max,
        });
    }
    Ok(())
}

fn gzip(data: &[u8], level: u32) -> Result<Vec<u8>, CompressionError> {
    let mut encoder = flate2::GzBuilder::new()
        .mtime(0)
        .write(Vec::with_capacity(data.len() / 2 + 32), flate2::Compression::new(level));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn brotli_encode(data: &[u8], level: u32) -> Result<Vec<u8>, CompressionError> {
    let out = Vec::with_capacity(data.len() / 2 + 16);
    let mut writer = brotli::CompressorWriter::new(out, BROTLI_BUFFER, level, BROTLI_LGWIN);
    writer.write_all(data)?;
    // into_inner finishes the stream
    Ok(writer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn sample() -> Vec<u8> {
        "body{margin:0;font-family:system-ui}.hero{display:grid}"
            .repeat(50)
            .into_bytes()
    }

    #[test]
    fn gzip_roundtrips_through_decoder() {
        let data = sample();
        let compressed = StandardCompressor.compress(&data, Algorithm::Gzip, 6).unwrap();
        let mut decoded = Vec::new();
        GzDecoder::new(&compressed[..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, data);
        assert!(compressed.len() < data.len());
    }

    #[test]
    fn brotli_roundtrips_through_decoder() {
        let data = sample();
        let compressed = StandardCompressor
            .compress(&data, Algorithm::Brotli, 11)
            .unwrap();
        let mut decoded = Vec::new();
        brotli::Decompressor::new(&compressed[..], 4096)
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn deterministic_per_algorithm_and_level() {
        let data = sample();
        for (algorithm, level) in [(Algorithm::Gzip, 9), (Algorithm::Brotli, 5)] {
            let a = StandardCompressor.compress(&data, algorithm, level).unwrap();
            let b = StandardCompressor.compress(&data, algorithm, level).unwrap();
            assert_eq!(a, b, "{algorithm} level {level}");
        }
    }

    #[test]
    fn empty_input_is_not_an_error() {
        let gz = StandardCompressor.compress(&[], Algorithm::Gzip, 6).unwrap();
        assert!(!gz.is_empty(), "gzip still writes header and trailer");
        let br = StandardCompressor.compress(&[], Algorithm::Brotli, 6).unwrap();
        assert!(!br.is_empty());
    }

    #[test]
    fn invalid_level_rejected() {
        let err = StandardCompressor
            .compress(b"x", Algorithm::Gzip, 10)
            .unwrap_err();
        assert!(matches!(
            err,
            CompressionError::InvalidLevel {
                algorithm: Algorithm::Gzip,
                level: 10,
                max: 9
            }
        ));
        assert!(StandardCompressor.compress(b"x", Algorithm::Brotli, 12).is_err());
    }

    #[test]
    fn compressed_len_matches_compress() {
        let data = sample();
        let len = StandardCompressor
            .compressed_len(&data, Algorithm::Gzip, 6)
            .unwrap();
        let bytes = StandardCompressor.compress(&data, Algorithm::Gzip, 6).unwrap();
        assert_eq!(len, bytes.len());
    }

    #[test]
    fn algorithm_parses_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            algorithm: Algorithm,
        }
        let w: Wrapper = toml::from_str("algorithm = \"gzip\"").unwrap();
        assert_eq!(w.algorithm, Algorithm::Gzip);
        assert_eq!(Algorithm::Brotli.extension(), "br");
        assert_eq!(Algorithm::Gzip.encoding(), "gzip");
    }
}
