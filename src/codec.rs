//! Block compression codecs.
//!
//! The codec is chosen per table at build time and applied to whole data
//! blocks. A reader configured with a different codec than the writer sees
//! the failure as corruption.

use std::io::{Read, Write};

use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};

use crate::error::{Error, Result};

/// The closed set of block codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Deflate,
}

impl Compression {
    /// Compresses a block. `None` returns the input unchanged.
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
            Compression::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
        }
    }

    /// Decompresses a block. Any decoder failure is surfaced as corruption.
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Gzip => {
                let mut decoder = GzDecoder::new(data);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| Error::InvalidData(format!("gzip block decode: {e}")))?;
                Ok(out)
            }
            Compression::Deflate => {
                let mut decoder = DeflateDecoder::new(data);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| Error::InvalidData(format!("deflate block decode: {e}")))?;
                Ok(out)
            }
        }
    }
}

impl std::str::FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "deflate" => Ok(Compression::Deflate),
            other => crate::errinput!("unknown compression codec: {other}"),
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Gzip => write!(f, "gzip"),
            Compression::Deflate => write!(f, "deflate"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        // Repetitive enough that both codecs actually shrink it.
        b"the quick brown fox jumps over the lazy dog "
            .iter()
            .cycle()
            .take(4096)
            .copied()
            .collect()
    }

    #[test]
    fn test_roundtrip_all_codecs() {
        let data = sample();
        for codec in [Compression::None, Compression::Gzip, Compression::Deflate] {
            let compressed = codec.compress(&data).expect("compress failed");
            let restored = codec.decompress(&compressed).expect("decompress failed");
            assert_eq!(restored, data, "{codec} roundtrip mismatch");
        }
    }

    #[test]
    fn test_compression_shrinks_repetitive_input() {
        let data = sample();
        for codec in [Compression::Gzip, Compression::Deflate] {
            let compressed = codec.compress(&data).expect("compress failed");
            assert!(compressed.len() < data.len(), "{codec} did not shrink");
        }
    }

    #[test]
    fn test_none_is_identity() {
        let data = sample();
        assert_eq!(Compression::None.compress(&data).unwrap(), data);
        assert_eq!(Compression::None.decompress(&data).unwrap(), data);
    }

    #[test]
    fn test_codec_mismatch_is_corruption() {
        let data = sample();
        let gz = Compression::Gzip.compress(&data).unwrap();
        match Compression::Deflate.decompress(&gz) {
            Err(Error::InvalidData(_)) => {}
            other => panic!("expected corruption error, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_block() {
        for codec in [Compression::None, Compression::Gzip, Compression::Deflate] {
            let compressed = codec.compress(&[]).expect("compress failed");
            let restored = codec.decompress(&compressed).expect("decompress failed");
            assert!(restored.is_empty());
        }
    }

    #[test]
    fn test_parse_codec_names() {
        assert_eq!("none".parse::<Compression>().unwrap(), Compression::None);
        assert_eq!("gzip".parse::<Compression>().unwrap(), Compression::Gzip);
        assert_eq!(
            "deflate".parse::<Compression>().unwrap(),
            Compression::Deflate
        );
        assert!("snappy".parse::<Compression>().is_err());
    }
}
