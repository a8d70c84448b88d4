use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use keel_common::error::{KeelError, Result};
use std::io::{Read, Write};

/// Pluggable block compression used by the journal's transform chain.
pub trait BlockCompressor: Send + Sync {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>>;

    /// Fails only when the compressed header itself is malformed.
    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>>;

    /// Whether `bytes` looks like the output of [`BlockCompressor::compress`]. Never fails.
    fn is_compressed(&self, bytes: &[u8]) -> bool;
}

const ZLIB_MAGIC: [u8; 4] = *b"KZL1";
const ZLIB_HEADER_LEN: usize = ZLIB_MAGIC.len() + 4;

/// zlib compressor with a self-describing frame:
/// `magic (4) | original length (u32 LE) | zlib stream`.
#[derive(Debug, Clone)]
pub struct ZlibCompressor {
    level: Compression,
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        Self {
            level: Compression::fast(),
        }
    }
}

impl ZlibCompressor {
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level),
        }
    }
}

impl BlockCompressor for ZlibCompressor {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let original_len = u32::try_from(bytes.len())
            .map_err(|_| {
                KeelError::Validation(format!("block of {} bytes too large", bytes.len()))
            })?;

        let mut out = Vec::with_capacity(ZLIB_HEADER_LEN + bytes.len() / 2);
        out.extend_from_slice(&ZLIB_MAGIC);
        out.extend_from_slice(&original_len.to_le_bytes());

        let mut encoder = ZlibEncoder::new(out, self.level);
        encoder.write_all(bytes)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        if !self.is_compressed(bytes) {
            return Err(KeelError::Decompress("missing zlib frame header".into()));
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[ZLIB_MAGIC.len()..ZLIB_HEADER_LEN]);
        let original_len = u32::from_le_bytes(len_bytes) as usize;

        let mut out = Vec::with_capacity(original_len);
        ZlibDecoder::new(&bytes[ZLIB_HEADER_LEN..])
            .read_to_end(&mut out)
            .map_err(|e| KeelError::Decompress(e.to_string()))?;

        if out.len() != original_len {
            return Err(KeelError::Decompress(format!(
                "expected {} bytes, inflated {}",
                original_len,
                out.len()
            )));
        }
        Ok(out)
    }

    fn is_compressed(&self, bytes: &[u8]) -> bool {
        if bytes.len() < ZLIB_HEADER_LEN + 2 || bytes[..ZLIB_MAGIC.len()] != ZLIB_MAGIC {
            return false;
        }
        // RFC 1950: deflate method and a header checksum divisible by 31.
        let cmf = bytes[ZLIB_HEADER_LEN];
        let flg = bytes[ZLIB_HEADER_LEN + 1];
        cmf & 0x0f == 8 && (u16::from(cmf) * 256 + u16::from(flg)) % 31 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_then_decompress_restores_input() {
        let zlib = ZlibCompressor::default();
        let inputs: Vec<Vec<u8>> = vec![
            vec![],
            vec![0x78],
            b"set key value".to_vec(),
            vec![7u8; 10_000],
            (0..4096u32).map(|i| (i * 31 % 251) as u8).collect(),
        ];

        for input in inputs {
            let compressed = zlib.compress(&input).unwrap();
            assert!(zlib.is_compressed(&compressed));
            assert_eq!(zlib.decompress(&compressed).unwrap(), input);
        }
    }

    #[test]
    fn test_plain_bytes_are_not_compressed() {
        let zlib = ZlibCompressor::default();
        assert!(!zlib.is_compressed(b""));
        assert!(!zlib.is_compressed(b"KZL1"));
        assert!(!zlib.is_compressed(&[0x78, 0x9c, 1, 2, 3, 4, 5, 6, 7, 8]));
    }

    #[test]
    fn test_decompress_rejects_malformed_header() {
        let zlib = ZlibCompressor::default();
        let err = zlib.decompress(b"not compressed at all").unwrap_err();
        assert!(matches!(err, KeelError::Decompress(_)));
    }
}
