//! Encode/pad transforms applied to every journal block before it is written,
//! and reversed when the block is read back.

use super::compression::BlockCompressor;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use keel_common::error::{KeelError, Result};
use std::sync::Arc;

pub const BLOCK_MAGIC: u32 = 0x4B45_4C31; // "KEL1"

/// magic (4) | payload length (4) | stored length (4) | crc32 (4) | written_at micros (8)
pub const HEADER_LEN: usize = 4 + 4 + 4 + 4 + 8;

/// Where the stored length sits inside the header.
const STORED_LEN_OFFSET: usize = 8;

/// Per-block metadata stored in front of every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMetadata {
    /// Length of the payload as it sits on disk, without padding.
    pub payload_len: u32,
    /// Bytes the whole frame occupies on disk, padding included.
    pub stored_len: u32,
    pub checksum: u32,
    pub written_at_micros: i64,
}

impl BlockMetadata {
    /// Parses a header. `None` means there is no block here (zeroed or torn tail).
    pub fn parse(header: &[u8]) -> Option<Self> {
        if header.len() < HEADER_LEN {
            return None;
        }
        let mut buf = header;
        if buf.get_u32_le() != BLOCK_MAGIC {
            return None;
        }
        Some(Self {
            payload_len: buf.get_u32_le(),
            stored_len: buf.get_u32_le(),
            checksum: buf.get_u32_le(),
            written_at_micros: buf.get_i64_le(),
        })
    }

    /// Header plus payload, before any padding.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_len as usize
    }
}

fn frame_u32(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| KeelError::Validation(format!("block of {} bytes too large", len)))
}

/// Rounds `len` up to the next multiple of `alignment`.
pub fn align_up(len: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return len;
    }
    len.div_ceil(alignment) * alignment
}

/// One reversible step of the journal's block encoding.
pub trait BlockTransform: Send + Sync {
    fn name(&self) -> &'static str;

    fn encode(&self, block: BytesMut) -> Result<BytesMut>;

    fn decode(&self, block: Bytes) -> Result<Bytes>;
}

/// Compresses payloads; passes through anything the compressor does not recognise.
pub struct CompressionTransform {
    compressor: Arc<dyn BlockCompressor>,
}

impl CompressionTransform {
    pub fn new(compressor: Arc<dyn BlockCompressor>) -> Self {
        Self { compressor }
    }
}

impl BlockTransform for CompressionTransform {
    fn name(&self) -> &'static str {
        "compression"
    }

    fn encode(&self, block: BytesMut) -> Result<BytesMut> {
        let compressed = self.compressor.compress(&block)?;
        Ok(BytesMut::from(&compressed[..]))
    }

    fn decode(&self, block: Bytes) -> Result<Bytes> {
        if self.compressor.is_compressed(&block) {
            Ok(Bytes::from(self.compressor.decompress(&block)?))
        } else {
            Ok(block)
        }
    }
}

/// Prepends [`BlockMetadata`]; on decode verifies the checksum and drops
/// everything past the payload, which strips any padding.
#[derive(Debug, Default)]
pub struct MetadataTransform;

impl BlockTransform for MetadataTransform {
    fn name(&self) -> &'static str {
        "metadata"
    }

    fn encode(&self, block: BytesMut) -> Result<BytesMut> {
        let payload_len = frame_u32(block.len())?;
        let stored_len = frame_u32(HEADER_LEN + block.len())?;

        let mut framed = BytesMut::with_capacity(HEADER_LEN + block.len());
        framed.put_u32_le(BLOCK_MAGIC);
        framed.put_u32_le(payload_len);
        framed.put_u32_le(stored_len);
        framed.put_u32_le(crc32fast::hash(&block));
        framed.put_i64_le(chrono::Utc::now().timestamp_micros());
        framed.extend_from_slice(&block);
        Ok(framed)
    }

    fn decode(&self, block: Bytes) -> Result<Bytes> {
        let meta = BlockMetadata::parse(&block)
            .ok_or_else(|| KeelError::InvalidBlock("block header missing".into()))?;
        if block.len() < meta.frame_len() {
            return Err(KeelError::InvalidBlock(format!(
                "block truncated: {} of {} bytes",
                block.len(),
                meta.frame_len()
            )));
        }

        let payload = block.slice(HEADER_LEN..meta.frame_len());
        let checksum = crc32fast::hash(&payload);
        if checksum != meta.checksum {
            return Err(KeelError::InvalidBlock(format!(
                "checksum mismatch: stored {:#010x}, computed {:#010x}",
                meta.checksum, checksum
            )));
        }
        Ok(payload)
    }
}

/// Zero-pads frames to a multiple of the sector size.
#[derive(Debug)]
pub struct PaddingTransform {
    sector_size: usize,
}

impl PaddingTransform {
    pub fn new(sector_size: usize) -> Self {
        Self { sector_size }
    }
}

impl BlockTransform for PaddingTransform {
    fn name(&self) -> &'static str {
        "padding"
    }

    fn encode(&self, mut block: BytesMut) -> Result<BytesMut> {
        let padded = align_up(block.len(), self.sector_size);
        if block.len() >= HEADER_LEN {
            let stored_len = frame_u32(padded)?.to_le_bytes();
            block[STORED_LEN_OFFSET..STORED_LEN_OFFSET + 4].copy_from_slice(&stored_len);
        }
        block.resize(padded, 0);
        Ok(block)
    }

    fn decode(&self, block: Bytes) -> Result<Bytes> {
        // Metadata decode knows the true length and trims.
        Ok(block)
    }
}

/// Ordered list of transforms. Encoding runs front to back, decoding back to front.
pub struct TransformChain {
    transforms: Vec<Box<dyn BlockTransform>>,
    alignment: usize,
}

impl TransformChain {
    /// Builds the chain: optional compression, metadata, then padding when
    /// `sector_size` is given.
    pub fn new(compressor: Option<Arc<dyn BlockCompressor>>, sector_size: Option<usize>) -> Self {
        let mut transforms: Vec<Box<dyn BlockTransform>> = Vec::with_capacity(3);
        if let Some(compressor) = compressor {
            transforms.push(Box::new(CompressionTransform::new(compressor)));
        }
        transforms.push(Box::new(MetadataTransform));
        if let Some(sector_size) = sector_size {
            transforms.push(Box::new(PaddingTransform::new(sector_size)));
        }
        Self {
            transforms,
            alignment: sector_size.unwrap_or(1),
        }
    }

    /// Alignment every encoded frame satisfies (1 when unpadded).
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.transforms.iter().map(|t| t.name()).collect()
    }

    pub fn encode(&self, block: &[u8]) -> Result<Bytes> {
        let mut buf = BytesMut::from(block);
        for transform in &self.transforms {
            buf = transform.encode(buf)?;
        }
        Ok(buf.freeze())
    }

    pub fn decode(&self, frame: Bytes) -> Result<Bytes> {
        let mut buf = frame;
        for transform in self.transforms.iter().rev() {
            buf = transform.decode(buf)?;
        }
        Ok(buf)
    }
}
