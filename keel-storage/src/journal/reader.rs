//! Sequential journal scan used for recovery replay and follower catch-up.

use super::offset::list_segments;
use super::transform::{BlockMetadata, TransformChain, HEADER_LEN};
use bytes::{Bytes, BytesMut};
use keel_common::error::{KeelError, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// A block read back from the journal with every transform reversed.
#[derive(Debug, Clone)]
pub struct JournalRecord {
    pub segment: u64,
    /// Ordinal of the block inside its segment.
    pub entry: u64,
    pub offset: u64,
    pub metadata: BlockMetadata,
    pub payload: Bytes,
}

#[derive(Debug, Default)]
pub(crate) struct SegmentScan {
    pub records: Vec<JournalRecord>,
    /// Bytes of well-formed frames from the start of the segment.
    pub valid_len: u64,
}

pub struct JournalReader {
    directory: PathBuf,
    file_prefix: String,
    chain: Arc<TransformChain>,
}

impl JournalReader {
    pub(crate) fn new(
        directory: impl Into<PathBuf>,
        file_prefix: impl Into<String>,
        chain: Arc<TransformChain>,
    ) -> Self {
        Self {
            directory: directory.into(),
            file_prefix: file_prefix.into(),
            chain,
        }
    }

    /// Every record in every segment, in write order.
    pub fn read_all(&self) -> Result<Vec<JournalRecord>> {
        self.read_from(0)
    }

    /// Records from `first_segment` onwards.
    pub fn read_from(&self, first_segment: u64) -> Result<Vec<JournalRecord>> {
        let mut records = Vec::new();
        for (segment, path) in list_segments(&self.directory, &self.file_prefix)? {
            if segment < first_segment {
                continue;
            }
            records.extend(self.scan_segment(segment, &path)?.records);
        }
        Ok(records)
    }

    pub(crate) fn scan_segment(&self, segment: u64, path: &Path) -> Result<SegmentScan> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut scan = SegmentScan::default();
        let mut entry = 0u64;

        loop {
            let offset = scan.valid_len;
            let mut header = [0u8; HEADER_LEN];
            let read = read_full(&mut reader, &mut header)?;
            if read == 0 {
                break;
            }
            if read < HEADER_LEN {
                warn!(segment, offset, "torn block header at end of segment");
                break;
            }
            let Some(metadata) = BlockMetadata::parse(&header) else {
                warn!(segment, offset, "no block header, treating as end of segment");
                break;
            };

            // frames describe their own padding, so segments written under
            // either I/O mode scan the same way
            let stored_len = metadata.stored_len as usize;
            if stored_len < metadata.frame_len() {
                return Err(KeelError::Corruption {
                    segment,
                    offset,
                    cause: format!(
                        "stored length {} below frame length {}",
                        stored_len,
                        metadata.frame_len()
                    ),
                });
            }
            let mut frame = BytesMut::zeroed(stored_len);
            frame[..HEADER_LEN].copy_from_slice(&header);
            if read_full(&mut reader, &mut frame[HEADER_LEN..])? < stored_len - HEADER_LEN {
                warn!(segment, offset, "torn block payload at end of segment");
                break;
            }

            let payload = match self.chain.decode(frame.freeze()) {
                Ok(payload) => payload,
                Err(e) if reader.fill_buf()?.is_empty() => {
                    warn!(segment, offset, error = %e, "dropping damaged final block");
                    break;
                }
                Err(e) => {
                    return Err(KeelError::Corruption {
                        segment,
                        offset,
                        cause: e.to_string(),
                    })
                }
            };

            scan.records.push(JournalRecord {
                segment,
                entry,
                offset,
                metadata,
                payload,
            });
            scan.valid_len += stored_len as u64;
            entry += 1;
        }

        Ok(scan)
    }
}

/// Reads until `buf` is full or the stream ends; returns bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(KeelError::Io(e)),
        }
    }
    Ok(filled)
}
