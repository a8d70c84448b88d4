//! Append-only, crash-durable block journal.
//!
//! Every block passes through a [`TransformChain`] (optional compression,
//! metadata header, sector padding) and is appended to the active segment
//! file. Segments roll over once they reach the configured length. A journal
//! has exactly one writer; `&mut self` on the write path enforces that.

pub mod compression;
pub mod geometry;
pub mod offset;
pub mod reader;
pub mod transform;

pub use compression::{BlockCompressor, ZlibCompressor};
pub use geometry::{CachedGeometry, FixedGeometry, StorageGeometry};
pub use offset::JournalPosition;
pub use reader::{JournalReader, JournalRecord};
pub use transform::{BlockMetadata, TransformChain};

use keel_common::error::{KeelError, Result};
use keel_common::types::{IoMode, JournalConfig};
use offset::{list_segments, OffsetManager};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const WRITE_BUFFER: usize = 64 * 1024;

enum SegmentWriter {
    Buffered(BufWriter<File>),
    Direct(File),
}

impl SegmentWriter {
    fn open(path: &Path, io_mode: IoMode) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(match io_mode {
            IoMode::Buffered => {
                SegmentWriter::Buffered(BufWriter::with_capacity(WRITE_BUFFER, file))
            }
            IoMode::Unbuffered => SegmentWriter::Direct(file),
        })
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            SegmentWriter::Buffered(w) => w.write_all(bytes),
            SegmentWriter::Direct(f) => f.write_all(bytes),
        }
    }

    /// Hands buffered bytes to the OS; `sync` also forces them to the device.
    fn flush(&mut self, sync: bool) -> io::Result<()> {
        match self {
            SegmentWriter::Buffered(w) => {
                w.flush()?;
                if sync {
                    w.get_ref().sync_data()?;
                }
                Ok(())
            }
            SegmentWriter::Direct(f) => f.sync_data(),
        }
    }
}

pub struct Journal {
    config: JournalConfig,
    chain: Arc<TransformChain>,
    offsets: OffsetManager,
    writer: SegmentWriter,
    poisoned: bool,
}

impl Journal {
    /// Opens the journal, using zlib when `config.compression` is set.
    pub fn open(config: JournalConfig, geometry: &dyn StorageGeometry) -> Result<Self> {
        let compressor: Option<Arc<dyn BlockCompressor>> = if config.compression {
            Some(Arc::new(ZlibCompressor::default()))
        } else {
            None
        };
        Self::open_with_compressor(config, geometry, compressor)
    }

    pub fn open_with_compressor(
        config: JournalConfig,
        geometry: &dyn StorageGeometry,
        compressor: Option<Arc<dyn BlockCompressor>>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.directory)?;

        let sector_size = match config.io_mode {
            IoMode::Buffered => None,
            IoMode::Unbuffered => Some(geometry.sector_size_of(&config.directory)?),
        };
        let chain = Arc::new(TransformChain::new(compressor, sector_size));
        let offsets = Self::recover_offsets(&config, &chain)?;

        let writer = SegmentWriter::open(&offsets.segment_path(), config.io_mode)?;
        info!(
            directory = %config.directory.display(),
            segment = offsets.segment(),
            offset = offsets.offset(),
            transforms = ?chain.names(),
            "journal opened"
        );

        Ok(Self {
            config,
            chain,
            offsets,
            writer,
            poisoned: false,
        })
    }

    /// Finds where the next write goes, cutting off any torn tail left by a crash.
    fn recover_offsets(
        config: &JournalConfig,
        chain: &Arc<TransformChain>,
    ) -> Result<OffsetManager> {
        let segments = list_segments(&config.directory, &config.file_prefix)?;
        let Some((segment, path)) = segments.last() else {
            return Ok(OffsetManager::new(
                &config.directory,
                &config.file_prefix,
                config.max_segment_len,
                0,
                0,
                0,
            ));
        };

        let reader = JournalReader::new(&config.directory, &config.file_prefix, chain.clone());
        let scan = reader.scan_segment(*segment, path)?;
        let file_len = std::fs::metadata(path)?.len();
        if file_len > scan.valid_len {
            warn!(
                segment = *segment,
                valid_len = scan.valid_len,
                file_len,
                "truncating torn journal tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
        }

        let mut offsets = OffsetManager::new(
            &config.directory,
            &config.file_prefix,
            config.max_segment_len,
            *segment,
            scan.valid_len,
            scan.records.len() as u64,
        );
        if scan.valid_len % chain.alignment() as u64 != 0 {
            // written under a different I/O mode; start aligned
            offsets.roll();
        }
        Ok(offsets)
    }

    pub fn write_block(&mut self, block: &[u8]) -> Result<JournalPosition> {
        let mut positions = self.write_blocks(&[block])?;
        positions
            .pop()
            .ok_or_else(|| KeelError::Durability("journal accepted no block".into()))
    }

    /// Appends `blocks` in order and returns once the configured durability
    /// level holds for all of them.
    pub fn write_blocks<B: AsRef<[u8]>>(&mut self, blocks: &[B]) -> Result<Vec<JournalPosition>> {
        if self.poisoned {
            return Err(KeelError::Durability(
                "journal is unusable after a failed write".into(),
            ));
        }
        if blocks.is_empty() {
            return Ok(Vec::new());
        }

        let frames = blocks
            .iter()
            .map(|block| self.chain.encode(block.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let mut positions = Vec::with_capacity(frames.len());
        for frame in frames {
            let len = frame.len() as u64;
            if self.offsets.needs_roll(len) {
                self.roll_segment()?;
            }
            if let Err(e) = self.writer.write_all(&frame) {
                return Err(self.poison(e));
            }
            let position = self.offsets.commit(len);
            debug!(
                segment = position.segment,
                offset = position.offset,
                len,
                "journal block written"
            );
            positions.push(position);
        }

        let sync = self.must_sync();
        if let Err(e) = self.writer.flush(sync) {
            return Err(self.poison(e));
        }
        Ok(positions)
    }

    /// Forces everything written so far to the device.
    pub fn sync(&mut self) -> Result<()> {
        match self.writer.flush(true) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.poison(e)),
        }
    }

    pub fn reader(&self) -> JournalReader {
        JournalReader::new(&self.config.directory, &self.config.file_prefix, self.chain.clone())
    }

    pub fn position(&self) -> JournalPosition {
        self.offsets.next_position()
    }

    pub fn io_mode(&self) -> IoMode {
        self.config.io_mode
    }

    /// Sector size frames are padded to, if any.
    pub fn alignment(&self) -> usize {
        self.chain.alignment()
    }

    fn must_sync(&self) -> bool {
        match self.config.io_mode {
            IoMode::Buffered => self.config.sync_on_write,
            IoMode::Unbuffered => true,
        }
    }

    fn roll_segment(&mut self) -> Result<()> {
        if let Err(e) = self.writer.flush(true) {
            return Err(self.poison(e));
        }
        let segment = self.offsets.roll();
        match SegmentWriter::open(&self.offsets.segment_path(), self.config.io_mode) {
            Ok(writer) => self.writer = writer,
            Err(e) => return Err(self.poison(e)),
        }
        info!(segment, "rolled to new journal segment");
        Ok(())
    }

    fn poison(&mut self, err: io::Error) -> KeelError {
        self.poisoned = true;
        error!(segment = self.offsets.segment(), error = %err, "journal write failed");
        KeelError::Durability(err.to_string())
    }
}
