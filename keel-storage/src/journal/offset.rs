use keel_common::error::{KeelError, Result};
use std::path::{Path, PathBuf};

/// Where a block landed in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct JournalPosition {
    pub segment: u64,
    /// Byte offset of the frame inside its segment.
    pub offset: u64,
    /// Ordinal of the block inside its segment.
    pub entry: u64,
}

/// Sole owner of the journal's write offset and active segment.
#[derive(Debug)]
pub struct OffsetManager {
    directory: PathBuf,
    file_prefix: String,
    max_segment_len: u64,
    segment: u64,
    offset: u64,
    entries: u64,
}

impl OffsetManager {
    pub fn new(
        directory: impl Into<PathBuf>,
        file_prefix: impl Into<String>,
        max_segment_len: u64,
        segment: u64,
        offset: u64,
        entries: u64,
    ) -> Self {
        Self {
            directory: directory.into(),
            file_prefix: file_prefix.into(),
            max_segment_len,
            segment,
            offset,
            entries,
        }
    }

    pub fn segment(&self) -> u64 {
        self.segment
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn segment_path(&self) -> PathBuf {
        segment_path(&self.directory, &self.file_prefix, self.segment)
    }

    /// A frame of `len` bytes would overflow the active segment. An empty
    /// segment always accepts a frame, however large.
    pub fn needs_roll(&self, len: u64) -> bool {
        self.offset > 0 && self.offset + len > self.max_segment_len
    }

    /// Moves to the next segment, returning its index.
    pub fn roll(&mut self) -> u64 {
        self.segment += 1;
        self.offset = 0;
        self.entries = 0;
        self.segment
    }

    /// Position the next frame will occupy.
    pub fn next_position(&self) -> JournalPosition {
        JournalPosition {
            segment: self.segment,
            offset: self.offset,
            entry: self.entries,
        }
    }

    /// Records a completed write of `len` bytes. Call only after the bytes
    /// are in the file.
    pub fn commit(&mut self, len: u64) -> JournalPosition {
        let position = self.next_position();
        self.offset += len;
        self.entries += 1;
        position
    }
}

pub fn segment_path(directory: &Path, file_prefix: &str, segment: u64) -> PathBuf {
    directory.join(format!("{}-{:016x}.wal", file_prefix, segment))
}

/// Parses a segment index out of a file name written by [`segment_path`].
pub fn parse_segment_name(file_prefix: &str, name: &str) -> Option<u64> {
    let index = name
        .strip_prefix(file_prefix)?
        .strip_prefix('-')?
        .strip_suffix(".wal")?;
    u64::from_str_radix(index, 16).ok()
}

/// All segments in `directory`, ordered by index.
pub fn list_segments(directory: &Path, file_prefix: &str) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(segments),
        Err(e) => return Err(KeelError::Io(e)),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(index) = parse_segment_name(file_prefix, &name.to_string_lossy()) {
            segments.push((index, entry.path()));
        }
    }
    segments.sort_by_key(|(index, _)| *index);
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_name_round_trip() {
        let path = segment_path(Path::new("/data"), "journal", 42);
        let name = path.file_name().unwrap().to_string_lossy().to_string();

        assert_eq!(name, "journal-000000000000002a.wal");
        assert_eq!(parse_segment_name("journal", &name), Some(42));
        assert_eq!(parse_segment_name("other", &name), None);
        assert_eq!(parse_segment_name("journal", "journal-zz.wal"), None);
    }

    #[test]
    fn test_rolls_only_when_segment_is_full() {
        let mut offsets = OffsetManager::new("/data", "journal", 100, 0, 0, 0);

        // an empty segment takes any frame
        assert!(!offsets.needs_roll(500));
        let first = offsets.commit(60);
        assert_eq!(first, JournalPosition { segment: 0, offset: 0, entry: 0 });

        assert!(!offsets.needs_roll(40));
        assert!(offsets.needs_roll(41));

        assert_eq!(offsets.roll(), 1);
        let next = offsets.commit(10);
        assert_eq!(next, JournalPosition { segment: 1, offset: 0, entry: 0 });
        assert_eq!(offsets.offset(), 10);
    }

    #[test]
    fn test_list_segments_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for index in [3u64, 1, 2] {
            std::fs::write(segment_path(dir.path(), "journal", index), b"").unwrap();
        }
        std::fs::write(dir.path().join("unrelated.txt"), b"").unwrap();

        let indexes: Vec<u64> = list_segments(dir.path(), "journal")
            .unwrap()
            .into_iter()
            .map(|(i, _)| i)
            .collect();
        assert_eq!(indexes, vec![1, 2, 3]);
    }
}
