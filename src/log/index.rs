//! Flat offset-index file: one little-endian u64 data-file offset per
//! record ordinal, mirrored in memory while the segment is open.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{LogError, LogResult};

#[derive(Debug)]
pub(crate) struct OffsetIndex {
    file: File,
    path: PathBuf,
    offsets: Vec<u64>,
}

impl OffsetIndex {
    pub(crate) fn open(path: &Path) -> LogResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|source| LogError::Io {
                path: Some(path.to_path_buf()),
                source,
            })?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw).map_err(|source| LogError::Io {
            path: Some(path.to_path_buf()),
            source,
        })?;
        if raw.len() % 8 != 0 {
            return Err(LogError::RecordInvalid {
                reason: format!("index file length {} not a multiple of 8", raw.len()),
            });
        }

        let mut offsets = Vec::with_capacity(raw.len() / 8);
        for chunk in raw.chunks_exact(8) {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            offsets.push(u64::from_le_bytes(bytes));
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            offsets,
        })
    }

    pub(crate) fn push(&mut self, offset: u64) -> LogResult<()> {
        self.file
            .write_all(&offset.to_le_bytes())
            .map_err(|source| LogError::Io {
                path: Some(self.path.clone()),
                source,
            })?;
        self.offsets.push(offset);
        Ok(())
    }

    pub(crate) fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    pub(crate) fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Drops entries at and beyond ordinal `len`, shrinking the file to
    /// match.
    pub(crate) fn truncate(&mut self, len: usize) -> LogResult<()> {
        self.file
            .set_len((len * 8) as u64)
            .map_err(|source| LogError::Io {
                path: Some(self.path.clone()),
                source,
            })?;
        self.file
            .seek(SeekFrom::Start((len * 8) as u64))
            .map_err(|source| LogError::Io {
                path: Some(self.path.clone()),
                source,
            })?;
        self.offsets.truncate(len);
        Ok(())
    }

    pub(crate) fn clear(&mut self) -> LogResult<()> {
        self.file.set_len(0).map_err(|source| LogError::Io {
            path: Some(self.path.clone()),
            source,
        })?;
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|source| LogError::Io {
                path: Some(self.path.clone()),
                source,
            })?;
        self.offsets.clear();
        Ok(())
    }

    pub(crate) fn sync(&self) -> LogResult<()> {
        self.file.sync_all().map_err(|source| LogError::Io {
            path: Some(self.path.clone()),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn push_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("seg.index");

        let mut index = OffsetIndex::open(&path).expect("open");
        index.push(0).expect("push");
        index.push(21).expect("push");
        index.push(55).expect("push");
        drop(index);

        let reloaded = OffsetIndex::open(&path).expect("reopen");
        assert_eq!(reloaded.offsets(), &[0, 21, 55]);
    }

    #[test]
    fn clear_truncates_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("seg.index");

        let mut index = OffsetIndex::open(&path).expect("open");
        index.push(13).expect("push");
        index.clear().expect("clear");
        index.push(99).expect("push");
        drop(index);

        let reloaded = OffsetIndex::open(&path).expect("reopen");
        assert_eq!(reloaded.offsets(), &[99]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8);
    }

    #[test]
    fn torn_index_file_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("seg.index");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();

        let err = OffsetIndex::open(&path).unwrap_err();
        assert!(matches!(err, LogError::RecordInvalid { .. }));
    }
}
