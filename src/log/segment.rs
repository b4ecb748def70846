//! Log segment: one data + index file pair over a contiguous index range.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::index::OffsetIndex;
use super::record::{EntryStatus, RecordHeader, RECORD_HEADER_LEN, STATUS_OFFSET};
use super::{LogError, LogResult};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Sync file handles after every mutation.
    pub flush_on_write: bool,
    pub max_entry_bytes: usize,
}

impl SegmentConfig {
    pub fn new(flush_on_write: bool, max_entry_bytes: usize) -> Self {
        Self {
            flush_on_write,
            max_entry_bytes,
        }
    }
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            flush_on_write: false,
            max_entry_bytes: 1024 * 1024,
        }
    }
}

struct SegmentFiles {
    data: File,
    index: OffsetIndex,
    /// Stored index of the record at ordinal 0; `segment` while the file
    /// is empty. Compaction rebases this.
    tail_base: u64,
    /// Byte offset where the next record is written.
    write_pos: u64,
}

/// One on-disk segment of a segmented log.
///
/// Covers indices `[first_index, last_index]` with `first_index >=
/// segment` (the base index). Appends are strictly sequential; suffix
/// truncation tombstones records in place; prefix compaction rewrites the
/// files behind a crash-safe swap with a history copy as the recovery
/// point.
pub struct LogSegment {
    segment: u64,
    config: SegmentConfig,
    data_path: PathBuf,
    index_path: PathBuf,
    tmp_data_path: PathBuf,
    tmp_index_path: PathBuf,
    history_data_path: PathBuf,
    history_index_path: PathBuf,
    files: Option<SegmentFiles>,
    first_index: Option<u64>,
    last_index: Option<u64>,
    size: u64,
}

impl LogSegment {
    /// Creates a closed handle for segment number `segment` of the parent
    /// log rooted at `base` (files land at `base-N.log` / `base-N.index`).
    /// No I/O happens until [`open`](Self::open).
    pub fn new(base: impl Into<PathBuf>, segment: u64, config: SegmentConfig) -> Self {
        let base = base.into();
        Self {
            segment,
            config,
            data_path: sibling(&base, segment, ".log"),
            index_path: sibling(&base, segment, ".index"),
            tmp_data_path: sibling(&base, segment, ".tmp.log"),
            tmp_index_path: sibling(&base, segment, ".tmp.index"),
            history_data_path: sibling(&base, segment, ".history.log"),
            history_index_path: sibling(&base, segment, ".history.index"),
            files: None,
            first_index: None,
            last_index: None,
            size: 0,
        }
    }

    /// Opens or creates the underlying files, recovering indices from the
    /// records already on disk. Restores from an interrupted compaction
    /// first.
    pub fn open(&mut self) -> LogResult<()> {
        if self.files.is_some() {
            return Err(LogError::AlreadyOpen);
        }
        self.recover()?;

        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.data_path)
            .map_err(|source| io_error(&self.data_path, source))?;
        let index = OffsetIndex::open(&self.index_path)?;
        let mut files = SegmentFiles {
            data,
            index,
            tail_base: self.segment,
            write_pos: 0,
        };
        self.scan_existing(&mut files)?;
        self.files = Some(files);
        Ok(())
    }

    /// Appends an entry, returning its index.
    pub fn append(&mut self, entry: &[u8]) -> LogResult<u64> {
        if self.files.is_none() {
            return Err(LogError::NotOpen);
        }
        if entry.len() > self.config.max_entry_bytes {
            return Err(LogError::EntryTooLarge {
                max_bytes: self.config.max_entry_bytes,
                got_bytes: entry.len(),
            });
        }
        let length = u32::try_from(entry.len()).map_err(|_| LogError::EntryTooLarge {
            max_bytes: u32::MAX as usize,
            got_bytes: entry.len(),
        })?;
        let index = match self.last_index {
            Some(last) => last + 1,
            None => self.segment,
        };

        let files = self.files.as_mut().ok_or(LogError::NotOpen)?;
        let offset = files.write_pos;
        let header = RecordHeader {
            index,
            status: EntryStatus::Active,
            length,
        };
        files
            .data
            .seek(SeekFrom::Start(offset))
            .map_err(|source| io_error(&self.data_path, source))?;
        files
            .data
            .write_all(&header.encode())
            .map_err(|source| io_error(&self.data_path, source))?;
        files
            .data
            .write_all(entry)
            .map_err(|source| io_error(&self.data_path, source))?;
        files.index.push(offset)?;
        files.write_pos = offset + RECORD_HEADER_LEN as u64 + u64::from(length);

        self.last_index = Some(index);
        if self.first_index.is_none() {
            self.first_index = Some(index);
        }
        self.size += u64::from(length) + RECORD_HEADER_LEN as u64;
        tracing::trace!(index, len = entry.len(), "appended entry");
        self.flush(false)?;
        Ok(index)
    }

    /// Sequential appends; atomic per entry only.
    pub fn append_batch<T: AsRef<[u8]>>(&mut self, entries: &[T]) -> LogResult<Vec<u64>> {
        let mut indices = Vec::with_capacity(entries.len());
        for entry in entries {
            indices.push(self.append(entry.as_ref())?);
        }
        Ok(indices)
    }

    /// Reads the entry at `index`, skipping tombstones. Returns `None`
    /// when the index is outside the segment's live range or only
    /// tombstones remain for it.
    pub fn get(&mut self, index: u64) -> LogResult<Option<Bytes>> {
        let files = self.files.as_mut().ok_or(LogError::NotOpen)?;
        let (first, last) = match (self.first_index, self.last_index) {
            (Some(first), Some(last)) => (first, last),
            _ => return Ok(None),
        };
        if index < first || index > last {
            return Ok(None);
        }

        let start = index.saturating_sub(files.tail_base) as usize;
        for &offset in files.index.offsets().iter().skip(start) {
            let header = read_header_at(&mut files.data, &self.data_path, offset)?;
            if header.status == EntryStatus::Deleted {
                continue;
            }
            if header.index == index {
                return read_payload(&mut files.data, &self.data_path, header.length).map(Some);
            }
            if header.index > index {
                return Err(LogError::MissingEntries {
                    sought: index,
                    found: header.index,
                });
            }
        }
        Ok(None)
    }

    /// Collects the entries in `[from, to]` in index order, skipping
    /// tombstone holes.
    pub fn get_range(&mut self, from: u64, to: u64) -> LogResult<Vec<Bytes>> {
        let files = self.files.as_mut().ok_or(LogError::NotOpen)?;
        let (first, last) = match (self.first_index, self.last_index) {
            (Some(first), Some(last)) => (first, last),
            _ => return Ok(Vec::new()),
        };
        let from = from.max(first);
        let to = to.min(last);
        if from > to {
            return Ok(Vec::new());
        }

        let start = from.saturating_sub(files.tail_base) as usize;
        let mut entries = Vec::new();
        let mut next = from;
        for &offset in files.index.offsets().iter().skip(start) {
            if next > to {
                break;
            }
            let header = read_header_at(&mut files.data, &self.data_path, offset)?;
            if header.status == EntryStatus::Deleted || header.index < next {
                continue;
            }
            if header.index > next {
                return Err(LogError::MissingEntries {
                    sought: next,
                    found: header.index,
                });
            }
            entries.push(read_payload(&mut files.data, &self.data_path, header.length)?);
            next += 1;
        }
        Ok(entries)
    }

    /// Tombstones every record with stored index greater than `index` and
    /// pulls `last_index` back to it. Bytes stay in place. An `index`
    /// below the segment base clears the files outright.
    pub fn remove_after(&mut self, index: u64) -> LogResult<()> {
        let files = self.files.as_mut().ok_or(LogError::NotOpen)?;
        if index < self.segment {
            files
                .data
                .set_len(0)
                .map_err(|source| io_error(&self.data_path, source))?;
            files.index.clear()?;
            files.tail_base = self.segment;
            files.write_pos = 0;
            self.first_index = None;
            self.last_index = None;
            self.size = 0;
            return self.flush(false);
        }

        let start = (index + 1).saturating_sub(files.tail_base) as usize;
        let mut removed = 0u64;
        for &offset in files.index.offsets().iter().skip(start) {
            let header = read_header_at(&mut files.data, &self.data_path, offset)?;
            if header.index > index && header.status == EntryStatus::Active {
                stamp_status(&mut files.data, &self.data_path, offset, EntryStatus::Deleted)?;
                removed += u64::from(header.length) + RECORD_HEADER_LEN as u64;
            }
        }
        self.size -= removed;

        match (self.first_index, self.last_index) {
            (Some(first), Some(last)) if index >= first => {
                self.last_index = Some(index.min(last));
            }
            (Some(_), _) => {
                // Everything tombstoned; the segment reads as empty.
                self.first_index = None;
                self.last_index = None;
            }
            _ => {}
        }
        self.flush(false)
    }

    /// Compacts the prefix before `index`, optionally replacing the entry
    /// at `index` (typically with a snapshot).
    ///
    /// Survives a crash at any point: the temp files are complete and
    /// synced before the live files are touched, and a history copy of
    /// the live files exists until the swap has fully succeeded. On the
    /// next [`open`](Self::open) an interrupted swap is rolled back from
    /// the history copy.
    pub fn compact(&mut self, index: u64, replacement: Option<&[u8]>) -> LogResult<()> {
        if self.files.is_none() {
            return Err(LogError::NotOpen);
        }
        let (first, last) = match (self.first_index, self.last_index) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                return Err(LogError::IndexOutOfRange {
                    index,
                    first: None,
                    last: None,
                })
            }
        };
        if index < first || index > last {
            return Err(LogError::IndexOutOfRange {
                index,
                first: Some(first),
                last: Some(last),
            });
        }
        if index == first && replacement.is_none() {
            return Ok(());
        }
        if let Some(entry) = replacement {
            if entry.len() > self.config.max_entry_bytes {
                return Err(LogError::EntryTooLarge {
                    max_bytes: self.config.max_entry_bytes,
                    got_bytes: entry.len(),
                });
            }
        }
        tracing::debug!(segment = self.segment, index, "compacting segment");

        remove_if_exists(&self.tmp_data_path)?;
        remove_if_exists(&self.tmp_index_path)?;

        let mut tmp_data = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.tmp_data_path)
            .map_err(|source| io_error(&self.tmp_data_path, source))?;
        let mut tmp_offsets: Vec<u64> = Vec::new();
        let mut pos = 0u64;
        let mut new_size = 0u64;

        {
            let files = self.files.as_mut().ok_or(LogError::NotOpen)?;

            // The record at `index` survives: either the caller's
            // replacement or the original entry.
            let keep_from = if let Some(entry) = replacement {
                write_compacted(
                    &mut tmp_data,
                    &self.tmp_data_path,
                    &mut tmp_offsets,
                    &mut pos,
                    &mut new_size,
                    index,
                    entry,
                )?;
                index + 1
            } else {
                index
            };

            let start = index.saturating_sub(files.tail_base) as usize;
            for &offset in files.index.offsets().iter().skip(start) {
                let header = read_header_at(&mut files.data, &self.data_path, offset)?;
                if header.status == EntryStatus::Deleted || header.index < keep_from {
                    continue;
                }
                let payload = read_payload(&mut files.data, &self.data_path, header.length)?;
                write_compacted(
                    &mut tmp_data,
                    &self.tmp_data_path,
                    &mut tmp_offsets,
                    &mut pos,
                    &mut new_size,
                    header.index,
                    &payload,
                )?;
            }
        }

        tmp_data
            .sync_all()
            .map_err(|source| io_error(&self.tmp_data_path, source))?;
        drop(tmp_data);

        let mut tmp_index = File::create(&self.tmp_index_path)
            .map_err(|source| io_error(&self.tmp_index_path, source))?;
        let mut raw = Vec::with_capacity(tmp_offsets.len() * 8);
        for offset in &tmp_offsets {
            raw.extend_from_slice(&offset.to_le_bytes());
        }
        tmp_index
            .write_all(&raw)
            .map_err(|source| io_error(&self.tmp_index_path, source))?;
        tmp_index
            .sync_all()
            .map_err(|source| io_error(&self.tmp_index_path, source))?;
        drop(tmp_index);

        // Live handles must be closed before the rename on platforms that
        // lock open files.
        self.files = None;

        // History copy is the recovery point until the swap succeeds.
        fs::copy(&self.data_path, &self.history_data_path)
            .map_err(|source| io_error(&self.history_data_path, source))?;
        fs::copy(&self.index_path, &self.history_index_path)
            .map_err(|source| io_error(&self.history_index_path, source))?;

        fs::rename(&self.tmp_data_path, &self.data_path)
            .map_err(|source| io_error(&self.data_path, source))?;
        fs::rename(&self.tmp_index_path, &self.index_path)
            .map_err(|source| io_error(&self.index_path, source))?;
        if let Some(dir) = self.data_path.parent() {
            fsync_dir(dir)?;
        }

        remove_if_exists(&self.history_data_path)?;
        remove_if_exists(&self.history_index_path)?;

        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.data_path)
            .map_err(|source| io_error(&self.data_path, source))?;
        let index_file = OffsetIndex::open(&self.index_path)?;
        self.files = Some(SegmentFiles {
            data,
            index: index_file,
            tail_base: index,
            write_pos: pos,
        });
        self.first_index = Some(index);
        self.size = new_size;
        Ok(())
    }

    /// Syncs the file handles when `force` or the segment's
    /// `flush_on_write` option is set.
    pub fn flush(&mut self, force: bool) -> LogResult<()> {
        let files = self.files.as_mut().ok_or(LogError::NotOpen)?;
        if force || self.config.flush_on_write {
            files
                .data
                .sync_all()
                .map_err(|source| io_error(&self.data_path, source))?;
            files.index.sync()?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> LogResult<()> {
        if self.files.take().is_none() {
            return Err(LogError::NotOpen);
        }
        self.first_index = None;
        self.last_index = None;
        self.size = 0;
        Ok(())
    }

    /// Removes the segment's files, closing first if needed.
    pub fn delete(&mut self) -> LogResult<()> {
        self.files = None;
        self.first_index = None;
        self.last_index = None;
        self.size = 0;
        remove_if_exists(&self.data_path)?;
        remove_if_exists(&self.index_path)?;
        Ok(())
    }

    pub fn segment(&self) -> u64 {
        self.segment
    }

    pub fn first_index(&self) -> Option<u64> {
        self.first_index
    }

    pub fn last_index(&self) -> Option<u64> {
        self.last_index
    }

    pub fn contains_index(&self, index: u64) -> bool {
        matches!(
            (self.first_index, self.last_index),
            (Some(first), Some(last)) if first <= index && index <= last
        )
    }

    /// Total bytes of live entries, header included.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_open(&self) -> bool {
        self.files.is_some()
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Creation time of the data file in unix millis; 0 when unavailable.
    pub fn created_at_ms(&self) -> u64 {
        fs::metadata(&self.data_path)
            .and_then(|meta| meta.created())
            .ok()
            .and_then(|created| created.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|age| age.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Rolls back an interrupted compaction and drops stale temp files.
    ///
    /// Both history files present means the swap may have started: the
    /// history copy is authoritative. A single history file means the
    /// history copy itself was interrupted while the live files were
    /// still untouched, so the stray is dropped.
    fn recover(&mut self) -> LogResult<()> {
        let have_data = self.history_data_path.exists();
        let have_index = self.history_index_path.exists();
        match (have_data, have_index) {
            (true, true) => {
                tracing::warn!(
                    segment = self.segment,
                    "restoring segment from interrupted compaction"
                );
                fs::copy(&self.history_data_path, &self.data_path)
                    .map_err(|source| io_error(&self.data_path, source))?;
                fs::copy(&self.history_index_path, &self.index_path)
                    .map_err(|source| io_error(&self.index_path, source))?;
                remove_if_exists(&self.history_data_path)?;
                remove_if_exists(&self.history_index_path)?;
            }
            (true, false) => remove_if_exists(&self.history_data_path)?,
            (false, true) => remove_if_exists(&self.history_index_path)?,
            (false, false) => {}
        }
        remove_if_exists(&self.tmp_data_path)?;
        remove_if_exists(&self.tmp_index_path)?;
        Ok(())
    }

    /// Rebuilds in-memory state from the records on disk. A torn record
    /// at the tail (partial append) is dropped; torn records anywhere
    /// else are corruption.
    fn scan_existing(&mut self, files: &mut SegmentFiles) -> LogResult<()> {
        let data_len = files
            .data
            .metadata()
            .map_err(|source| io_error(&self.data_path, source))?
            .len();
        let mut first = None;
        let mut last = None;
        let mut size = 0u64;
        let mut write_pos = 0u64;

        let mut n = 0usize;
        while n < files.index.len() {
            let offset = files.index.offsets()[n];
            let header = if offset + RECORD_HEADER_LEN as u64 > data_len {
                Err(LogError::RecordInvalid {
                    reason: "truncated record header".to_string(),
                })
            } else {
                read_header_at(&mut files.data, &self.data_path, offset)
            };
            let header = match header {
                Ok(header)
                    if offset + RECORD_HEADER_LEN as u64 + u64::from(header.length)
                        <= data_len =>
                {
                    header
                }
                Ok(_) | Err(LogError::RecordInvalid { .. }) if n + 1 == files.index.len() => {
                    tracing::warn!(ordinal = n, "dropping torn record at segment tail");
                    files.index.truncate(n)?;
                    files
                        .data
                        .set_len(offset)
                        .map_err(|source| io_error(&self.data_path, source))?;
                    break;
                }
                Ok(header) => {
                    return Err(LogError::RecordInvalid {
                        reason: format!(
                            "record at ordinal {n} overruns data file ({offset} + {} > {data_len})",
                            u64::from(header.length) + RECORD_HEADER_LEN as u64
                        ),
                    })
                }
                Err(err) => return Err(err),
            };

            if n == 0 {
                files.tail_base = header.index;
            }
            write_pos = offset + RECORD_HEADER_LEN as u64 + u64::from(header.length);
            if header.status == EntryStatus::Active {
                if first.is_none() {
                    first = Some(header.index);
                }
                last = Some(header.index);
                size += u64::from(header.length) + RECORD_HEADER_LEN as u64;
            }
            n += 1;
        }

        self.first_index = first;
        self.last_index = last;
        self.size = size;
        files.write_pos = write_pos;
        Ok(())
    }
}

fn sibling(base: &Path, segment: u64, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!("-{segment}{suffix}"));
    PathBuf::from(name)
}

fn io_error(path: &Path, source: std::io::Error) -> LogError {
    LogError::Io {
        path: Some(path.to_path_buf()),
        source,
    }
}

fn fsync_dir(dir: &Path) -> LogResult<()> {
    let file = File::open(dir).map_err(|source| io_error(dir, source))?;
    file.sync_all().map_err(|source| io_error(dir, source))
}

fn remove_if_exists(path: &Path) -> LogResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(io_error(path, source)),
    }
}

fn read_header_at(data: &mut File, path: &Path, offset: u64) -> LogResult<RecordHeader> {
    data.seek(SeekFrom::Start(offset))
        .map_err(|source| io_error(path, source))?;
    let mut buf = [0u8; RECORD_HEADER_LEN];
    match data.read_exact(&mut buf) {
        Ok(()) => RecordHeader::decode(&buf),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(LogError::RecordInvalid {
                reason: "truncated record header".to_string(),
            })
        }
        Err(source) => Err(io_error(path, source)),
    }
}

/// Reads a payload at the current cursor (immediately after the header).
fn read_payload(data: &mut File, path: &Path, length: u32) -> LogResult<Bytes> {
    let mut payload = vec![0u8; length as usize];
    match data.read_exact(&mut payload) {
        Ok(()) => Ok(Bytes::from(payload)),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(LogError::RecordInvalid {
                reason: "truncated record payload".to_string(),
            })
        }
        Err(source) => Err(io_error(path, source)),
    }
}

fn stamp_status(data: &mut File, path: &Path, offset: u64, status: EntryStatus) -> LogResult<()> {
    data.seek(SeekFrom::Start(offset + STATUS_OFFSET))
        .map_err(|source| io_error(path, source))?;
    data.write_all(&[status.as_byte()])
        .map_err(|source| io_error(path, source))
}

fn write_compacted(
    tmp: &mut File,
    path: &Path,
    tmp_offsets: &mut Vec<u64>,
    pos: &mut u64,
    size: &mut u64,
    index: u64,
    payload: &[u8],
) -> LogResult<()> {
    let length = u32::try_from(payload.len()).map_err(|_| LogError::EntryTooLarge {
        max_bytes: u32::MAX as usize,
        got_bytes: payload.len(),
    })?;
    let header = RecordHeader {
        index,
        status: EntryStatus::Active,
        length,
    };
    tmp.write_all(&header.encode())
        .map_err(|source| io_error(path, source))?;
    tmp.write_all(payload)
        .map_err(|source| io_error(path, source))?;
    tmp_offsets.push(*pos);
    *pos += RECORD_HEADER_LEN as u64 + u64::from(length);
    *size += RECORD_HEADER_LEN as u64 + u64::from(length);
    Ok(())
}
