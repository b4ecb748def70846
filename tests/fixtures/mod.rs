//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};

use replicore::{LogSegment, SegmentConfig};

pub fn open_segment(base: &Path, segment: u64) -> LogSegment {
    let mut seg = LogSegment::new(base, segment, SegmentConfig::default());
    seg.open().expect("open segment");
    seg
}

pub fn segment_file(base: &Path, segment: u64, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!("-{segment}{suffix}"));
    PathBuf::from(name)
}

pub fn read_all(seg: &mut LogSegment, from: u64, to: u64) -> Vec<Vec<u8>> {
    seg.get_range(from, to)
        .expect("get_range")
        .into_iter()
        .map(|bytes| bytes.to_vec())
        .collect()
}
