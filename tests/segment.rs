//! Log segment scenarios: append, indexed reads, tombstone truncation.

mod fixtures;

use replicore::{LogError, LogSegment, SegmentConfig};
use tempfile::TempDir;

use fixtures::{open_segment, read_all};

#[test]
fn append_remove_reappend_cycle() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().join("log");
    let mut seg = open_segment(&base, 0);

    let indices = seg
        .append_batch(&[b"A".as_ref(), b"B".as_ref(), b"C".as_ref()])
        .expect("append batch");
    assert_eq!(indices, vec![0, 1, 2]);

    seg.remove_after(0).expect("remove_after");
    assert_eq!(seg.get(1).expect("get"), None);
    assert_eq!(seg.get(0).expect("get").expect("present").as_ref(), b"A");
    assert_eq!(seg.last_index(), Some(0));

    assert_eq!(seg.append(b"D").expect("append"), 1);
    assert_eq!(seg.get(1).expect("get").expect("present").as_ref(), b"D");
}

#[test]
fn appends_are_monotonic_from_base() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().join("log");
    let mut seg = open_segment(&base, 17);

    let mut previous = None;
    for n in 0..20u64 {
        let index = seg.append(format!("entry-{n}").as_bytes()).expect("append");
        if let Some(previous) = previous {
            assert_eq!(index, previous + 1);
        } else {
            assert_eq!(index, 17);
        }
        previous = Some(index);
    }
    assert_eq!(seg.first_index(), Some(17));
    assert_eq!(seg.last_index(), Some(36));
}

#[test]
fn read_after_write_is_byte_exact() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().join("log");
    let mut seg = open_segment(&base, 0);

    let payloads: Vec<Vec<u8>> = (0..10u8).map(|n| vec![n; (n as usize) + 1]).collect();
    for payload in &payloads {
        let index = seg.append(payload).expect("append");
        let got = seg.get(index).expect("get").expect("present");
        assert_eq!(got.as_ref(), payload.as_slice());
    }

    let all = read_all(&mut seg, 0, 9);
    assert_eq!(all, payloads);
}

#[test]
fn tombstoned_suffix_reads_as_null_prefix_unchanged() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().join("log");
    let mut seg = open_segment(&base, 0);
    seg.append_batch(&[b"a".as_ref(), b"b".as_ref(), b"c".as_ref(), b"d".as_ref()])
        .expect("append batch");

    seg.remove_after(1).expect("remove_after");
    for index in 2..=3u64 {
        assert_eq!(seg.get(index).expect("get"), None);
    }
    assert_eq!(seg.get(0).expect("get").expect("present").as_ref(), b"a");
    assert_eq!(seg.get(1).expect("get").expect("present").as_ref(), b"b");
    assert_eq!(seg.last_index(), Some(1));
    assert_eq!(read_all(&mut seg, 0, 3), vec![b"a".to_vec(), b"b".to_vec()]);
}

#[test]
fn contains_index_tracks_live_range() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().join("log");
    let mut seg = open_segment(&base, 5);

    assert!(!seg.contains_index(5));
    seg.append_batch(&[b"a".as_ref(), b"b".as_ref()]).expect("append");
    assert!(seg.contains_index(5));
    assert!(seg.contains_index(6));
    assert!(!seg.contains_index(7));
    assert!(!seg.contains_index(4));
}

#[test]
fn is_empty_follows_size() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().join("log");
    let mut seg = open_segment(&base, 0);

    assert!(seg.is_empty());
    assert_eq!(seg.size(), 0);
    seg.append(b"a").expect("append");
    assert!(!seg.is_empty());
    assert_eq!(seg.size(), 14);
    seg.remove_after(0).expect("remove_after");
    assert!(!seg.is_empty());
}

#[test]
fn state_survives_close_and_reopen() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().join("log");
    let mut seg = open_segment(&base, 2);
    seg.append_batch(&[b"x".as_ref(), b"y".as_ref(), b"z".as_ref()])
        .expect("append");
    seg.remove_after(3).expect("remove_after");
    seg.close().expect("close");
    assert!(!seg.is_open());

    let mut seg = LogSegment::new(&base, 2, SegmentConfig::default());
    seg.open().expect("reopen");
    assert_eq!(seg.first_index(), Some(2));
    assert_eq!(seg.last_index(), Some(3));
    assert_eq!(seg.get(2).expect("get").expect("present").as_ref(), b"x");
    assert_eq!(seg.get(4).expect("get"), None);
    assert_eq!(seg.append(b"w").expect("append"), 4);
}

#[test]
fn batch_append_is_equivalent_to_sequential() {
    let temp = TempDir::new().unwrap();
    let mut batch_seg = open_segment(&temp.path().join("batch"), 0);
    let mut seq_seg = open_segment(&temp.path().join("seq"), 0);

    let entries = [b"one".as_ref(), b"two".as_ref(), b"three".as_ref()];
    let batch_indices = batch_seg.append_batch(&entries).expect("append batch");
    let seq_indices: Vec<u64> = entries
        .iter()
        .map(|entry| seq_seg.append(entry).expect("append"))
        .collect();

    assert_eq!(batch_indices, seq_indices);
    assert_eq!(read_all(&mut batch_seg, 0, 2), read_all(&mut seq_seg, 0, 2));
}

#[test]
fn flush_on_write_segment_behaves_identically() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().join("log");
    let mut seg = LogSegment::new(&base, 0, SegmentConfig::new(true, 1024));
    seg.open().expect("open");

    seg.append(b"durable").expect("append");
    seg.remove_after(0).expect("remove_after");
    assert_eq!(seg.get(0).expect("get").expect("present").as_ref(), b"durable");
    seg.flush(true).expect("flush");
}

#[test]
fn closed_segment_rejects_reads_and_writes() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().join("log");
    let mut seg = open_segment(&base, 0);
    seg.append(b"a").expect("append");
    seg.close().expect("close");

    assert!(matches!(seg.append(b"b"), Err(LogError::NotOpen)));
    assert!(matches!(seg.get(0), Err(LogError::NotOpen)));
    assert!(matches!(seg.flush(true), Err(LogError::NotOpen)));
    assert!(matches!(seg.remove_after(0), Err(LogError::NotOpen)));
}
