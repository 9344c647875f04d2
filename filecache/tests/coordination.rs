//! End-to-end coordination scenarios with real threads.

use filecache::{
    CacheConfig, CacheKey, CallerScope, DownloadState, FileCache, FileSegment,
};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::{TempDir, tempdir};

fn test_cache(max_size: u64) -> (TempDir, Arc<FileCache>) {
    let dir = tempdir().expect("Failed to create temp dir");
    let cache = FileCache::new(
        CacheConfig::new()
            .cache_dir(dir.path())
            .max_size(max_size)
            .max_segment_size(512)
            .wait_timeout(Duration::from_secs(2)),
    )
    .expect("Failed to create cache");
    (dir, cache)
}

/// Deterministic source bytes for the logical file backing a key.
fn source_bytes(range: filecache::SegmentRange) -> Vec<u8> {
    (range.left..=range.right).map(|i| (i % 251) as u8).collect()
}

/// Download the segment's full remaining range as its downloader.
fn download_fully(segment: &FileSegment) {
    let range = segment.range();
    while segment.downloaded_size() < range.size() {
        let downloaded = segment.downloaded_size();
        let chunk_len = 128.min(range.size() - downloaded);
        assert!(segment.reserve(chunk_len).expect("reserve failed"));
        let chunk = source_bytes(filecache::SegmentRange::new(
            range.left + downloaded,
            range.left + downloaded + chunk_len - 1,
        ));
        segment.write(&chunk).expect("write failed");
    }
    segment
        .complete(DownloadState::Downloaded)
        .expect("complete failed");
}

#[test]
fn happy_path_downloads_and_persists() {
    let (_dir, cache) = test_cache(1024 * 1024);
    let key = CacheKey::from_path("bucket/happy");

    let _scope = CallerScope::enter("query-a");
    let holder = cache.get_or_set(key, 0, 100).expect("get_or_set failed");
    let segment = &holder[0];
    assert_eq!(segment.state(), DownloadState::Empty);

    let me = cache.caller_id().expect("caller id installed");
    assert_eq!(segment.get_or_set_downloader().expect("election failed"), me);
    download_fully(segment);

    assert_eq!(segment.state(), DownloadState::Downloaded);
    let on_disk = std::fs::read(cache.segment_path(key, 0)).expect("read failed");
    assert_eq!(on_disk, source_bytes(segment.range()));
}

#[test]
fn two_readers_elect_one_downloader() {
    let (_dir, cache) = test_cache(1024 * 1024);
    let key = CacheKey::from_path("bucket/race");
    let barrier = Arc::new(Barrier::new(2));

    let workers: Vec<_> = (0..2)
        .map(|worker| {
            let cache = cache.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let _scope = CallerScope::enter(format!("query-{worker}"));
                let me = cache.caller_id().expect("caller id installed");
                let holder = cache.get_or_set(key, 0, 200).expect("get_or_set failed");
                let segment = &holder[0];

                barrier.wait();
                let winner = segment.get_or_set_downloader().expect("election failed");
                if winner == me {
                    download_fully(segment);
                    true
                } else {
                    // The wait is not guaranteed to observe completion;
                    // re-read until the download settles.
                    let mut state = segment.wait().expect("wait failed");
                    for _ in 0..100 {
                        if state != DownloadState::Downloading {
                            break;
                        }
                        state = segment.wait().expect("wait failed");
                    }
                    assert_eq!(state, DownloadState::Downloaded);
                    false
                }
            })
        })
        .collect();

    let was_downloader: Vec<bool> = workers
        .into_iter()
        .map(|worker| worker.join().expect("worker panicked"))
        .collect();

    // Exactly one election winner.
    assert_eq!(was_downloader.iter().filter(|&&won| won).count(), 1);
    let on_disk = std::fs::read(cache.segment_path(key, 0)).expect("read failed");
    assert_eq!(on_disk.len(), 200);
}

#[test]
fn partial_download_is_continued_by_second_holder() {
    let (_dir, cache) = test_cache(1024 * 1024);
    let key = CacheKey::from_path("bucket/continuation");

    let holder_a = cache.get_or_set(key, 0, 200).expect("get_or_set failed");
    let holder_b = cache.get_or_set(key, 0, 200).expect("get_or_set failed");
    let segment = holder_a[0].clone();

    {
        let _scope = CallerScope::enter("query-a");
        segment.get_or_set_downloader().expect("election failed");
        assert!(segment.reserve(50).expect("reserve failed"));
        segment
            .write(&source_bytes(filecache::SegmentRange::new(0, 49)))
            .expect("write failed");
        segment
            .complete(DownloadState::PartiallyDownloaded)
            .expect("complete failed");
    }
    drop(holder_a);

    // B still holds the segment, so it survived in a resumable state.
    assert_eq!(segment.state(), DownloadState::PartiallyDownloaded);
    assert!(!segment.is_downloader());

    {
        let _scope = CallerScope::enter("query-b");
        let me = cache.caller_id().expect("caller id installed");
        let winner = segment.get_or_set_downloader().expect("election failed");
        assert_eq!(winner, me);
        assert_eq!(segment.downloaded_size(), 50);
        download_fully(&segment);
    }
    drop(holder_b);

    assert_eq!(segment.state(), DownloadState::Downloaded);
    let on_disk = std::fs::read(cache.segment_path(key, 0)).expect("read failed");
    assert_eq!(on_disk, source_bytes(segment.range()));
}

#[test]
fn last_holder_shrinks_partial_segment() {
    let (_dir, cache) = test_cache(1024 * 1024);
    let key = CacheKey::from_path("bucket/shrink");

    {
        let _scope = CallerScope::enter("query-a");
        let holder = cache.get_or_set(key, 0, 200).expect("get_or_set failed");
        let segment = &holder[0];
        segment.get_or_set_downloader().expect("election failed");
        assert!(segment.reserve(50).expect("reserve failed"));
        segment
            .write(&source_bytes(filecache::SegmentRange::new(0, 49)))
            .expect("write failed");
        // No explicit complete: releasing the only handle finalizes and,
        // as the last holder, shrinks the segment to what was downloaded.
    }

    assert_eq!(
        std::fs::metadata(cache.segment_path(key, 0))
            .expect("stat failed")
            .len(),
        50
    );
    assert_eq!(cache.used_bytes(), 50);

    let holder = cache.get_or_set(key, 0, 200).expect("get_or_set failed");
    assert_eq!(holder.len(), 2);
    assert_eq!(holder[0].state(), DownloadState::Downloaded);
    assert_eq!(holder[0].range(), filecache::SegmentRange::new(0, 49));
    assert_eq!(holder[1].state(), DownloadState::Empty);
    assert_eq!(holder[1].range(), filecache::SegmentRange::new(50, 199));
}

#[test]
fn zero_byte_abandonment_skips_the_cache() {
    let (_dir, cache) = test_cache(1024 * 1024);
    let key = CacheKey::from_path("bucket/abandoned");

    let weak_segment = {
        let _scope = CallerScope::enter("query-a");
        let holder = cache.get_or_set(key, 0, 200).expect("get_or_set failed");
        let weak_segment = Arc::downgrade(&holder[0]);
        holder[0].get_or_set_downloader().expect("election failed");
        // Claimed but never wrote a byte; releasing the only handle
        // removes the segment entirely.
        drop(holder);
        weak_segment
    };

    assert!(weak_segment.upgrade().is_none());
    assert_eq!(cache.segment_count(), 0);
    assert!(!cache.segment_path(key, 0).exists());
}

#[test]
fn quota_refusal_leaves_segment_unchanged() {
    let (_dir, cache) = test_cache(50);
    let key = CacheKey::from_path("bucket/refused");

    let _scope = CallerScope::enter("query-a");
    let holder = cache.get_or_set(key, 0, 200).expect("get_or_set failed");
    let segment = holder[0].clone();
    segment.get_or_set_downloader().expect("election failed");

    assert!(!segment.reserve(100).expect("reserve should be refused"));
    assert_eq!(segment.downloaded_size(), 0);
    assert_eq!(segment.state(), DownloadState::Downloading);

    segment
        .complete(DownloadState::PartiallyDownloadedNoContinuation)
        .expect("complete failed");
    drop(holder);

    assert_eq!(segment.state(), DownloadState::SkipCache);
    assert_eq!(cache.segment_count(), 0);
}

#[test]
fn concurrent_readers_share_downloads() {
    let (_dir, cache) = test_cache(1024 * 1024);
    let key = CacheKey::from_path("bucket/stress");
    let total: u64 = 4096;
    let barrier = Arc::new(Barrier::new(4));

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let cache = cache.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let _scope = CallerScope::enter(format!("query-{worker}"));
                let me = cache.caller_id().expect("caller id installed");
                barrier.wait();

                let holder = cache.get_or_set(key, 0, total).expect("get_or_set failed");
                for segment in holder.iter() {
                    let mut attempts = 0;
                    loop {
                        match segment.state() {
                            DownloadState::Downloaded => break,
                            DownloadState::SkipCache
                            | DownloadState::PartiallyDownloadedNoContinuation => {
                                panic!("download unexpectedly abandoned");
                            }
                            _ => {
                                let winner = segment
                                    .get_or_set_downloader()
                                    .expect("election failed");
                                if winner == me {
                                    download_fully(segment);
                                } else {
                                    let _ = segment.wait().expect("wait failed");
                                }
                            }
                        }
                        attempts += 1;
                        assert!(attempts < 100, "segment never settled");
                    }

                    let on_disk = std::fs::read(
                        cache.segment_path(segment.key(), segment.offset()),
                    )
                    .expect("read failed");
                    assert_eq!(on_disk, source_bytes(segment.range()));
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("worker panicked");
    }

    assert_eq!(cache.used_bytes(), total);
    assert_eq!(cache.segment_count(), 8);
}

#[test]
fn recovered_segments_serve_later_instances() {
    let dir = tempdir().expect("Failed to create temp dir");
    let config = || {
        CacheConfig::new()
            .cache_dir(dir.path())
            .max_segment_size(512)
            .wait_timeout(Duration::from_secs(2))
    };
    let key = CacheKey::from_path("bucket/recovered");

    {
        let _scope = CallerScope::enter("query-a");
        let cache = FileCache::new(config()).expect("Failed to create cache");
        let holder = cache.get_or_set(key, 0, 300).expect("get_or_set failed");
        let segment = &holder[0];
        segment.get_or_set_downloader().expect("election failed");
        download_fully(segment);
    }

    let cache = FileCache::new(config()).expect("Failed to reopen cache");
    let stats = cache.recovery_stats().expect("recovery should have run");
    assert_eq!(stats.segments_recovered, 1);
    assert_eq!(stats.bytes_recovered, 300);

    let _scope = CallerScope::enter("query-b");
    let holder = cache.get_or_set(key, 0, 300).expect("get_or_set failed");
    assert_eq!(holder[0].state(), DownloadState::Downloaded);
    let on_disk = std::fs::read(cache.segment_path(key, 0)).expect("read failed");
    assert_eq!(on_disk, source_bytes(holder[0].range()));
}
