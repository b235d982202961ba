//! End-to-end engine scenarios against a mock HTTP server.

use downpour::{
    DownloadEngine, DownloadError, DownloadOptions, Observers, SessionState, WriteMode,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Deterministic, non-repeating payload.
fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// HEAD answer advertising the resource. The body sets the Content-Length;
/// the server never transfers it for HEAD.
async fn mount_head(server: &MockServer, route: &str, body: &[u8], ranges: bool) {
    let mut template = ResponseTemplate::new(200).set_body_bytes(body.to_vec());
    if ranges {
        template = template.insert_header("Accept-Ranges", "bytes");
    }
    Mock::given(method("HEAD"))
        .and(path(route))
        .respond_with(template)
        .mount(server)
        .await;
}

/// 206 answer for one closed byte range of `body`.
async fn mount_range(server: &MockServer, route: &str, body: &[u8], start: usize, end: usize) {
    Mock::given(method("GET"))
        .and(path(route))
        .and(header("Range", format!("bytes={}-{}", start, end).as_str()))
        .respond_with(
            ResponseTemplate::new(206)
                .set_body_bytes(body[start..=end].to_vec())
                .insert_header(
                    "Content-Range",
                    format!("bytes {}-{}/{}", start, end, body.len()).as_str(),
                ),
        )
        .mount(server)
        .await;
}

fn options(server: &MockServer, route: &str, dir: &std::path::Path) -> DownloadOptions {
    DownloadOptions::new(format!("{}{}", server.uri(), route))
        .with_dst_dir(dir)
        .with_write_mode(WriteMode::Overwrite)
}

#[tokio::test]
async fn small_file_single_chunk() {
    let server = MockServer::start().await;
    let body = payload(1024);
    mount_head(&server, "/a.bin", &body, true).await;
    mount_range(&server, "/a.bin", &body, 0, 1023).await;

    let dir = tempfile::tempdir().unwrap();
    let completions = Arc::new(AtomicUsize::new(0));
    let progress_seen = Arc::new(Mutex::new(Vec::new()));

    let mut opts = options(&server, "/a.bin", dir.path());
    let completions_cb = Arc::clone(&completions);
    let progress_cb = Arc::clone(&progress_seen);
    opts.observers = Observers {
        completed: Some(Arc::new(move |_| {
            completions_cb.fetch_add(1, Ordering::SeqCst);
        })),
        progress: Some(Arc::new(move |v| progress_cb.lock().unwrap().push(v))),
        ..Observers::default()
    };

    let engine = DownloadEngine::new(opts).unwrap();
    engine.start();
    // start is idempotent
    engine.start();
    let published = engine.wait().await.unwrap();

    assert_eq!(published.file_name().unwrap(), "a.bin");
    assert_eq!(std::fs::read(&published).unwrap(), body);
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(engine.state(), SessionState::Completed);
    assert_eq!(*progress_seen.lock().unwrap().last().unwrap(), 1.0);
    assert!(!dir.path().join("a.bin.part").exists());
}

#[tokio::test]
async fn three_chunks_merge_into_one_file() {
    let server = MockServer::start().await;
    let body = payload(300);
    mount_head(&server, "/data.bin", &body, true).await;
    mount_range(&server, "/data.bin", &body, 0, 99).await;
    mount_range(&server, "/data.bin", &body, 100, 199).await;
    mount_range(&server, "/data.bin", &body, 200, 299).await;

    let dir = tempfile::tempdir().unwrap();
    let progress_seen = Arc::new(Mutex::new(Vec::new()));

    let mut opts = options(&server, "/data.bin", dir.path()).with_chunks(3);
    let progress_cb = Arc::clone(&progress_seen);
    opts.observers = Observers {
        progress: Some(Arc::new(move |v| progress_cb.lock().unwrap().push(v))),
        ..Observers::default()
    };

    let engine = DownloadEngine::new(opts).unwrap();
    engine.start();
    let published = engine.wait().await.unwrap();

    assert_eq!(std::fs::read(&published).unwrap(), body);

    // Part files are consumed by the merge.
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.contains("_chunk") || n.ends_with(".part"))
        .collect();
    assert!(leftovers.is_empty(), "leftover scratch files: {:?}", leftovers);

    // Progress is monotonic and terminates at exactly 1.0.
    let emissions = progress_seen.lock().unwrap().clone();
    let mut last = 0.0;
    for value in &emissions {
        assert!(*value >= last, "progress regressed: {:?}", emissions);
        last = *value;
    }
    assert_eq!(emissions.last(), Some(&1.0));
}

#[tokio::test]
async fn partition_count_does_not_change_the_bytes() {
    let server = MockServer::start().await;
    let body = payload(300);
    mount_head(&server, "/law.bin", &body, true).await;
    mount_range(&server, "/law.bin", &body, 0, 299).await;
    mount_range(&server, "/law.bin", &body, 0, 99).await;
    mount_range(&server, "/law.bin", &body, 100, 199).await;
    mount_range(&server, "/law.bin", &body, 200, 299).await;

    let single_dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(options(&server, "/law.bin", single_dir.path())).unwrap();
    engine.start();
    let single = engine.wait().await.unwrap();

    let multi_dir = tempfile::tempdir().unwrap();
    let engine =
        DownloadEngine::new(options(&server, "/law.bin", multi_dir.path()).with_chunks(3)).unwrap();
    engine.start();
    let multi = engine.wait().await.unwrap();

    assert_eq!(
        std::fs::read(&single).unwrap(),
        std::fs::read(&multi).unwrap()
    );
}

#[tokio::test]
async fn resume_after_crash_refetches_only_the_tail() {
    let server = MockServer::start().await;
    let body = payload(300);
    mount_head(&server, "/data.bin", &body, true).await;
    // Only the tail ranges are mounted: a request for already-recovered
    // bytes would 404 and fail the test.
    mount_range(&server, "/data.bin", &body, 150, 199).await;
    mount_range(&server, "/data.bin", &body, 200, 299).await;

    let dir = tempfile::tempdir().unwrap();
    // The crashed session left chunk 0 and half of chunk 1 merged.
    std::fs::write(dir.path().join("data.bin.part"), &body[..150]).unwrap();

    let opts = options(&server, "/data.bin", dir.path())
        .with_chunks(3)
        .with_write_mode(WriteMode::AppendOrTruncate);
    let engine = DownloadEngine::new(opts).unwrap();
    engine.start();
    let published = engine.wait().await.unwrap();

    assert_eq!(std::fs::read(&published).unwrap(), body);
}

#[tokio::test]
async fn head_rejected_and_range_ignored_falls_back_to_single_stream() {
    let server = MockServer::start().await;
    let body = payload(50);

    Mock::given(method("HEAD"))
        .and(path("/file"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;
    // Every GET gets the full body with a 200, Range or not.
    Mock::given(method("GET"))
        .and(path("/file"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let opts = options(&server, "/file", dir.path()).with_chunks(3);
    let engine = DownloadEngine::new(opts).unwrap();
    engine.start();
    let published = engine.wait().await.unwrap();

    assert_eq!(std::fs::read(&published).unwrap(), body);
    // The probe went through the GET fallback; no resume support.
    assert!(!engine.info().unwrap().accepts_ranges);
}

#[tokio::test]
async fn rate_cap_stretches_the_transfer() {
    let server = MockServer::start().await;
    let body = payload(100);
    mount_head(&server, "/slow.bin", &body, true).await;
    mount_range(&server, "/slow.bin", &body, 0, 99).await;

    let dir = tempfile::tempdir().unwrap();
    let opts = options(&server, "/slow.bin", dir.path()).with_max_bps(50);
    let engine = DownloadEngine::new(opts).unwrap();

    let started = Instant::now();
    engine.start();
    let published = engine.wait().await.unwrap();
    let elapsed = started.elapsed();

    // 100 bytes at 50 B/s with a one-second burst allowance: the tail
    // still has to wait for the bucket.
    assert!(elapsed >= Duration::from_millis(700), "elapsed {:?}", elapsed);
    assert_eq!(std::fs::read(&published).unwrap(), body);
}

#[tokio::test]
async fn uncapped_transfer_still_reports_speed() {
    let server = MockServer::start().await;
    let body = payload(4096);
    mount_head(&server, "/fast.bin", &body, true).await;
    mount_range(&server, "/fast.bin", &body, 0, 4095).await;

    let dir = tempfile::tempdir().unwrap();
    let speeds = Arc::new(Mutex::new(Vec::new()));

    let mut opts = options(&server, "/fast.bin", dir.path());
    let speeds_cb = Arc::clone(&speeds);
    opts.observers = Observers {
        speed: Some(Arc::new(move |v| speeds_cb.lock().unwrap().push(v))),
        ..Observers::default()
    };

    let engine = DownloadEngine::new(opts).unwrap();
    engine.start();
    engine.wait().await.unwrap();

    assert!(speeds.lock().unwrap().iter().any(|v| *v > 0));
}

#[tokio::test]
async fn zero_length_resource_completes_without_chunks() {
    let server = MockServer::start().await;
    mount_head(&server, "/empty.bin", &[], true).await;
    // No GET mock: any body request would 404.

    let dir = tempfile::tempdir().unwrap();
    let progress_seen = Arc::new(Mutex::new(Vec::new()));
    let mut opts = options(&server, "/empty.bin", dir.path());
    let progress_cb = Arc::clone(&progress_seen);
    opts.observers = Observers {
        progress: Some(Arc::new(move |v| progress_cb.lock().unwrap().push(v))),
        ..Observers::default()
    };

    let engine = DownloadEngine::new(opts).unwrap();
    engine.start();
    let published = engine.wait().await.unwrap();

    assert_eq!(std::fs::metadata(&published).unwrap().len(), 0);
    assert_eq!(*progress_seen.lock().unwrap().last().unwrap(), 1.0);
}

#[tokio::test]
async fn excluded_extension_fails_before_touching_the_disk() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/setup"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(payload(10))
                .insert_header("Content-Type", "application/x-msdownload")
                .insert_header("Accept-Ranges", "bytes"),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut opts = options(&server, "/setup", dir.path());
    opts.excluded_extensions = vec!["exe".into()];
    opts.observers = Observers {
        mime_lookup: Some(Arc::new(|content_type| {
            (content_type == "application/x-msdownload").then(|| "exe".to_string())
        })),
        ..Observers::default()
    };

    let engine = DownloadEngine::new(opts).unwrap();
    engine.start();
    let error = engine.wait().await.unwrap_err();

    assert!(matches!(error, DownloadError::DisallowedExtension(_)));
    assert_eq!(engine.state(), SessionState::Failed);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn append_strict_refuses_an_occupied_destination() {
    let server = MockServer::start().await;
    let body = payload(64);
    mount_head(&server, "/a.bin", &body, true).await;

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.bin"), b"occupied").unwrap();

    let opts = options(&server, "/a.bin", dir.path()).with_write_mode(WriteMode::AppendStrict);
    let engine = DownloadEngine::new(opts).unwrap();
    engine.start();
    let error = engine.wait().await.unwrap_err();

    assert!(matches!(error, DownloadError::DestinationExists(_)));
    assert_eq!(std::fs::read(dir.path().join("a.bin")).unwrap(), b"occupied");
}

#[tokio::test]
async fn create_new_picks_a_free_name() {
    let server = MockServer::start().await;
    let body = payload(64);
    mount_head(&server, "/a.bin", &body, true).await;
    mount_range(&server, "/a.bin", &body, 0, 63).await;

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.bin"), b"old").unwrap();

    let opts = options(&server, "/a.bin", dir.path()).with_write_mode(WriteMode::CreateNew);
    let engine = DownloadEngine::new(opts).unwrap();
    engine.start();
    let published = engine.wait().await.unwrap();

    assert_eq!(published.file_name().unwrap(), "a (1).bin");
    assert_eq!(std::fs::read(&published).unwrap(), body);
    assert_eq!(std::fs::read(dir.path().join("a.bin")).unwrap(), b"old");
}

#[tokio::test]
async fn cancel_terminates_as_cancelled() {
    let server = MockServer::start().await;
    let body = payload(1024);
    mount_head(&server, "/slow.bin", &body, true).await;
    Mock::given(method("GET"))
        .and(path("/slow.bin"))
        .respond_with(
            ResponseTemplate::new(206)
                .set_body_bytes(body.clone())
                .insert_header("Content-Range", "bytes 0-1023/1024")
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(options(&server, "/slow.bin", dir.path())).unwrap();
    engine.start();

    tokio::time::sleep(Duration::from_millis(150)).await;
    engine.cancel();

    let error = engine.wait().await.unwrap_err();
    assert!(matches!(error, DownloadError::Cancelled));
    assert_eq!(engine.state(), SessionState::Cancelled);
    assert!(!dir.path().join("slow.bin").exists());
}

#[tokio::test]
async fn pause_parks_and_resume_finishes() {
    let server = MockServer::start().await;
    let body = payload(256);
    mount_head(&server, "/p.bin", &body, true).await;
    mount_range(&server, "/p.bin", &body, 0, 255).await;

    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(options(&server, "/p.bin", dir.path())).unwrap();

    // Park the session before the fetchers get going.
    engine.start();
    engine.pause();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!engine.state().is_terminal());

    engine.resume();
    let published = engine.wait().await.unwrap();
    assert_eq!(std::fs::read(&published).unwrap(), body);
}
