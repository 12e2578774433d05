//! Integration tests: local HTTP server, parallel pool, resume, verify,
//! lock contention, and cooperative stop.

mod common;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use common::file_server::{start, Route, ServerState};
use reposync_core::checksum::{file_checksum, ChecksumType};
use reposync_core::control::CancelToken;
use reposync_core::descriptor::{FetchDescriptor, FetchStatus, ItemType};
use reposync_core::fetcher::{Fetcher, FetcherOptions, NullProgress};
use reposync_core::pool::{ParallelFetch, ReportCallback};
use reposync_core::progress::{ProgressReport, ReportStatus};
use reposync_core::storage::part_path_for;

fn sha256_of(body: &[u8]) -> String {
    let f = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(f.path(), body).unwrap();
    file_checksum(ChecksumType::Sha256, f.path()).unwrap()
}

fn desc(base: &str, name: &str, save: &Path, body: &[u8]) -> FetchDescriptor {
    let mut d = FetchDescriptor::new(
        name,
        format!("{}/{}", base, name),
        save,
        ItemType::File,
    );
    d.expected_size = Some(body.len() as u64);
    d.checksum_type = Some(ChecksumType::Sha256);
    d.checksum = Some(sha256_of(body));
    d
}

fn collecting_callback() -> (ReportCallback, Arc<Mutex<Vec<ProgressReport>>>) {
    let reports: Arc<Mutex<Vec<ProgressReport>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let cb: ReportCallback = Arc::new(move |r: &ProgressReport| {
        sink.lock().unwrap().push(r.clone());
    });
    (cb, reports)
}

fn serve(files: &[(&str, Vec<u8>)]) -> (String, Arc<ServerState>) {
    let mut routes = HashMap::new();
    for (name, body) in files {
        routes.insert(format!("/{}", name), Route::body(body.clone()));
    }
    start(routes)
}

#[test]
fn two_files_clean_sync() {
    let body_a = vec![0xAAu8; 1000];
    let body_b = vec![0xBBu8; 2000];
    let (base, _state) = serve(&[("a.bin", body_a.clone()), ("b.bin", body_b.clone())]);
    let dir = tempfile::tempdir().unwrap();
    let save = dir.path().join("repo");

    let (callback, reports) = collecting_callback();
    let mut pool = ParallelFetch::new(
        Fetcher::new(FetcherOptions::default()),
        2,
        Some(callback),
    );
    pool.add_item(desc(&base, "a.bin", &save, &body_a)).unwrap();
    pool.add_item(desc(&base, "b.bin", &save, &body_b)).unwrap();
    pool.start();
    let report = pool.wait_for_finish();

    assert_eq!(report.successes, 2);
    assert_eq!(report.downloads, 2);
    assert_eq!(report.errors, 0);
    assert!(report.error_details.is_empty());
    assert_eq!(std::fs::read(save.join("a.bin")).unwrap(), body_a);
    assert_eq!(std::fs::read(save.join("b.bin")).unwrap(), body_b);
    assert!(!part_path_for(&save.join("a.bin")).exists());
    assert!(!part_path_for(&save.join("b.bin")).exists());

    let reports = reports.lock().unwrap();
    let finished = reports
        .iter()
        .find(|r| matches!(r.status, Some(ReportStatus::Finished)))
        .expect("finished report");
    assert_eq!(finished.items_total, 2);
    assert_eq!(finished.items_left, 0);
    assert_eq!(finished.size_total, 3000);
    assert_eq!(finished.size_left, 0);
    assert_eq!(finished.num_success, 2);
    assert_eq!(finished.num_error, 0);
}

#[test]
fn size_mismatch_exhausts_retries_and_removes_file() {
    // Server serves 500 bytes; the descriptor advertises 1000.
    let short_body = vec![0x11u8; 500];
    let (base, state) = serve(&[("pkg.bin", short_body.clone())]);
    let dir = tempfile::tempdir().unwrap();
    let save = dir.path().join("repo");

    let mut d = desc(&base, "pkg.bin", &save, &short_body);
    d.expected_size = Some(1000);

    let mut pool = ParallelFetch::new(
        Fetcher::new(FetcherOptions {
            retries: 2,
            ..FetcherOptions::default()
        }),
        1,
        None,
    );
    pool.add_item(d).unwrap();
    pool.start();
    let report = pool.wait_for_finish();

    assert_eq!(report.errors, 1);
    assert_eq!(report.error_details.len(), 1);
    assert_eq!(report.error_details[0].status, FetchStatus::SizeMismatch);
    assert!(!save.join("pkg.bin").exists());
    assert_eq!(state.request_count("/pkg.bin"), 3, "initial try plus two retries");

    let last = report.last_progress.unwrap();
    assert_eq!(last.num_error, 1);
    assert_eq!(last.size_left, 0);
}

#[test]
fn resume_downloads_only_the_tail() {
    let body: Vec<u8> = (0u8..=255).cycle().take(1000).collect();
    let (base, state) = serve(&[("big.bin", body.clone())]);
    let dir = tempfile::tempdir().unwrap();
    let save = dir.path().join("repo");
    std::fs::create_dir_all(&save).unwrap();

    // 400 bytes already staged from an interrupted run.
    std::fs::write(part_path_for(&save.join("big.bin")), &body[..400]).unwrap();

    let d = desc(&base, "big.bin", &save, &body);
    let fetcher = Fetcher::new(FetcherOptions::default());
    let outcome = fetcher.fetch(&d, &NullProgress, &CancelToken::new());
    assert_eq!(outcome.status, FetchStatus::Downloaded, "{:?}", outcome.detail);
    assert_eq!(std::fs::read(save.join("big.bin")).unwrap(), body);

    let requests = state.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].range_start, Some(400));
    drop(requests);
    assert_eq!(state.bytes_sent(), 600, "only the tail crosses the wire");
}

#[test]
fn completed_sync_reruns_as_noop_with_zero_wire_bytes() {
    let body = vec![0x42u8; 1500];
    let (base, state) = serve(&[("data.bin", body.clone())]);
    let dir = tempfile::tempdir().unwrap();
    let save = dir.path().join("repo");

    let run = || {
        let mut pool = ParallelFetch::new(Fetcher::new(FetcherOptions::default()), 2, None);
        pool.add_item(desc(&base, "data.bin", &save, &body)).unwrap();
        pool.start();
        pool.wait_for_finish()
    };

    let first = run();
    assert_eq!(first.downloads, 1);
    let requests_after_first = state.total_requests();
    let bytes_after_first = state.bytes_sent();

    let second = run();
    assert_eq!(second.successes, 1);
    assert_eq!(second.downloads, 0, "second run is a NOOP");
    assert_eq!(state.total_requests(), requests_after_first);
    assert_eq!(state.bytes_sent(), bytes_after_first);
}

#[test]
fn duplicate_descriptors_serialize_through_the_lock() {
    let body = vec![0x77u8; 4000];
    let (base, _state) = serve(&[("dup.bin", body.clone())]);
    let dir = tempfile::tempdir().unwrap();
    let save = dir.path().join("repo");

    let (callback, reports) = collecting_callback();
    let mut pool = ParallelFetch::new(
        Fetcher::new(FetcherOptions::default()),
        2,
        Some(callback),
    );
    pool.add_item(desc(&base, "dup.bin", &save, &body)).unwrap();
    pool.add_item(desc(&base, "dup.bin", &save, &body)).unwrap();
    pool.start();
    let report = pool.wait_for_finish();

    assert_eq!(report.successes, 2);
    assert_eq!(report.errors, 0);
    assert_eq!(report.downloads, 1, "exactly one worker transfers the content");
    assert_eq!(std::fs::read(save.join("dup.bin")).unwrap(), body);

    // The loser either requeued and then saw a NOOP, or never contended.
    let reports = reports.lock().unwrap();
    let noops = reports
        .iter()
        .filter(|r| matches!(r.status, Some(ReportStatus::Item(FetchStatus::Noop))))
        .count();
    assert_eq!(noops, 1);
}

#[test]
fn no_verify_material_yields_skip_validate() {
    let body = b"anything".to_vec();
    let (base, _state) = serve(&[("blob", body.clone())]);
    let dir = tempfile::tempdir().unwrap();

    let d = FetchDescriptor::new(
        "blob",
        format!("{}/blob", base),
        dir.path().join("repo"),
        ItemType::TreeFile,
    );
    let fetcher = Fetcher::new(FetcherOptions::default());
    let outcome = fetcher.fetch(&d, &NullProgress, &CancelToken::new());
    assert_eq!(outcome.status, FetchStatus::SkipValidate);
    assert_eq!(std::fs::read(d.content_path()).unwrap(), body);
}

#[test]
fn unauthorized_is_surfaced_without_retry() {
    let mut routes = HashMap::new();
    routes.insert("/secret.bin".to_string(), Route::status(401));
    let (base, state) = start(routes);
    let dir = tempfile::tempdir().unwrap();

    let mut d = FetchDescriptor::new(
        "secret.bin",
        format!("{}/secret.bin", base),
        dir.path().join("repo"),
        ItemType::Rpm,
    );
    d.expected_size = Some(10);

    let fetcher = Fetcher::new(FetcherOptions {
        retries: 2,
        ..FetcherOptions::default()
    });
    let outcome = fetcher.fetch(&d, &NullProgress, &CancelToken::new());
    assert_eq!(outcome.status, FetchStatus::Unauthorized);
    assert_eq!(state.request_count("/secret.bin"), 1, "401 is never retried");
    assert!(!d.content_path().exists());
}

#[test]
fn retryable_http_errors_consume_the_budget() {
    let mut routes = HashMap::new();
    routes.insert("/flaky.bin".to_string(), Route::status(503));
    let (base, state) = start(routes);
    let dir = tempfile::tempdir().unwrap();

    let mut d = FetchDescriptor::new(
        "flaky.bin",
        format!("{}/flaky.bin", base),
        dir.path().join("repo"),
        ItemType::Rpm,
    );
    d.expected_size = Some(10);

    let fetcher = Fetcher::new(FetcherOptions {
        retries: 2,
        ..FetcherOptions::default()
    });
    let outcome = fetcher.fetch(&d, &NullProgress, &CancelToken::new());
    assert_eq!(outcome.status, FetchStatus::Error);
    assert_eq!(state.request_count("/flaky.bin"), 3);
}

#[test]
fn stop_mid_flight_leaves_remaining_items_counted() {
    // Bandwidth cap keeps the first transfer slow enough to cancel.
    let body = vec![0x5Au8; 64 * 1024];
    let (base, _state) = serve(&[("slow-a.bin", body.clone()), ("slow-b.bin", body.clone())]);
    let dir = tempfile::tempdir().unwrap();
    let save = dir.path().join("repo");

    let mut pool = ParallelFetch::new(
        Fetcher::new(FetcherOptions {
            max_speed_kb: Some(1),
            retries: 0,
            ..FetcherOptions::default()
        }),
        1,
        None,
    );
    pool.add_item(desc(&base, "slow-a.bin", &save, &body)).unwrap();
    pool.add_item(desc(&base, "slow-b.bin", &save, &body)).unwrap();

    let token = pool.cancel_token();
    pool.start();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(500));
        token.cancel();
    });

    let started = std::time::Instant::now();
    let report = pool.wait_for_finish();
    stopper.join().unwrap();

    assert!(
        started.elapsed() < std::time::Duration::from_secs(30),
        "stop must not wait for the full capped transfer"
    );
    let last = report.last_progress.unwrap();
    assert_eq!(last.items_left, 1, "the never-started item stays counted");
    assert_eq!(report.successes, 0);
}
