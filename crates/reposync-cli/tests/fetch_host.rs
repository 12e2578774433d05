//! End-to-end check of the hidden `fetch-host` subcommand: a real child
//! process serving fetch RPC over stdio.

use reposync_core::child::{ChildProcess, FetchCall, FetchEvent, FetchService, HostCommand};
use reposync_core::descriptor::{FetchDescriptor, FetchStatus, ItemType};
use reposync_core::fetcher::FetcherOptions;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn host_command() -> HostCommand {
    HostCommand::new(env!("CARGO_BIN_EXE_reposync"), vec!["fetch-host".to_string()])
}

#[test]
fn isolated_fetch_through_real_subprocess() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("remote");
    std::fs::create_dir_all(&src).unwrap();
    let body: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
    std::fs::write(src.join("pkg.bin"), &body).unwrap();

    let mut desc = FetchDescriptor::new(
        "pkg.bin",
        format!("file://{}", src.join("pkg.bin").display()),
        dir.path().join("repo"),
        ItemType::File,
    );
    desc.expected_size = Some(body.len() as u64);

    let progressed = Arc::new(AtomicU64::new(0));
    let hook = Arc::clone(&progressed);
    let client = ChildProcess::spawn(
        FetchService::new(FetcherOptions::default()),
        host_command(),
        move |event: &FetchEvent| {
            if let FetchEvent::Progress { downloaded, .. } = event {
                hook.store(*downloaded, Ordering::SeqCst);
            }
        },
    );

    let outcome = client.call(FetchCall::Fetch(desc.clone())).unwrap();
    assert_eq!(outcome.status, FetchStatus::Downloaded, "{:?}", outcome.detail);
    assert_eq!(std::fs::read(desc.repo_path()).unwrap(), body);
    assert_eq!(progressed.load(Ordering::SeqCst), body.len() as u64);

    // Second call over the same child: the pre-check sees the file and NOOPs.
    let outcome = client.call(FetchCall::Fetch(desc)).unwrap();
    assert_eq!(outcome.status, FetchStatus::Noop);
}

#[test]
fn abort_kills_the_subprocess_and_fails_the_call() {
    let client = ChildProcess::spawn(
        FetchService::new(FetcherOptions::default()),
        host_command(),
        |_e: &FetchEvent| {},
    );
    // Prime the connection so there is a live child to kill.
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("remote");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("a.bin"), b"x").unwrap();
    let desc = FetchDescriptor::new(
        "a.bin",
        format!("file://{}", src.join("a.bin").display()),
        dir.path().join("repo"),
        ItemType::File,
    );
    client.call(FetchCall::Fetch(desc.clone())).unwrap();

    client.abort();
    assert!(client.call(FetchCall::Fetch(desc)).is_err());
}
