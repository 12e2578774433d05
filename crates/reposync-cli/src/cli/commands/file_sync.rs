//! `reposync file`: mirror a plain file repository.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use reposync_core::child::HostCommand;
use reposync_core::config;
use reposync_core::control::CancelToken;
use reposync_core::driver::{DriverOptions, SyncDriver};
use reposync_core::fetcher::{FetcherOptions, ProxyConfig, TlsConfig, VerifyOptions};
use reposync_core::manifest::FileManifestSource;
use reposync_core::progress::ProgressReport;

use crate::cli::TransferArgs;

pub fn run_file_sync(
    url: &str,
    label: &str,
    basedir: Option<PathBuf>,
    shared_store: Option<PathBuf>,
    transfer: &TransferArgs,
) -> Result<()> {
    let cfg = config::load_or_init()?;
    tracing::debug!("loaded config: {:?}", cfg);
    let basedir = match basedir {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolve current directory")?,
    };

    let cancel = CancelToken::new();
    install_sigint_handler(cancel.clone());

    let opts = DriverOptions {
        fetcher: fetcher_options(&cfg, transfer),
        parallelism: transfer.parallel.unwrap_or(cfg.parallel),
        callback: Some(Arc::new(|report: &ProgressReport| {
            tracing::debug!("{}", report);
        })),
        isolate: isolation_host(transfer)?,
        purge_orphaned: cfg.purge_orphaned,
        remove_old: cfg.remove_old.then_some(cfg.num_old_packages),
        cancel: cancel.clone(),
    };

    let driver = SyncDriver::new(basedir, label, opts);
    let mut source = FileManifestSource::new(url, driver.repo_dir());
    if let Some(store) = shared_store {
        source = source.with_shared_store(store);
    }

    let report = driver.sync(&mut source).map_err(anyhow::Error::from)?;
    if cancel.is_cancelled() {
        println!("{}: sync cancelled, {}", label, report);
    } else {
        println!("{}: {}", label, report);
    }
    Ok(())
}

fn fetcher_options(cfg: &config::SyncConfig, transfer: &TransferArgs) -> FetcherOptions {
    let proxy = transfer.proxy_url.as_ref().map(|url| ProxyConfig {
        url: url.clone(),
        port: transfer.proxy_port,
        user: transfer.proxy_user.clone(),
        password: transfer.proxy_pass.clone(),
    });
    let verify = if transfer.verify_size_only {
        VerifyOptions {
            size: true,
            checksum: false,
        }
    } else if transfer.verify_checksum_only {
        VerifyOptions {
            size: false,
            checksum: true,
        }
    } else {
        VerifyOptions {
            size: cfg.verify_size,
            checksum: cfg.verify_checksum,
        }
    };
    FetcherOptions {
        max_speed_kb: transfer.max_speed.or(cfg.max_speed_kb),
        retries: transfer.retries.unwrap_or(cfg.retries),
        proxy,
        tls: TlsConfig {
            ca_cert: transfer.cacert.clone(),
            client_cert: transfer.cert.clone(),
            client_key: transfer.key.clone(),
            ssl_verify: !transfer.no_ssl_verify,
        },
        verify,
        force: false,
    }
}

/// Host command for `--isolate`: this binary's hidden fetch-host subcommand.
fn isolation_host(transfer: &TransferArgs) -> Result<Option<HostCommand>> {
    if !transfer.isolate {
        return Ok(None);
    }
    let exe = std::env::current_exe().context("resolve reposync binary path")?;
    Ok(Some(HostCommand::new(exe, vec!["fetch-host".to_string()])))
}

/// First SIGINT winds the sync down gracefully; a second force-quits.
fn install_sigint_handler(cancel: CancelToken) {
    let hits = AtomicUsize::new(0);
    if let Err(e) = ctrlc::set_handler(move || {
        if hits.fetch_add(1, Ordering::SeqCst) == 0 {
            eprintln!("interrupt received, finishing in-flight items (interrupt again to force quit)");
            cancel.cancel();
        } else {
            eprintln!("force quitting");
            std::process::exit(1);
        }
    }) {
        tracing::warn!("unable to install interrupt handler: {}", e);
    }
}
