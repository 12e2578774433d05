//! One HTTP(S) transfer over a curl easy handle, appending into a
//! `PartialWriter`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::control::CancelToken;
use crate::storage::PartialWriter;

use super::options::FetcherOptions;
use super::FetchProgress;

/// Abort stuck transfers: below this many bytes/s for this long, hang up.
/// Guards against half-open sockets that never send data.
const LOW_SPEED_LIMIT_BYTES: u32 = 1_000;
const LOW_SPEED_TIME: Duration = Duration::from_secs(300);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTIONS: u32 = 10;

#[derive(Debug)]
pub(super) enum TransferError {
    Curl(curl::Error),
    Storage(anyhow::Error),
    /// The cancel token was observed mid-transfer.
    Cancelled,
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Curl(e) => write!(f, "{}", e),
            TransferError::Storage(e) => write!(f, "{:#}", e),
            TransferError::Cancelled => write!(f, "transfer stopped by caller"),
        }
    }
}

pub(super) struct TransferResult {
    pub http_code: u32,
}

/// Download `url` into `writer`, resuming from the writer's offset.
///
/// Progress updates carry `(expected_total, bytes_on_disk)`; when the
/// expected size is unknown the server-advertised length stands in, and the
/// tracker ignores updates until one is known.
pub(super) fn download(
    url: &str,
    expected_size: u64,
    writer: &mut PartialWriter,
    opts: &FetcherOptions,
    progress: &dyn FetchProgress,
    cancel: &CancelToken,
) -> Result<TransferResult, TransferError> {
    let offset = writer.offset();

    let mut easy = curl::easy::Easy::new();
    easy.url(url).map_err(TransferError::Curl)?;
    easy.follow_location(true).map_err(TransferError::Curl)?;
    easy.max_redirections(MAX_REDIRECTIONS)
        .map_err(TransferError::Curl)?;
    easy.connect_timeout(CONNECT_TIMEOUT)
        .map_err(TransferError::Curl)?;
    easy.low_speed_limit(LOW_SPEED_LIMIT_BYTES)
        .map_err(TransferError::Curl)?;
    easy.low_speed_time(LOW_SPEED_TIME)
        .map_err(TransferError::Curl)?;
    if offset > 0 {
        easy.resume_from(offset).map_err(TransferError::Curl)?;
    }
    if let Some(kb) = opts.max_speed_kb {
        easy.max_recv_speed(kb * 1024).map_err(TransferError::Curl)?;
    }

    if let Some(ca) = &opts.tls.ca_cert {
        easy.cainfo(ca).map_err(TransferError::Curl)?;
    }
    if let Some(cert) = &opts.tls.client_cert {
        easy.ssl_cert(cert).map_err(TransferError::Curl)?;
    }
    if let Some(key) = &opts.tls.client_key {
        easy.ssl_key(key).map_err(TransferError::Curl)?;
    }
    if !opts.tls.ssl_verify {
        easy.ssl_verify_peer(false).map_err(TransferError::Curl)?;
    }

    if let Some(proxy) = &opts.proxy {
        easy.proxy(&proxy.url).map_err(TransferError::Curl)?;
        if let Some(port) = proxy.port {
            easy.proxy_port(port).map_err(TransferError::Curl)?;
        }
        if let (Some(user), Some(password)) = (&proxy.user, &proxy.password) {
            let mut auth = curl::easy::Auth::new();
            auth.basic(true);
            easy.proxy_auth(&auth).map_err(TransferError::Curl)?;
            easy.proxy_username(user).map_err(TransferError::Curl)?;
            easy.proxy_password(password).map_err(TransferError::Curl)?;
        }
    }

    easy.progress(true).map_err(TransferError::Curl)?;

    // Shared between the write and progress callbacks.
    let advertised_total = Arc::new(AtomicU64::new(expected_size));
    let storage_error: Arc<Mutex<Option<anyhow::Error>>> = Arc::new(Mutex::new(None));

    let perform_result = {
        let advertised_in_progress = Arc::clone(&advertised_total);
        let storage_error_cb = Arc::clone(&storage_error);
        let cancel = cancel.clone();
        let writer_cell = Mutex::new(&mut *writer);

        let mut transfer = easy.transfer();
        transfer
            .progress_function(move |dltotal, _dlnow, _ultotal, _ulnow| {
                if cancel.is_cancelled() {
                    return false;
                }
                if expected_size == 0 && dltotal > 0.0 {
                    advertised_in_progress.store(offset + dltotal as u64, Ordering::Relaxed);
                }
                true
            })
            .map_err(TransferError::Curl)?;
        transfer
            .write_function(move |data| {
                let mut w = writer_cell.lock().unwrap();
                match w.write(data) {
                    Ok(()) => {
                        let total = advertised_total.load(Ordering::Relaxed);
                        progress.update(url, total, w.offset());
                        Ok(data.len())
                    }
                    Err(e) => {
                        tracing::warn!(url, "write failed mid-transfer: {:#}", e);
                        let _ = storage_error_cb.lock().unwrap().replace(e);
                        Ok(0) // abort transfer
                    }
                }
            })
            .map_err(TransferError::Curl)?;
        transfer.perform()
    };

    if let Err(e) = perform_result {
        if e.is_aborted_by_callback() && cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if e.is_write_error() {
            if let Some(io_err) = storage_error.lock().unwrap().take() {
                return Err(TransferError::Storage(io_err));
            }
        }
        return Err(TransferError::Curl(e));
    }

    let http_code = easy.response_code().map_err(TransferError::Curl)?;
    Ok(TransferResult { http_code })
}
