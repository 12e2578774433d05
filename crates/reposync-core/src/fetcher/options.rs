//! Caller-supplied transfer configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::SyncError;

/// HTTP proxy settings. `validate` enforces the pairings the transfer layer
/// relies on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub url: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.url.is_empty() {
            return Err(SyncError::Config("proxy url is empty".into()));
        }
        if self.port.is_none() {
            return Err(SyncError::Config(
                "proxy url is defined, but no port was specified".into(),
            ));
        }
        if self.user.is_some() && self.password.is_none() {
            return Err(SyncError::Config(
                "proxy username is defined, but no password was specified".into(),
            ));
        }
        Ok(())
    }
}

/// TLS client material for protected repositories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub ssl_verify: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            ca_cert: None,
            client_cert: None,
            client_key: None,
            ssl_verify: true,
        }
    }
}

impl TlsConfig {
    pub fn validate(&self) -> Result<(), SyncError> {
        for path in [&self.ca_cert, &self.client_cert, &self.client_key]
            .into_iter()
            .flatten()
        {
            if !path.is_file() {
                return Err(SyncError::Config(format!(
                    "credential file {} is not readable",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Which checks to run against a file already on disk. The post-download
/// verification is always full regardless of these flags.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VerifyOptions {
    pub size: bool,
    pub checksum: bool,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        VerifyOptions {
            size: true,
            checksum: true,
        }
    }
}

/// Everything a fetcher needs beyond the descriptor itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherOptions {
    /// Download rate cap in KB/s.
    pub max_speed_kb: Option<u64>,
    /// Retry budget per descriptor.
    pub retries: u32,
    pub proxy: Option<ProxyConfig>,
    pub tls: TlsConfig,
    pub verify: VerifyOptions,
    /// Re-download even when the file on disk verifies.
    pub force: bool,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        FetcherOptions {
            max_speed_kb: None,
            retries: 2,
            proxy: None,
            tls: TlsConfig::default(),
            verify: VerifyOptions::default(),
            force: false,
        }
    }
}

impl FetcherOptions {
    /// Synchronous configuration check; fatal for the sync when it fails.
    pub fn validate(&self) -> Result<(), SyncError> {
        if let Some(proxy) = &self.proxy {
            proxy.validate()?;
        }
        self.tls.validate()
    }
}
