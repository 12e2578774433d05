//! CLI for the reposync repository mirror.

mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use commands::{run_checksum, run_fetch_host, run_file_sync};

/// Top-level CLI for the reposync repository mirror.
#[derive(Debug, Parser)]
#[command(name = "reposync")]
#[command(about = "reposync: parallel content mirror for package repositories", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

/// Transfer flags shared by sync subcommands.
#[derive(Debug, Clone, Args)]
pub struct TransferArgs {
    /// Worker threads (default from config).
    #[arg(long, value_name = "N")]
    pub parallel: Option<usize>,

    /// Bandwidth cap in KB/s.
    #[arg(long, value_name = "KBPS")]
    pub max_speed: Option<u64>,

    /// Retry budget per item.
    #[arg(long, value_name = "N")]
    pub retries: Option<u32>,

    /// HTTP proxy URL (requires --proxy-port).
    #[arg(long)]
    pub proxy_url: Option<String>,

    /// HTTP proxy port.
    #[arg(long)]
    pub proxy_port: Option<u16>,

    /// Proxy username (requires --proxy-pass).
    #[arg(long)]
    pub proxy_user: Option<String>,

    /// Proxy password.
    #[arg(long)]
    pub proxy_pass: Option<String>,

    /// CA certificate for TLS verification.
    #[arg(long, value_name = "PEM")]
    pub cacert: Option<PathBuf>,

    /// TLS client certificate.
    #[arg(long, value_name = "PEM")]
    pub cert: Option<PathBuf>,

    /// TLS client key.
    #[arg(long, value_name = "PEM")]
    pub key: Option<PathBuf>,

    /// Skip TLS peer verification.
    #[arg(long)]
    pub no_ssl_verify: bool,

    /// Trust the size of pre-existing files without checksumming them.
    #[arg(long, conflicts_with = "verify_size_only")]
    pub verify_checksum_only: bool,

    /// Checksum pre-existing files but ignore advertised sizes.
    #[arg(long)]
    pub verify_size_only: bool,

    /// Run each worker's transfers in an isolated host subprocess.
    #[arg(long)]
    pub isolate: bool,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Mirror a plain file repository published with a PULP_MANIFEST.
    File {
        /// Repository base URL.
        url: String,
        /// Repo label; files land under <basedir>/<label>/.
        label: String,
        /// Destination base directory (default: current directory).
        #[arg(long, value_name = "DIR")]
        basedir: Option<PathBuf>,
        /// Content-addressed store; repo dirs get symlinks into it.
        #[arg(long, value_name = "DIR")]
        shared_store: Option<PathBuf>,
        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Compute a file's checksum (sha256 by default).
    Checksum {
        /// Path to the file.
        path: PathBuf,
        /// Digest type: md5, sha1, or sha256.
        #[arg(long, default_value = "sha256")]
        hash_type: String,
    },

    /// Internal: serve fetch RPC over stdio for --isolate workers.
    #[command(hide = true)]
    FetchHost,
}

impl CliCommand {
    pub fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        match cli.command {
            CliCommand::File {
                url,
                label,
                basedir,
                shared_store,
                transfer,
            } => run_file_sync(&url, &label, basedir, shared_store, &transfer),
            CliCommand::Checksum { path, hash_type } => run_checksum(&path, &hash_type),
            CliCommand::FetchHost => run_fetch_host(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_sync_with_flags() {
        let cli = Cli::try_parse_from([
            "reposync",
            "file",
            "http://host/repo",
            "myrepo",
            "--basedir",
            "/srv/mirror",
            "--parallel",
            "8",
            "--max-speed",
            "512",
            "--no-ssl-verify",
        ])
        .unwrap();
        match cli.command {
            CliCommand::File {
                url,
                label,
                basedir,
                transfer,
                ..
            } => {
                assert_eq!(url, "http://host/repo");
                assert_eq!(label, "myrepo");
                assert_eq!(basedir.unwrap(), PathBuf::from("/srv/mirror"));
                assert_eq!(transfer.parallel, Some(8));
                assert_eq!(transfer.max_speed, Some(512));
                assert!(transfer.no_ssl_verify);
                assert!(!transfer.isolate);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn verify_flags_conflict() {
        let err = Cli::try_parse_from([
            "reposync",
            "file",
            "http://host/repo",
            "r",
            "--verify-size-only",
            "--verify-checksum-only",
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn parses_checksum_default_type() {
        let cli = Cli::try_parse_from(["reposync", "checksum", "/tmp/f.bin"]).unwrap();
        match cli.command {
            CliCommand::Checksum { path, hash_type } => {
                assert_eq!(path, PathBuf::from("/tmp/f.bin"));
                assert_eq!(hash_type, "sha256");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn fetch_host_is_parseable() {
        let cli = Cli::try_parse_from(["reposync", "fetch-host"]).unwrap();
        assert!(matches!(cli.command, CliCommand::FetchHost));
    }
}
