//! Checksum verification of fetched content.
//!
//! Digests are computed in chunks so large packages never sit in memory.

use anyhow::{Context, Result};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

const BUF_SIZE: usize = 64 * 1024;

/// Digest algorithms advertised by repository metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumType::Md5 => "md5",
            ChecksumType::Sha1 => "sha1",
            ChecksumType::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumType {
    type Err = anyhow::Error;

    /// Accepts the aliases seen in the wild; `sha` means sha1 in old repomd.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(ChecksumType::Md5),
            "sha" | "sha1" => Ok(ChecksumType::Sha1),
            "sha256" => Ok(ChecksumType::Sha256),
            other => anyhow::bail!("unknown checksum type: {}", other),
        }
    }
}

/// Compute the digest of a file and return it as lowercase hex.
pub fn file_checksum(hashtype: ChecksumType, path: &Path) -> Result<String> {
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    match hashtype {
        ChecksumType::Md5 => digest_reader::<Md5>(&mut f, path),
        ChecksumType::Sha1 => digest_reader::<Sha1>(&mut f, path),
        ChecksumType::Sha256 => digest_reader::<Sha256>(&mut f, path),
    }
}

fn digest_reader<D: Digest>(f: &mut File, path: &Path) -> Result<String> {
    let mut hasher = D::new();
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = f
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// True iff the file's digest matches `expected` (case-insensitive hex).
pub fn verify_file(hashtype: ChecksumType, path: &Path, expected: &str) -> Result<bool> {
    let actual = file_checksum(hashtype, path)?;
    Ok(actual.eq_ignore_ascii_case(expected))
}
