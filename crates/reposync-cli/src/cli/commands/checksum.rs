//! `reposync checksum`: digest a local file.

use anyhow::Result;
use std::path::Path;

use reposync_core::checksum::{file_checksum, ChecksumType};

pub fn run_checksum(path: &Path, hash_type: &str) -> Result<()> {
    let hashtype: ChecksumType = hash_type.parse()?;
    let digest = file_checksum(hashtype, path)?;
    println!("{}  {}", digest, path.display());
    Ok(())
}
