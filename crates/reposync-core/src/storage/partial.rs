//! Append-only staged writer with resume support.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Staging path for a download target (`<path>.part`).
pub fn part_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    final_path.with_file_name(name)
}

/// Dumb append sink for one download, staged at `<path>.part`.
///
/// If a part file already exists its length becomes the starting offset so
/// the transfer can resume with a range request. Checksumming is not this
/// type's job; the fetcher verifies after `commit`.
pub struct PartialWriter {
    file: File,
    part_path: PathBuf,
    final_path: PathBuf,
    offset: u64,
}

impl PartialWriter {
    pub fn open(final_path: &Path) -> Result<Self> {
        let part_path = part_path_for(final_path);
        let offset = match std::fs::metadata(&part_path) {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if offset > 0 {
            tracing::debug!(path = %part_path.display(), offset, "partial file exists, resuming");
        }
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&part_path)
            .with_context(|| format!("open partial file {}", part_path.display()))?;
        Ok(PartialWriter {
            file,
            part_path,
            final_path: final_path.to_path_buf(),
            offset,
        })
    }

    /// Bytes already staged on disk.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.file
            .write_all(chunk)
            .with_context(|| format!("write to {}", self.part_path.display()))?;
        self.offset += chunk.len() as u64;
        Ok(())
    }

    /// Atomically rename the part file to the final path.
    pub fn commit(self) -> Result<()> {
        let PartialWriter {
            file,
            part_path,
            final_path,
            ..
        } = self;
        drop(file);
        std::fs::rename(&part_path, &final_path).with_context(|| {
            format!(
                "rename {} to {}",
                part_path.display(),
                final_path.display()
            )
        })?;
        Ok(())
    }

    /// Remove the part file (used before a retry from scratch).
    pub fn discard(self) -> Result<()> {
        let PartialWriter {
            file, part_path, ..
        } = self;
        drop(file);
        match std::fs::remove_file(&part_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", part_path.display())),
        }
    }
}
