//! Plain file-repository metadata: the `PULP_MANIFEST` CSV listing.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::checksum::ChecksumType;
use crate::control::CancelToken;
use crate::descriptor::{FetchDescriptor, ItemType};
use crate::driver::MetadataSource;
use crate::fetcher::{Fetcher, NullProgress};

pub const MANIFEST_NAME: &str = "PULP_MANIFEST";

/// Metadata source for plain file repositories: fetches the manifest from
/// the repo root and turns each `relative-name,sha256,size` line into a
/// descriptor.
pub struct FileManifestSource {
    repo_url: String,
    repo_dir: PathBuf,
    /// Content-addressed store; when set, files land there keyed by name and
    /// checksum and the repo dir receives symlinks.
    shared_store: Option<PathBuf>,
}

impl FileManifestSource {
    pub fn new(repo_url: impl Into<String>, repo_dir: impl Into<PathBuf>) -> Self {
        FileManifestSource {
            repo_url: trim_trailing_slash(repo_url.into()),
            repo_dir: repo_dir.into(),
            shared_store: None,
        }
    }

    pub fn with_shared_store(mut self, store: impl Into<PathBuf>) -> Self {
        self.shared_store = Some(store.into());
        self
    }

    fn store_path_for(&self, file_name: &str, checksum: &str) -> Option<PathBuf> {
        let store = self.shared_store.as_ref()?;
        let prefix: String = file_name.chars().take(3).collect();
        Some(store.join(prefix).join(file_name).join(checksum))
    }
}

impl MetadataSource for FileManifestSource {
    fn descriptors(&mut self, fetcher: &Fetcher) -> Result<Vec<FetchDescriptor>> {
        let manifest_desc = FetchDescriptor::new(
            MANIFEST_NAME,
            format!("{}/{}", self.repo_url, MANIFEST_NAME),
            self.repo_dir.clone(),
            ItemType::File,
        );
        let outcome = fetcher.fetch(&manifest_desc, &NullProgress, &CancelToken::new());
        if !outcome.status.is_success() {
            anyhow::bail!(
                "unable to fetch {} from {}: {} {}",
                MANIFEST_NAME,
                self.repo_url,
                outcome.status,
                outcome.detail.unwrap_or_default()
            );
        }

        let manifest_path = self.repo_dir.join(MANIFEST_NAME);
        let body = std::fs::read_to_string(&manifest_path)
            .with_context(|| format!("read {}", manifest_path.display()))?;
        let entries = parse_manifest(&body);
        tracing::info!("{} files have been marked to be fetched", entries.len());

        Ok(entries
            .into_iter()
            .map(|entry| {
                let file_name = entry.base_name().to_string();
                let mut desc = FetchDescriptor::new(
                    file_name.clone(),
                    format!("{}/{}", self.repo_url, entry.relative_name),
                    self.repo_dir.clone(),
                    ItemType::File,
                );
                desc.expected_size = Some(entry.size);
                desc.checksum_type = Some(ChecksumType::Sha256);
                desc.shared_store_path = self.store_path_for(&file_name, &entry.checksum);
                desc.checksum = Some(entry.checksum);
                desc
            })
            .collect())
    }
}

/// One manifest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub relative_name: String,
    pub checksum: String,
    pub size: u64,
}

impl ManifestEntry {
    pub fn base_name(&self) -> &str {
        Path::new(&self.relative_name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.relative_name)
    }
}

/// Parse manifest CSV. Malformed lines are skipped with a warning rather
/// than failing the whole sync.
pub fn parse_manifest(body: &str) -> Vec<ManifestEntry> {
    let mut entries = Vec::new();
    for (lineno, line) in body.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.splitn(3, ',');
        let entry = match (fields.next(), fields.next(), fields.next()) {
            (Some(name), Some(checksum), Some(size)) => {
                match size.trim().parse::<u64>() {
                    Ok(size) if !name.is_empty() && !checksum.is_empty() => Some(ManifestEntry {
                        relative_name: name.trim().to_string(),
                        checksum: checksum.trim().to_string(),
                        size,
                    }),
                    _ => None,
                }
            }
            _ => None,
        };
        match entry {
            Some(e) => entries.push(e),
            None => tracing::warn!(lineno = lineno + 1, line, "skipping malformed manifest line"),
        }
    }
    entries
}

fn trim_trailing_slash(mut url: String) -> String {
    while url.ends_with('/') {
        url.pop();
    }
    url
}
