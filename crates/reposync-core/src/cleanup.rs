//! Post-sync cleanup: orphan purging and keep-N version pruning.

use anyhow::{Context, Result};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Name/version/release/arch parsed from an RPM file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpmName {
    pub name: String,
    pub version: String,
    pub release: String,
    pub arch: String,
}

impl RpmName {
    /// Group key for version pruning.
    pub fn name_arch(&self) -> String {
        format!("{}.{}", self.name, self.arch)
    }
}

/// Parse `name-version-release.arch.rpm`. The name itself may contain
/// dashes, so version and release are taken from the right.
pub fn parse_rpm_filename(file_name: &str) -> Option<RpmName> {
    let stem = file_name.strip_suffix(".rpm")?;
    let (rest, arch) = stem.rsplit_once('.')?;
    let (rest, release) = rest.rsplit_once('-')?;
    let (name, version) = rest.rsplit_once('-')?;
    if name.is_empty() || version.is_empty() || release.is_empty() || arch.is_empty() {
        return None;
    }
    Some(RpmName {
        name: name.to_string(),
        version: version.to_string(),
        release: release.to_string(),
        arch: arch.to_string(),
    })
}

/// rpm-style version segment comparison.
///
/// Splits both strings into maximal numeric or alphabetic segments, skipping
/// separators. Numeric segments compare as integers (leading zeros dropped);
/// a numeric segment outranks an alphabetic one; the string with segments
/// left over wins.
pub fn rpm_vercmp(a: &str, b: &str) -> Ordering {
    let mut a_rest = a;
    let mut b_rest = b;
    loop {
        a_rest = a_rest.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
        b_rest = b_rest.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
        match (a_rest.is_empty(), b_rest.is_empty()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }
        let a_numeric = a_rest.starts_with(|c: char| c.is_ascii_digit());
        let b_numeric = b_rest.starts_with(|c: char| c.is_ascii_digit());
        if a_numeric != b_numeric {
            // Numeric segments sort newer than alphabetic ones.
            return if a_numeric {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }
        let take = |s: &str, numeric: bool| -> usize {
            s.find(|c: char| {
                if numeric {
                    !c.is_ascii_digit()
                } else {
                    !c.is_ascii_alphabetic()
                }
            })
            .unwrap_or(s.len())
        };
        let a_len = take(a_rest, a_numeric);
        let b_len = take(b_rest, b_numeric);
        let (a_seg, b_seg) = (&a_rest[..a_len], &b_rest[..b_len]);
        let cmp = if a_numeric {
            let a_trim = a_seg.trim_start_matches('0');
            let b_trim = b_seg.trim_start_matches('0');
            a_trim
                .len()
                .cmp(&b_trim.len())
                .then_with(|| a_trim.cmp(b_trim))
        } else {
            a_seg.cmp(b_seg)
        };
        if cmp != Ordering::Equal {
            return cmp;
        }
        a_rest = &a_rest[a_len..];
        b_rest = &b_rest[b_len..];
    }
}

/// Compare two packages by (version, release).
pub fn compare_evr(a: &RpmName, b: &RpmName) -> Ordering {
    rpm_vercmp(&a.version, &b.version).then_with(|| rpm_vercmp(&a.release, &b.release))
}

/// Remove `.rpm` files in `dir` that are not in the synced set.
/// Returns the number of files removed.
pub fn purge_orphaned(dir: &Path, keep: &HashSet<String>) -> Result<u64> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in std::fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if !file_name.ends_with(".rpm") {
            continue;
        }
        if !keep.contains(&file_name) {
            tracing::info!(file = %file_name, "removing orphaned package");
            std::fs::remove_file(entry.path())
                .with_context(|| format!("remove {}", entry.path().display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Keep the newest package plus `num_old` older versions per `name.arch`;
/// delete the rest. Returns the number of files removed.
pub fn remove_old_packages(dir: &Path, num_old: u64) -> Result<u64> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut groups: HashMap<String, Vec<(RpmName, std::path::PathBuf)>> = HashMap::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if let Some(parsed) = parse_rpm_filename(&file_name) {
            groups
                .entry(parsed.name_arch())
                .or_default()
                .push((parsed, entry.path()));
        }
    }

    tracing::info!(num_old, "keeping latest package and {} older packages", num_old);
    let mut removed = 0;
    let keep = (num_old as usize) + 1;
    for (_key, mut packages) in groups {
        packages.sort_by(|a, b| compare_evr(&b.0, &a.0));
        for (_parsed, path) in packages.into_iter().skip(keep) {
            tracing::info!(path = %path.display(), "removing old package");
            std::fs::remove_file(&path)
                .with_context(|| format!("remove {}", path.display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}
