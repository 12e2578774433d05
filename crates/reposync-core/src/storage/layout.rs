//! Directory and symlink plumbing shared by workers.
//!
//! Every operation here can race against another worker or a cooperating
//! process; "already exists" is success throughout.

use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

/// Create a directory and its parents, tolerating concurrent creation.
pub fn make_dir_safe(path: &Path) -> Result<()> {
    match std::fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e).with_context(|| format!("create directory {}", path.display())),
    }
}

/// Path of `target` relative to the directory containing `link`.
///
/// Both paths are compared component-wise after dropping root markers, so
/// leading slashes and differing depths behave: the result walks up from the
/// link's parent past the shared prefix, then down into the target.
pub fn relative_path_between(target: &Path, link: &Path) -> PathBuf {
    let target_parts: Vec<&std::ffi::OsStr> = normal_components(target);
    let link_parts: Vec<&std::ffi::OsStr> = normal_components(link);

    let mut shared = 0;
    while shared < target_parts.len()
        && shared + 1 < link_parts.len()
        && target_parts[shared] == link_parts[shared]
    {
        shared += 1;
    }

    let ups = link_parts.len().saturating_sub(1 + shared);
    let mut rel = PathBuf::new();
    for _ in 0..ups {
        rel.push("..");
    }
    for part in &target_parts[shared..] {
        rel.push(part);
    }
    rel
}

fn normal_components(path: &Path) -> Vec<&std::ffi::OsStr> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(p) => Some(p),
            _ => None,
        })
        .collect()
}

/// Publish `link` as a relative symlink to `target`, idempotently.
///
/// A correct pre-existing link is left alone; a wrong one is replaced. Losing
/// a creation race to a worker publishing the same target is success.
#[cfg(unix)]
pub fn publish_symlink(target: &Path, link: &Path) -> Result<()> {
    let rel = relative_path_between(target, link);
    if let Some(parent) = link.parent() {
        make_dir_safe(parent)?;
    }
    for _ in 0..2 {
        match std::os::unix::fs::symlink(&rel, link) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if std::fs::read_link(link).map(|t| t == rel).unwrap_or(false) {
                    return Ok(());
                }
                let _ = std::fs::remove_file(link);
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("symlink {} -> {}", link.display(), rel.display())
                })
            }
        }
    }
    // Two failed replace attempts means a concurrent writer keeps publishing
    // a different target; report the survivor.
    match std::fs::read_link(link) {
        Ok(existing) if existing == rel => Ok(()),
        _ => anyhow::bail!(
            "unable to publish symlink {} -> {}",
            link.display(),
            rel.display()
        ),
    }
}

#[cfg(not(unix))]
pub fn publish_symlink(_target: &Path, _link: &Path) -> Result<()> {
    anyhow::bail!("shared-store symlinks require a unix filesystem")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_shared_prefix() {
        let rel = relative_path_between(
            Path::new("/var/store/pkg/n/1.0/a.rpm"),
            Path::new("/var/repo/label/a.rpm"),
        );
        assert_eq!(rel, PathBuf::from("../../store/pkg/n/1.0/a.rpm"));
    }

    #[test]
    fn relative_path_same_directory() {
        let rel = relative_path_between(Path::new("/a/b/f.bin"), Path::new("/a/b/link.bin"));
        assert_eq!(rel, PathBuf::from("f.bin"));
    }

    #[test]
    fn relative_path_link_deeper_than_target() {
        let rel = relative_path_between(Path::new("/store/f"), Path::new("/a/b/c/d/link"));
        assert_eq!(rel, PathBuf::from("../../../../store/f"));
    }

    #[test]
    fn relative_path_ignores_leading_slash_differences() {
        let rel = relative_path_between(Path::new("store/f"), Path::new("/repo/link"));
        assert_eq!(rel, PathBuf::from("../store/f"));
    }

    #[cfg(unix)]
    #[test]
    fn publish_symlink_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store");
        let repo = dir.path().join("repo");
        make_dir_safe(&store).unwrap();
        std::fs::write(store.join("a.bin"), b"data").unwrap();

        let link = repo.join("a.bin");
        publish_symlink(&store.join("a.bin"), &link).unwrap();
        publish_symlink(&store.join("a.bin"), &link).unwrap();
        assert_eq!(std::fs::read(&link).unwrap(), b"data");
    }

    #[cfg(unix)]
    #[test]
    fn publish_symlink_replaces_wrong_target() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store");
        make_dir_safe(&store).unwrap();
        std::fs::write(store.join("old.bin"), b"old").unwrap();
        std::fs::write(store.join("new.bin"), b"new").unwrap();

        let link = dir.path().join("repo").join("a.bin");
        publish_symlink(&store.join("old.bin"), &link).unwrap();
        publish_symlink(&store.join("new.bin"), &link).unwrap();
        assert_eq!(std::fs::read(&link).unwrap(), b"new");
    }

    #[cfg(unix)]
    #[test]
    fn make_dir_safe_tolerates_existing() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("x/y");
        make_dir_safe(&p).unwrap();
        make_dir_safe(&p).unwrap();
        assert!(p.is_dir());
    }
}
