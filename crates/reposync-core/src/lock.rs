//! Advisory per-path write lock with PID liveness.
//!
//! A sidecar `<path>.lock` file carries an exclusive `flock(2)` and the
//! holder's PID. Cooperating processes on the same filesystem observe a live
//! holder and requeue instead of double-downloading; a dead holder's lock is
//! reclaimed.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Result of a lock attempt.
pub enum LockState {
    Acquired(PathLock),
    /// A live process (possibly this one, via another worker) holds the lock.
    HeldBy(u32),
}

/// An acquired path lock. Released (and the sidecar unlinked) on drop.
pub struct PathLock {
    file: Option<File>,
    lock_path: PathBuf,
}

/// Sidecar lock file path for a download target.
pub fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}

/// PID recorded in the sidecar, if the file exists and parses.
pub fn read_holder(target: &Path) -> Option<u32> {
    let mut buf = String::new();
    File::open(lock_path_for(target))
        .ok()?
        .read_to_string(&mut buf)
        .ok()?;
    buf.trim().parse().ok()
}

/// True iff the OS reports `pid` as live. EPERM counts as live: the process
/// exists, we just may not signal it.
#[cfg(unix)]
pub fn pid_is_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_is_alive(_pid: u32) -> bool {
    false
}

impl PathLock {
    /// Try to lock `target`. Returns `HeldBy` without blocking when another
    /// live holder exists; reclaims locks left behind by dead processes.
    pub fn acquire(target: &Path) -> Result<LockState> {
        let our_pid = std::process::id();
        if let Some(holder) = read_holder(target) {
            if holder != our_pid && pid_is_alive(holder) {
                tracing::debug!(holder, path = %target.display(), "lock held by live process");
                return Ok(LockState::HeldBy(holder));
            }
        }

        let lock_path = lock_path_for(target);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("open lock file {}", lock_path.display()))?;

        if !flock_exclusive_nonblocking(&file)? {
            // Lost the race; whoever won may not have written its PID yet.
            let holder = read_holder(target).unwrap_or(our_pid);
            return Ok(LockState::HeldBy(holder));
        }

        file.set_len(0).context("truncate lock file")?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", our_pid).context("write pid to lock file")?;
        file.sync_data().ok();

        Ok(LockState::Acquired(PathLock {
            file: Some(file),
            lock_path,
        }))
    }

    /// Drop the OS lock, close, and unlink the sidecar.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(file) = self.file.take() {
            #[cfg(unix)]
            unsafe {
                libc::flock(file.as_raw_fd(), libc::LOCK_UN);
            }
            drop(file);
            if let Err(e) = std::fs::remove_file(&self.lock_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.lock_path.display(), "unable to remove lock file: {}", e);
                }
            }
        }
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(unix)]
fn flock_exclusive_nonblocking(file: &File) -> Result<bool> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err).context("flock")
}

#[cfg(not(unix))]
fn flock_exclusive_nonblocking(_file: &File) -> Result<bool> {
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_pid_and_release_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("pkg.rpm");
        let lock = match PathLock::acquire(&target).unwrap() {
            LockState::Acquired(l) => l,
            LockState::HeldBy(p) => panic!("unexpectedly held by {}", p),
        };
        assert_eq!(read_holder(&target), Some(std::process::id()));
        lock.release();
        assert!(!lock_path_for(&target).exists());
    }

    #[test]
    fn second_acquire_in_same_process_observes_holder() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("pkg.rpm");
        let _lock = match PathLock::acquire(&target).unwrap() {
            LockState::Acquired(l) => l,
            LockState::HeldBy(_) => panic!("should acquire"),
        };
        match PathLock::acquire(&target).unwrap() {
            LockState::Acquired(_) => panic!("should be held"),
            LockState::HeldBy(pid) => assert_eq!(pid, std::process::id()),
        }
    }

    #[test]
    fn stale_lock_from_dead_process_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("pkg.rpm");
        // Fabricate a lock file naming a PID that cannot be running.
        std::fs::write(lock_path_for(&target), "4194399\n").unwrap();
        match PathLock::acquire(&target).unwrap() {
            LockState::Acquired(_) => {}
            LockState::HeldBy(p) => panic!("stale lock not reclaimed, held by {}", p),
        }
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_is_alive(std::process::id()));
    }
}
