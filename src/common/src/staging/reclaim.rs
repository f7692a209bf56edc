//! Best-effort deletion of staged files.
//!
//! Deletion can fail transiently while a writer is still draining OS-level
//! buffers, so reclamation probes an advisory lock first and treats every
//! failure as retryable: a failed attempt is logged and the handle stays
//! registered for the next sweep.

use std::io;
use std::path::Path;

use super::handle::FileHandle;

/// Outcome of the advisory-lock probe on a staging file.
#[derive(Debug)]
enum LockProbe {
    /// Exclusive lock was acquired (and released again).
    Available,
    /// Another holder has the lock.
    Busy,
    /// The platform has no advisory locks.
    Unsupported,
    /// The probe itself failed.
    Failed(io::Error),
}

/// Attempt to delete the file behind `handle`.
///
/// Returns true when the backing file no longer exists afterwards. Never
/// returns an error: every failure mode is logged and reported as `false` so
/// the sweep worker can retry on a later pass.
pub(super) async fn reclaim(handle: &FileHandle) -> bool {
    let revoked = handle.close_all_streams();
    if revoked > 0 {
        tracing::debug!(
            path = %handle.path().display(),
            streams = revoked,
            "Revoked lingering write streams before reclaim"
        );
    }

    let path = handle.path();
    match probe_exclusive_lock(path) {
        LockProbe::Available | LockProbe::Unsupported => {}
        LockProbe::Busy => {
            // Advisory locks are cooperative; a busy probe does not prove the
            // file is unusable, so fall through to a direct delete attempt.
            tracing::debug!(
                path = %path.display(),
                "Advisory lock busy, attempting delete anyway"
            );
        }
        LockProbe::Failed(error) => {
            tracing::debug!(
                path = %path.display(),
                %error,
                "Advisory lock probe failed, attempting delete anyway"
            );
        }
    }

    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "Reclaimed staging file");
            true
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            // Already moved or deleted out from under us; nothing left to track.
            tracing::debug!(path = %path.display(), "Staging file already gone");
            true
        }
        Err(error) => {
            tracing::warn!(
                path = %path.display(),
                %error,
                "Failed to reclaim staging file, will retry on next sweep"
            );
            false
        }
    }
}

/// Probe whether an exclusive advisory lock on `path` is obtainable.
///
/// The lock is released before returning; the probe only answers "does the
/// file look in use", it never guards the delete.
fn probe_exclusive_lock(path: &Path) -> LockProbe {
    #[cfg(unix)]
    {
        use std::fs::OpenOptions;
        use std::os::unix::io::AsRawFd;

        let file = match OpenOptions::new().write(true).open(path) {
            Ok(file) => file,
            Err(error) => return LockProbe::Failed(error),
        };
        // SAFETY: `file` is a valid open descriptor that outlives the call,
        // and `LOCK_EX | LOCK_NB` is a valid non-blocking flock request.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            // Dropping `file` closes the descriptor and releases the lock.
            return LockProbe::Available;
        }
        let error = io::Error::last_os_error();
        if error.kind() == io::ErrorKind::WouldBlock {
            LockProbe::Busy
        } else if error.raw_os_error() == Some(libc::ENOTSUP) {
            // Some network filesystems reject flock outright
            LockProbe::Unsupported
        } else {
            LockProbe::Failed(error)
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        LockProbe::Unsupported
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reclaim_deletes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("staged.tmp");
        tokio::fs::write(&path, b"data").await.unwrap();

        let handle = FileHandle::new(path.clone());
        assert!(reclaim(&handle).await);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_reclaim_reports_success_for_missing_file() {
        let dir = TempDir::new().unwrap();
        let handle = FileHandle::new(dir.path().join("moved-away.tmp"));

        // A handler that renamed the upload out of staging leaves nothing
        // behind; that still counts as reclaimed.
        assert!(reclaim(&handle).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reclaim_falls_through_when_lock_is_held() {
        use std::os::unix::io::AsRawFd;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locked.tmp");
        tokio::fs::write(&path, b"data").await.unwrap();

        let holder = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap();
        let rc = unsafe { libc::flock(holder.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        assert_eq!(rc, 0);

        // Unix unlink succeeds regardless of the advisory lock, so the
        // fall-through path still reclaims.
        let handle = FileHandle::new(path.clone());
        assert!(reclaim(&handle).await);
        assert!(!path.exists());
        drop(holder);
    }

    #[cfg(unix)]
    #[test]
    fn test_probe_classifies_held_lock_as_busy() {
        use std::os::unix::io::AsRawFd;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("probe.tmp");
        std::fs::write(&path, b"data").unwrap();

        assert!(matches!(probe_exclusive_lock(&path), LockProbe::Available));

        let holder = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap();
        let rc = unsafe { libc::flock(holder.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        assert_eq!(rc, 0);

        assert!(matches!(probe_exclusive_lock(&path), LockProbe::Busy));
        drop(holder);
    }

    #[test]
    fn test_probe_reports_failure_for_missing_file() {
        let dir = TempDir::new().unwrap();
        let probe = probe_exclusive_lock(&dir.path().join("absent.tmp"));
        #[cfg(unix)]
        assert!(matches!(probe, LockProbe::Failed(_)));
        #[cfg(not(unix))]
        assert!(matches!(probe, LockProbe::Unsupported));
    }
}
