use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Per-stream state shared between a [`StagedWriter`] and its [`FileHandle`].
///
/// Revocation is one-way: once flipped, the writer refuses further writes.
#[derive(Debug, Default)]
struct StreamState {
    revoked: AtomicBool,
}

impl StreamState {
    fn revoke(&self) {
        self.revoked.store(true, Ordering::Release);
    }

    fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }
}

/// Tracked state for one staging file: its path, the set of currently open
/// write streams, and the deletability flag.
///
/// Owned by the manager's registry; callers interact through [`StagedFile`].
#[derive(Debug)]
pub(crate) struct FileHandle {
    path: PathBuf,
    streams: Mutex<HashMap<Uuid, Arc<StreamState>>>,
    deletable: AtomicBool,
}

impl FileHandle {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            streams: Mutex::new(HashMap::new()),
            deletable: AtomicBool::new(false),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// One-way transition; never reset to false.
    pub(crate) fn mark_deletable(&self) {
        self.deletable.store(true, Ordering::Release);
    }

    pub(crate) fn is_deletable(&self) -> bool {
        self.deletable.load(Ordering::Acquire)
    }

    pub(crate) fn open_streams(&self) -> usize {
        self.lock_streams().len()
    }

    /// Revoke and forget every tracked stream, returning how many were open.
    ///
    /// Writers observe the revocation on their next write and fail with
    /// `BrokenPipe`; their eventual drop is a no-op on the accounting set.
    pub(crate) fn close_all_streams(&self) -> usize {
        let mut streams = self.lock_streams();
        for state in streams.values() {
            state.revoke();
        }
        let revoked = streams.len();
        streams.clear();
        revoked
    }

    fn register_stream(&self, id: Uuid, state: Arc<StreamState>) {
        self.lock_streams().insert(id, state);
    }

    fn deregister_stream(&self, id: Uuid) {
        self.lock_streams().remove(&id);
    }

    fn lock_streams(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<StreamState>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Caller-facing capability for one staged upload file.
///
/// Clones refer to the same tracked file. Dropping a `StagedFile` deletes
/// nothing; reclamation happens through the manager's sweeps once the file is
/// marked releasable (or its eligibility delay elapses).
#[derive(Clone, Debug)]
pub struct StagedFile {
    inner: Arc<FileHandle>,
}

impl StagedFile {
    pub(crate) fn new(inner: Arc<FileHandle>) -> Self {
        Self { inner }
    }

    /// On-disk location, for handlers that move the finished upload elsewhere
    /// before reclamation occurs.
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Number of write streams currently tracked as open.
    pub fn open_streams(&self) -> usize {
        self.inner.open_streams()
    }

    /// Whether the file is eligible for reclamation on the next sweep.
    pub fn is_releasable(&self) -> bool {
        self.inner.is_deletable()
    }

    /// Open a scoped write stream over the staging file.
    ///
    /// The stream is tracked on the handle until the returned writer is closed
    /// or dropped, whichever comes first.
    pub async fn open_for_write(&self) -> io::Result<StagedWriter> {
        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(self.inner.path())
            .await?;

        let id = Uuid::new_v4();
        let state = Arc::new(StreamState::default());
        self.inner.register_stream(id, Arc::clone(&state));

        Ok(StagedWriter {
            file,
            id,
            state,
            handle: Arc::clone(&self.inner),
        })
    }

    /// Irrevocably signal that this file should be reclaimed as soon as
    /// possible.
    ///
    /// Any streams still tracked at this point are revoked: a caller that
    /// requests deletion while holding a stream is declaring that stream
    /// invalid.
    pub fn mark_releasable(&self) {
        let revoked = self.inner.close_all_streams();
        self.inner.mark_deletable();
        if revoked > 0 {
            tracing::debug!(
                path = %self.inner.path().display(),
                streams = revoked,
                "Revoked open write streams on release"
            );
        }
    }
}

/// Scoped write stream over a staging file.
///
/// Deregisters itself from the owning handle on close *and* on drop, so the
/// handle's stream accounting converges no matter how the write scope exits.
#[derive(Debug)]
pub struct StagedWriter {
    file: tokio::fs::File,
    id: Uuid,
    state: Arc<StreamState>,
    handle: Arc<FileHandle>,
}

impl StagedWriter {
    /// Flush and close the stream.
    ///
    /// A failed close is logged and swallowed; the stream is deregistered
    /// either way.
    pub async fn close(mut self) {
        if let Err(error) = self.file.shutdown().await {
            tracing::warn!(
                path = %self.handle.path().display(),
                %error,
                "Staging stream failed to close cleanly"
            );
        }
        // Drop deregisters the stream id.
    }
}

impl AsyncWrite for StagedWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.state.is_revoked() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "staging stream was revoked",
            )));
        }
        Pin::new(&mut this.file).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_shutdown(cx)
    }
}

impl Drop for StagedWriter {
    fn drop(&mut self) {
        self.handle.deregister_stream(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    async fn staged_file_in(dir: &TempDir) -> StagedFile {
        let path = dir.path().join("staged.tmp");
        tokio::fs::write(&path, b"").await.unwrap();
        StagedFile::new(Arc::new(FileHandle::new(path)))
    }

    #[tokio::test]
    async fn test_stream_accounting_net_zero() {
        let dir = TempDir::new().unwrap();
        let staged = staged_file_in(&dir).await;
        assert_eq!(staged.open_streams(), 0);

        let mut writer = staged.open_for_write().await.unwrap();
        assert_eq!(staged.open_streams(), 1);

        writer.write_all(b"payload").await.unwrap();
        writer.close().await;
        assert_eq!(staged.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_drop_without_close_deregisters() {
        let dir = TempDir::new().unwrap();
        let staged = staged_file_in(&dir).await;

        let writer = staged.open_for_write().await.unwrap();
        assert_eq!(staged.open_streams(), 1);
        drop(writer);
        assert_eq!(staged.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_mark_releasable_revokes_open_streams() {
        let dir = TempDir::new().unwrap();
        let staged = staged_file_in(&dir).await;

        let mut writer = staged.open_for_write().await.unwrap();
        staged.mark_releasable();

        assert!(staged.is_releasable());
        assert_eq!(staged.open_streams(), 0);

        let err = writer.write_all(b"late write").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);

        // Dropping the revoked writer must not disturb accounting
        drop(writer);
        assert_eq!(staged.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_multiple_streams_tracked_independently() {
        let dir = TempDir::new().unwrap();
        let staged = staged_file_in(&dir).await;

        let first = staged.open_for_write().await.unwrap();
        let second = staged.open_for_write().await.unwrap();
        assert_eq!(staged.open_streams(), 2);

        first.close().await;
        assert_eq!(staged.open_streams(), 1);
        second.close().await;
        assert_eq!(staged.open_streams(), 0);
    }
}
