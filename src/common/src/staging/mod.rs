//! Temporary-file lifecycle management for upload staging.
//!
//! Incoming uploads are streamed into staging files allocated here. Each file
//! is tracked in a registry together with its open write streams and a
//! one-way "deletable" flag. A single background worker sweeps the registry
//! and reclaims eligible files from disk; reclamation is best-effort and a
//! failed delete is simply retried on a later sweep. Producers never delete
//! staging files themselves.

mod handle;
mod reclaim;

pub use handle::{StagedFile, StagedWriter};

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;

use handle::FileHandle;

/// Filename prefix for staged files.
const STAGING_PREFIX: &str = "upload-";

/// Suffix used when the caller's filename hint carries no extension.
const DEFAULT_SUFFIX: &str = ".tmp";

/// Configuration for the staging area.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Directory where staged upload files are created.
    pub staging_dir: PathBuf,
    /// Delay before an allocated file becomes eligible for reclamation. Acts
    /// as a safety net for files that are never explicitly released.
    #[serde(with = "humantime_serde")]
    pub reclaim_delay: Duration,
    /// How long `shutdown` waits for the sweep worker to drain before
    /// force-terminating it.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from(".data/staging"),
            reclaim_delay: Duration::from_millis(1000),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Errors surfaced to callers of [`StagingManager::allocate`].
///
/// Everything past allocation is best-effort and never propagates; see the
/// module docs.
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("Failed to create staging directory {dir}: {source}")]
    Directory {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to create staging file in {dir}: {source}")]
    Create {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Reasons the sweep worker wakes up.
enum SweepTrigger {
    /// A per-file eligibility timer fired.
    Timer,
    /// Explicit request, acknowledged once the sweep completes.
    Request(oneshot::Sender<()>),
}

type Registry = Arc<RwLock<HashMap<PathBuf, Arc<FileHandle>>>>;

/// Tracks staged upload files and reclaims them once they are releasable.
///
/// All reclamation runs on one background task consuming a trigger channel,
/// so sweeps never overlap and the registry is only pruned after a confirmed
/// delete. The manager owns that task: it starts with the manager and stops
/// with [`shutdown`](Self::shutdown) (or on drop).
pub struct StagingManager {
    config: StagingConfig,
    registry: Registry,
    trigger_tx: mpsc::UnboundedSender<SweepTrigger>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StagingManager {
    /// Create the staging directory and start the sweep worker.
    pub async fn new(config: StagingConfig) -> Result<Self, AllocationError> {
        tokio::fs::create_dir_all(&config.staging_dir)
            .await
            .map_err(|source| AllocationError::Directory {
                dir: config.staging_dir.clone(),
                source,
            })?;

        let registry: Registry = Arc::new(RwLock::new(HashMap::new()));
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        let worker = tokio::spawn(run_sweep_worker(Arc::clone(&registry), trigger_rx, stop_rx));

        Ok(Self {
            config,
            registry,
            trigger_tx,
            stop_tx: Mutex::new(Some(stop_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Allocate a new staging file and register it for lifecycle tracking.
    ///
    /// The filename hint only contributes the suffix: a hint with a `.` keeps
    /// its trailing extension, anything else falls back to `.tmp`. An
    /// eligibility timer is armed so the file is eventually reclaimed even if
    /// the caller never marks it releasable.
    pub async fn allocate(
        &self,
        filename_hint: Option<&str>,
    ) -> Result<StagedFile, AllocationError> {
        let suffix = suffix_for_hint(filename_hint);

        let staged = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(suffix)
            .tempfile_in(&self.config.staging_dir)
            .map_err(|source| AllocationError::Create {
                dir: self.config.staging_dir.clone(),
                source,
            })?;
        let path = staged
            .into_temp_path()
            .keep()
            .map_err(|persist| AllocationError::Create {
                dir: self.config.staging_dir.clone(),
                source: persist.error,
            })?;

        let file_handle = Arc::new(FileHandle::new(path.clone()));
        {
            let mut tracked = self.registry.write().await;
            tracked.insert(path.clone(), Arc::clone(&file_handle));
        }

        let trigger_tx = self.trigger_tx.clone();
        let timer_handle = Arc::clone(&file_handle);
        let delay = self.config.reclaim_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            timer_handle.mark_deletable();
            // Worker may already be gone during shutdown; nothing to do then.
            let _ = trigger_tx.send(SweepTrigger::Timer);
        });

        tracing::debug!(path = %path.display(), "Allocated staging file");
        Ok(StagedFile::new(file_handle))
    }

    /// Run an out-of-band sweep and wait for it to complete.
    ///
    /// Returns immediately if the worker has already been shut down.
    pub async fn sweep_now(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .trigger_tx
            .send(SweepTrigger::Request(done_tx))
            .is_err()
        {
            return;
        }
        let _ = done_rx.await;
    }

    /// Number of staging files currently tracked.
    pub async fn tracked_files(&self) -> usize {
        self.registry.read().await.len()
    }

    /// Whether `path` is still tracked by the registry.
    pub async fn is_tracked(&self, path: &Path) -> bool {
        self.registry.read().await.contains_key(path)
    }

    /// Directory this manager stages files in.
    pub fn staging_dir(&self) -> &Path {
        &self.config.staging_dir
    }

    /// Stop background scheduling and run one final best-effort sweep.
    ///
    /// Waits up to `timeout` for the worker to drain, then force-terminates
    /// it. Files still tracked after a forced termination are abandoned on
    /// disk; that is logged, not fatal. Calling `shutdown` twice is a no-op.
    pub async fn shutdown(&self, timeout: Duration) {
        let stop_tx = {
            let mut slot = self.stop_tx.lock().unwrap_or_else(PoisonError::into_inner);
            slot.take()
        };
        let Some(stop_tx) = stop_tx else {
            return;
        };
        let _ = stop_tx.send(());

        let worker = {
            let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
            slot.take()
        };
        if let Some(worker) = worker {
            let abort = worker.abort_handle();
            match tokio::time::timeout(timeout, worker).await {
                Ok(_) => {
                    tracing::debug!("Staging sweep worker drained");
                }
                Err(_) => {
                    abort.abort();
                    let abandoned = self.registry.read().await.len();
                    if abandoned > 0 {
                        tracing::warn!(
                            abandoned,
                            "Staging shutdown timed out, abandoning tracked files"
                        );
                    } else {
                        tracing::warn!("Staging shutdown timed out");
                    }
                }
            }
        }
    }
}

impl Drop for StagingManager {
    fn drop(&mut self) {
        // Let the worker run its final sweep and exit on its own.
        if let Some(stop_tx) = self
            .stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = stop_tx.send(());
        }
    }
}

/// Derive the staging-file suffix from a caller-supplied filename hint.
fn suffix_for_hint(hint: Option<&str>) -> &str {
    match hint {
        Some(name) => match name.rfind('.') {
            Some(idx) => &name[idx..],
            None => DEFAULT_SUFFIX,
        },
        None => DEFAULT_SUFFIX,
    }
}

/// Sweep loop: one sequential consumer for every reclamation pass.
async fn run_sweep_worker(
    registry: Registry,
    mut trigger_rx: mpsc::UnboundedReceiver<SweepTrigger>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            _ = &mut stop_rx => {
                sweep(&registry).await;
                break;
            }
            trigger = trigger_rx.recv() => match trigger {
                Some(SweepTrigger::Timer) => {
                    sweep(&registry).await;
                }
                Some(SweepTrigger::Request(done_tx)) => {
                    sweep(&registry).await;
                    let _ = done_tx.send(());
                }
                None => break,
            },
        }
    }
}

/// One reclamation pass over the registry.
///
/// Candidates are snapshotted under a read lock so producers can keep
/// allocating while files are being deleted; the registry is only locked for
/// writing to prune confirmed deletions.
async fn sweep(registry: &Registry) {
    let candidates: Vec<Arc<FileHandle>> = {
        let tracked = registry.read().await;
        tracked
            .values()
            .filter(|file_handle| file_handle.is_deletable())
            .cloned()
            .collect()
    };
    if candidates.is_empty() {
        return;
    }

    let mut reclaimed = Vec::with_capacity(candidates.len());
    let mut failed = 0usize;
    for file_handle in candidates {
        if reclaim::reclaim(file_handle.as_ref()).await {
            reclaimed.push(file_handle.path().to_path_buf());
        } else {
            failed += 1;
        }
    }

    if !reclaimed.is_empty() {
        let mut tracked = registry.write().await;
        for path in &reclaimed {
            tracked.remove(path);
        }
    }

    tracing::debug!(
        reclaimed = reclaimed.len(),
        failed,
        "Staging sweep complete"
    );
}
