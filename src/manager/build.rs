//! Cancellable background index builds.
//!
//! One task per `add_path` call: the walk runs on the blocking pool, a
//! cancel flag is observed at walker-progress granularity, and the
//! terminal state is published over a watch channel so any number of
//! waiters (change events racing the build, `cancel_build`) can await it.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::fs_buf::{FsBuf, DEFAULT_CAPACITY};
use crate::walk::{self, WalkOptions, WalkSummary};

use super::LftManager;

/// Terminal state of a build.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The buffer was built and installed.
    Completed,
    /// The build was cancelled, or its result was discarded (a policy
    /// toggle raced the build, or the path was dropped meanwhile).
    Cancelled,
    /// The walk itself failed.
    Failed,
}

/// Shared handle of one in-flight build.
pub(crate) struct BuildTask {
    cancel: AtomicBool,
    auto_index: bool,
    done: watch::Receiver<Option<BuildOutcome>>,
}

impl BuildTask {
    pub(crate) fn auto_index(&self) -> bool {
        self.auto_index
    }

    /// Asks the worker to stop at its next progress callback.
    pub(crate) fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Waits for the build to reach a terminal state.
    pub(crate) async fn wait(&self) -> BuildOutcome {
        let mut done = self.done.clone();
        loop {
            let current = *done.borrow();
            if let Some(outcome) = current {
                return outcome;
            }
            if done.changed().await.is_err() {
                return BuildOutcome::Failed;
            }
        }
    }
}

/// Spawns a build of `canonical` and returns its shared handle. The
/// completion path runs [`LftManager::finish_build`], which re-checks
/// policy and installs the buffer under every alias.
pub(crate) fn spawn(
    manager: LftManager,
    aliases: Vec<PathBuf>,
    canonical: PathBuf,
    cache_file: PathBuf,
    auto_index: bool,
) -> Arc<BuildTask> {
    let (done_tx, done_rx) = watch::channel(None);
    let task = Arc::new(BuildTask { cancel: AtomicBool::new(false), auto_index, done: done_rx });
    let worker = task.clone();
    tokio::spawn(async move {
        let root = super::path_bytes(&canonical).to_vec();
        let built = tokio::task::spawn_blocking({
            let worker = worker.clone();
            move || run_build(&root, &worker)
        })
        .await;
        let built = match built {
            Ok(result) => result,
            Err(join_err) => {
                warn!(?join_err, "index build worker panicked");
                Err(BuildOutcome::Failed)
            }
        };
        let outcome = manager.finish_build(&worker, aliases, canonical, cache_file, built).await;
        let _ = done_tx.send(Some(outcome));
    });
    task
}

fn run_build(root: &[u8], task: &BuildTask) -> Result<FsBuf, BuildOutcome> {
    let root_display = String::from_utf8_lossy(root).into_owned();
    let mut buf = match FsBuf::new(DEFAULT_CAPACITY, root) {
        Ok(buf) => buf,
        Err(err) => {
            warn!(root = %root_display, ?err, "cannot allocate an index buffer");
            return Err(BuildOutcome::Failed);
        }
    };
    let mut progress = |_: &WalkSummary, _: &Path, _: &Path| {
        if task.cancel.load(Ordering::Relaxed) {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    };
    match walk::build_fs_tree(&mut buf, WalkOptions::default(), &mut progress) {
        Ok(summary) => {
            info!(
                root = %root_display,
                files = summary.files,
                dirs = summary.dirs,
                tail = buf.tail(),
                "index build finished"
            );
            Ok(buf)
        }
        Err(walk::Error::Cancelled) => {
            info!(root = %root_display, "index build cancelled");
            Err(BuildOutcome::Cancelled)
        }
        Err(err) => {
            warn!(root = %root_display, ?err, "index build failed");
            Err(BuildOutcome::Failed)
        }
    }
}
