//! Directory tree walking that populates an empty [`FsBuf`] in preorder.
//!
//! The walker stays on one filesystem (a device-id change marks a child
//! mount point), records symlinks as plain files without following them,
//! and reports progress between entries so a build can be cancelled at
//! entry granularity. Unreadable entries are skipped, not fatal: a name
//! index is best-effort by nature.

use std::fs;
use std::io;
use std::ops::ControlFlow;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::fs_buf::{self, FsBuf};

/// Result of walk operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Walk errors.
#[derive(Debug)]
pub enum Error {
    /// The progress callback asked for the walk to stop.
    Cancelled,
    /// The root directory itself could not be inspected.
    Io(io::Error),
    /// The buffer rejected an append (growth limit, oversized name).
    Buf(fs_buf::Error),
}

impl From<fs_buf::Error> for Error {
    fn from(err: fs_buf::Error) -> Self {
        Error::Buf(err)
    }
}

/// Walk policy switches.
#[derive(Debug, Copy, Clone, Default)]
pub struct WalkOptions {
    /// Record entries whose name starts with a dot.
    pub include_hidden: bool,
}

/// Counters handed to the progress callback and returned on completion.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct WalkSummary {
    pub files: u64,
    pub dirs: u64,
}

/// Progress callback, invoked before each directory descent and after each
/// file with `(counters, current_dir, current_entry)`. Returning
/// [`ControlFlow::Break`] aborts the walk with [`Error::Cancelled`].
pub type ProgressFn<'a> = dyn FnMut(&WalkSummary, &Path, &Path) -> ControlFlow<()> + Send + 'a;

/// Fills the empty buffer `buf` with the tree under its root path.
///
/// An aborted walk leaves the buffer partially filled but structurally
/// droppable; callers discard it.
pub fn build_fs_tree(
    buf: &mut FsBuf,
    options: WalkOptions,
    progress: &mut ProgressFn<'_>,
) -> Result<WalkSummary> {
    assert!(buf.is_empty(), "the buffer must be empty before a build");
    let root = PathBuf::from(std::ffi::OsStr::from_bytes(buf.root_path()).to_os_string());
    let device = fs::metadata(&root).map_err(Error::Io)?.dev();
    let mut walker = Walker { buf, options, progress, summary: WalkSummary::default(), device };
    walker.walk_dir(&root, 0)?;
    Ok(walker.summary)
}

struct Walker<'a, 'b> {
    buf: &'a mut FsBuf,
    options: WalkOptions,
    progress: &'a mut ProgressFn<'b>,
    summary: WalkSummary,
    device: u64,
}

impl Walker<'_, '_> {
    fn walk_dir(&mut self, dir: &Path, parent: u32) -> Result<()> {
        let reader = match fs::read_dir(dir) {
            Ok(reader) => reader,
            Err(err) => {
                debug!(dir = %dir.display(), ?err, "skipping unreadable directory");
                return Ok(());
            }
        };
        let mut entries = Vec::new();
        for entry in reader {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(dir = %dir.display(), ?err, "skipping unreadable entry");
                    continue;
                }
            };
            if !self.options.include_hidden
                && entry.file_name().as_bytes().first() == Some(&b'.')
            {
                continue;
            }
            entries.push(entry);
        }
        entries.sort_by(|a, b| a.file_name().as_bytes().cmp(b.file_name().as_bytes()));
        for entry in entries {
            let name = entry.file_name();
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(err) => {
                    debug!(path = %path.display(), ?err, "skipping entry without type");
                    continue;
                }
            };
            if file_type.is_dir() {
                if let ControlFlow::Break(()) = (self.progress)(&self.summary, dir, &path) {
                    return Err(Error::Cancelled);
                }
                let off = self.buf.append_entry(parent, name.as_bytes(), true)?;
                self.summary.dirs += 1;
                let same_device = entry.metadata().map(|m| m.dev() == self.device).unwrap_or(false);
                if same_device {
                    self.walk_dir(&path, off)?;
                } else {
                    debug!(path = %path.display(), "not descending into child mount");
                }
                self.buf.close_dir(off)?;
            } else {
                // Symlinks land here and are recorded as files, never followed.
                self.buf.append_entry(parent, name.as_bytes(), false)?;
                self.summary.files += 1;
                if let ControlFlow::Break(()) = (self.progress)(&self.summary, dir, &path) {
                    return Err(Error::Cancelled);
                }
            }
        }
        Ok(())
    }
}
