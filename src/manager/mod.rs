//! Index manager --- [`LftManager`].
//!
//! Owns every live FS buffer, keyed by registered path. Bind mounts of one
//! partition register several keys onto one shared buffer, so a query
//! through any alias hits the same index. The manager drives background
//! builds, search queries, kernel change events, mount reactions, the
//! auto-index policy and periodic persistence; buffer state only ever
//! changes under its lock, so a search observes a mutation either in full
//! or not at all.

mod build;

pub use build::BuildOutcome;

use std::collections::{HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as SyncMutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{self, Settings};
use crate::disks::{self, DiskManager, MountEvent, SERIAL_URI_SCHEME};
use crate::fs_buf::{self, FsBuf, FsChange};

/// Result of manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Manager errors.
#[derive(Debug)]
pub enum Error {
    /// Malformed request: relative path, unresolvable partition, bad regex.
    InvalidArgs(String),
    /// No index covers the path.
    NotFound,
    /// The covering index is still being built.
    NotReady,
    /// A build for the same path is already in flight.
    Busy,
    /// Automatically created indexes cannot be removed directly.
    NotSupported,
    /// A buffer operation failed.
    Buf(fs_buf::Error),
    /// Cache file or directory I/O failed.
    Io(io::Error),
}

impl From<fs_buf::Error> for Error {
    fn from(err: fs_buf::Error) -> Self {
        Error::Buf(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// Signals emitted by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A build finished for a registered path; `ok` tells whether a buffer
    /// was installed under it.
    AddPathFinished { path: PathBuf, ok: bool },
    AutoIndexInternalChanged(bool),
    AutoIndexExternalChanged(bool),
}

/// Bounded search request.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub path: PathBuf,
    pub keyword: String,
    pub use_regex: bool,
    /// At most this many results per page.
    pub max_count: usize,
    /// Cooperative deadline; `None` searches to completion.
    pub max_time: Option<Duration>,
    /// Resume cursor; `(0, 0)` starts a fresh scan of the subtree.
    pub start: u32,
    pub end: u32,
}

/// One page of search results plus the cursor to resume from.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub paths: Vec<PathBuf>,
    pub start: u32,
    pub end: u32,
}

/// Records scanned per `search_files` call; deadline checks and result
/// flushing happen at this granularity.
const SEARCH_BATCH: usize = 100;

/// Change records retained per buffer mutation.
const CHANGE_LIMIT: usize = 10;

/// Period of the background sync task.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Startup delay before the initial full indexing pass, so it does not
/// compete with boot I/O.
pub const INDEX_ALL_DELAY: Duration = Duration::from_secs(5);

/// One registered index: the buffer plus its persistence bookkeeping.
/// Multiple alias keys may share a single entry.
struct IndexEntry {
    /// The buffer's own embedded root path.
    root_path: PathBuf,
    buf: RwLock<FsBuf>,
    cache_file: PathBuf,
    auto_index: bool,
    dirty: AtomicBool,
}

enum Owner {
    Ready(Arc<IndexEntry>),
    Building(Arc<build::BuildTask>),
}

#[derive(Default)]
struct State {
    entries: HashMap<PathBuf, Arc<IndexEntry>>,
    builds: HashMap<PathBuf, Arc<build::BuildTask>>,
    /// Cache files to delete at the next cleanup round.
    doomed_files: HashSet<PathBuf>,
    /// Last seen stable id per block device, for `FilesystemRemoved`.
    block_ids: HashMap<String, String>,
    settings: Settings,
}

struct Inner {
    cache_dir: PathBuf,
    disks: Arc<dyn DiskManager>,
    state: Mutex<State>,
    events_tx: async_channel::Sender<Event>,
    events_rx: async_channel::Receiver<Event>,
    log_level: AtomicU8,
    log_hook: SyncMutex<Option<Box<dyn Fn(u8) + Send + Sync>>>,
}

/// The index manager. Cheap to clone; clones share one state.
#[derive(Clone)]
pub struct LftManager {
    inner: Arc<Inner>,
}

impl LftManager {
    /// Creates a manager over `cache_dir`, loading persisted settings.
    pub fn new(cache_dir: PathBuf, disks: Arc<dyn DiskManager>) -> LftManager {
        let settings = Settings::load(&cache_dir.join(cache::CONFIG_FILE));
        let (events_tx, events_rx) = async_channel::bounded(1024);
        LftManager {
            inner: Arc::new(Inner {
                cache_dir,
                disks,
                state: Mutex::new(State { settings, ..State::default() }),
                events_tx,
                events_rx,
                log_level: AtomicU8::new(0),
                log_hook: SyncMutex::new(None),
            }),
        }
    }

    /// Creates a manager over the standard cache directory.
    pub fn with_default_cache_dir(disks: Arc<dyn DiskManager>) -> LftManager {
        LftManager::new(cache::resolve_cache_dir(), disks)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.inner.cache_dir
    }

    /// Stream of manager signals.
    pub fn subscribe(&self) -> async_channel::Receiver<Event> {
        self.inner.events_rx.clone()
    }

    fn emit(&self, event: Event) {
        if let Err(err) = self.inner.events_tx.try_send(event) {
            debug!(?err, "signal dropped");
        }
    }

    /// Startup sequence: crash detection via the sentinel file, cache
    /// refresh, and (when policy allows) a delayed full indexing pass.
    pub async fn start(&self) {
        if let Err(err) = fs::create_dir_all(&self.inner.cache_dir) {
            warn!(dir = %self.inner.cache_dir.display(), ?err, "cannot create the cache directory");
        }
        match cache::create_sentinel(&self.inner.cache_dir) {
            Ok(true) => {
                warn!("the previous run did not exit cleanly, dropping auto-created indexes");
                for file in cache::list_cache_files(&self.inner.cache_dir, None, true) {
                    if let Err(err) = fs::remove_file(&file) {
                        warn!(file = %file.display(), ?err, "failed to remove a stale index");
                    }
                }
            }
            Ok(false) => {}
            Err(err) => warn!(?err, "cannot create the startup sentinel"),
        }
        self.refresh(None).await;
        let (internal, external) = self.policy().await;
        if internal || external {
            let manager = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(INDEX_ALL_DELAY).await;
                manager.index_all().await;
            });
        }
    }

    /// Flushes, frees and cleans up; the sentinel is removed last so the
    /// next start sees a clean shutdown.
    pub async fn shutdown(&self) {
        info!("index manager shutting down");
        let build_keys: Vec<PathBuf> = {
            let state = self.inner.state.lock().await;
            state.builds.keys().cloned().collect()
        };
        for key in build_keys {
            self.cancel_build(&key).await;
        }
        self.sync(None).await;
        self.delete_stale_files().await;
        self.inner.state.lock().await.entries.clear();
        cache::remove_sentinel(&self.inner.cache_dir);
    }

    /// Runs the mount-event stream against this manager.
    pub fn spawn_mount_watch(&self, events: async_channel::Receiver<MountEvent>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                manager.handle_mount_event(event).await;
            }
        })
    }

    /// Periodically saves dirty buffers and removes stale cache files.
    pub fn spawn_sync_timer(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SYNC_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!("periodic index synchronization");
                manager.sync(None).await;
                manager.delete_stale_files().await;
            }
        })
    }

    /// Starts a background build for `path`. Returns immediately;
    /// completion is signaled with [`Event::AddPathFinished`] under every
    /// alias of the path's partition.
    pub async fn add_path(&self, path: &Path, auto_index: bool) -> Result<()> {
        debug!(path = %path.display(), auto_index, "add path");
        if !path.is_absolute() {
            return Err(Error::InvalidArgs("the path must start with '/'".into()));
        }
        let path = normalize(path);
        let serial_uri = disks::path_to_serial_uri(self.inner.disks.as_ref(), &path).await;
        if serial_uri.is_empty() {
            return Err(Error::InvalidArgs("unable to convert the path to a serial uri".into()));
        }
        let mut aliases = disks::from_serial_uri(self.inner.disks.as_ref(), &serial_uri).await;
        if aliases.is_empty() {
            aliases.push(path.clone());
        }
        debug!(?aliases, "equivalent paths");
        let mut state = self.inner.state.lock().await;
        if state.builds.contains_key(&path) {
            return Err(Error::Busy);
        }
        let canonical = aliases[0].clone();
        let cache_file = self.inner.cache_dir.join(cache::cache_file_name(&serial_uri, auto_index));
        let task = build::spawn(self.clone(), aliases.clone(), canonical, cache_file, auto_index);
        for alias in aliases {
            state.builds.insert(alias, task.clone());
        }
        Ok(())
    }

    /// Installs (or discards) a finished build; runs on the control path
    /// with the manager lock held.
    pub(crate) async fn finish_build(
        &self,
        task: &Arc<build::BuildTask>,
        aliases: Vec<PathBuf>,
        canonical: PathBuf,
        cache_file: PathBuf,
        built: std::result::Result<FsBuf, BuildOutcome>,
    ) -> BuildOutcome {
        // The build may have raced a policy toggle; re-check before installing.
        let allowed = match &built {
            Ok(_) if task.auto_index() => self.allowable_path(&canonical).await,
            _ => true,
        };
        let mut state = self.inner.state.lock().await;
        let still_wanted = aliases
            .iter()
            .any(|alias| state.builds.get(alias).is_some_and(|t| Arc::ptr_eq(t, task)));
        let mut outcome = match &built {
            Ok(_) => BuildOutcome::Completed,
            Err(outcome) => *outcome,
        };
        let entry = match built {
            Ok(buf) if still_wanted && allowed => Some(Arc::new(IndexEntry {
                root_path: canonical.clone(),
                buf: RwLock::new(buf),
                cache_file,
                auto_index: task.auto_index(),
                dirty: AtomicBool::new(true),
            })),
            Ok(_) => {
                warn!(path = %canonical.display(), "discarding freshly built index data");
                outcome = BuildOutcome::Cancelled;
                None
            }
            Err(_) => None,
        };
        for alias in &aliases {
            if state.builds.get(alias).is_some_and(|t| Arc::ptr_eq(t, task)) {
                state.builds.remove(alias);
            }
            if let Some(entry) = &entry {
                if let Some(old) = state.entries.get(alias).cloned() {
                    drop_entry(&mut state, &old, old.cache_file != entry.cache_file);
                }
                state.entries.insert(alias.clone(), entry.clone());
            }
            self.emit(Event::AddPathFinished { path: alias.clone(), ok: entry.is_some() });
        }
        outcome
    }

    /// Frees the user-requested index registered at `path` and deletes its
    /// cache file. Auto-created indexes are refused; toggling the policy is
    /// the way to drop those.
    pub async fn remove_path(&self, path: &Path) -> Result<()> {
        debug!(path = %path.display(), "remove path");
        let path = normalize(path);
        let entry = {
            let mut state = self.inner.state.lock().await;
            let Some(entry) = state.entries.get(&path).cloned() else {
                return Err(Error::NotFound);
            };
            if entry.auto_index {
                return Err(Error::NotSupported);
            }
            drop_entry(&mut state, &entry, false);
            entry
        };
        if let Err(err) = fs::remove_file(&entry.cache_file) {
            debug!(file = %entry.cache_file.display(), ?err, "cache file not removed");
        }
        // The partition is still mounted; policy may want it auto-indexed.
        if let Some(partition) = self.inner.disks.partition_for_path(&path).await {
            let mount = partition.covering_mount(&path).cloned();
            if let Some(mount) = mount {
                if !partition.loop_device {
                    self.handle_mount_added(&partition.device, &mount).await;
                }
            }
        }
        Ok(())
    }

    /// True iff a registered buffer covers `path` (exact key or ancestor).
    pub async fn has_lft(&self, path: &Path) -> bool {
        let state = self.inner.state.lock().await;
        lookup_owners(&state, path, false)
            .iter()
            .any(|(_, owner)| matches!(owner, Owner::Ready(_)))
    }

    /// True iff a build is in flight for exactly `path`.
    pub async fn lft_building(&self, path: &Path) -> bool {
        let state = self.inner.state.lock().await;
        state.builds.contains_key(&normalize(path))
    }

    /// Cancels the build registered at `path` and waits for the worker to
    /// unwind. All alias keys of the build are dropped with it.
    pub async fn cancel_build(&self, path: &Path) -> bool {
        let path = normalize(path);
        let task = {
            let mut state = self.inner.state.lock().await;
            let Some(task) = state.builds.remove(&path) else {
                return false;
            };
            state.builds.retain(|_, t| !Arc::ptr_eq(t, &task));
            task
        };
        debug!(path = %path.display(), "cancelling the index build");
        task.cancel();
        task.wait().await;
        true
    }

    /// Every registered path, sorted.
    pub async fn all_path(&self) -> Vec<PathBuf> {
        let state = self.inner.state.lock().await;
        let mut paths: Vec<PathBuf> = state.entries.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Registered paths lying under `prefix`, sorted.
    pub async fn has_lft_subdirectories(&self, prefix: &Path) -> Vec<PathBuf> {
        let prefix = normalize(prefix);
        let state = self.inner.state.lock().await;
        let mut paths: Vec<PathBuf> =
            state.entries.keys().filter(|key| key.starts_with(&prefix)).cloned().collect();
        paths.sort();
        paths
    }

    /// Loads cache files (optionally restricted by serial-URI prefix) and
    /// installs each under all its current mount paths. An unreadable file
    /// is deleted and, when the partition is mounted, scheduled for a
    /// rebuild. Returns the installed paths.
    pub async fn refresh(&self, serial_uri_prefix: Option<&[u8]>) -> Vec<PathBuf> {
        let files = cache::list_cache_files(&self.inner.cache_dir, serial_uri_prefix, false);
        let mut installed = Vec::new();
        for file in files {
            debug!(file = %file.display(), "found an index file");
            let uri = cache::uri_of_cache_file(&file);
            if uri.is_empty() {
                continue;
            }
            let auto_index = cache::is_auto_cache_file(&file);
            let aliases = disks::from_serial_uri(self.inner.disks.as_ref(), &uri).await;
            if aliases.is_empty() {
                debug!(file = %file.display(), "partition not present, leaving the file alone");
                continue;
            }
            let loaded = {
                let file = file.clone();
                tokio::task::spawn_blocking(move || FsBuf::load(&file)).await
            };
            let buf = match loaded {
                Ok(Ok(buf)) => buf,
                Ok(Err(err)) => {
                    warn!(file = %file.display(), ?err, "failed to load, scheduling a rebuild");
                    let _ = fs::remove_file(&file);
                    if let Err(err) = self.add_path(&aliases[0], auto_index).await {
                        debug!(?err, "rebuild not started");
                    }
                    continue;
                }
                Err(join_err) => {
                    warn!(?join_err, "index load worker panicked");
                    continue;
                }
            };
            let entry = Arc::new(IndexEntry {
                root_path: bytes_path(buf.root_path().to_vec()),
                buf: RwLock::new(buf),
                cache_file: file.clone(),
                auto_index,
                dirty: AtomicBool::new(false),
            });
            let mut state = self.inner.state.lock().await;
            for alias in aliases {
                if let Some(old) = state.entries.get(&alias).cloned() {
                    drop_entry(&mut state, &old, old.cache_file != entry.cache_file);
                }
                state.entries.insert(alias.clone(), entry.clone());
                installed.push(alias);
            }
        }
        installed
    }

    /// Saves dirty buffers (optionally only those registered under
    /// `mount`) to their cache files. A buffer that saved cleanly is no
    /// longer dirty, so back-to-back calls do I/O once.
    pub async fn sync(&self, mount: Option<&Path>) -> Vec<(PathBuf, bool)> {
        debug!(?mount, "sync");
        if let Err(err) = fs::create_dir_all(&self.inner.cache_dir) {
            warn!(?err, "cannot create the cache directory");
            return Vec::new();
        }
        let mount = mount.map(normalize);
        let targets = {
            let state = self.inner.state.lock().await;
            let mut unique: Vec<Arc<IndexEntry>> = Vec::new();
            for (key, entry) in &state.entries {
                if let Some(mount) = &mount {
                    if !key.starts_with(mount) {
                        continue;
                    }
                }
                if !unique.iter().any(|e| Arc::ptr_eq(e, entry)) {
                    unique.push(entry.clone());
                }
            }
            unique
        };
        let mut outcomes = Vec::new();
        for entry in targets {
            if !entry.dirty.load(Ordering::Relaxed) {
                continue;
            }
            let saved = {
                let entry = entry.clone();
                tokio::task::spawn_blocking(move || {
                    let buf = entry.buf.read().unwrap_or_else(|e| e.into_inner());
                    buf.save(&entry.cache_file)
                })
                .await
            };
            let ok = matches!(saved, Ok(Ok(())));
            match saved {
                Ok(Ok(())) => entry.dirty.store(false, Ordering::Relaxed),
                Ok(Err(err)) => {
                    warn!(file = %entry.cache_file.display(), ?err, "failed to save the index")
                }
                Err(join_err) => warn!(?join_err, "index save worker panicked"),
            }
            outcomes.push((entry.root_path.clone(), ok));
        }
        outcomes
    }

    /// Deletes doomed cache files plus the files of buffers that are still
    /// dirty after the last sync (their on-disk form is stale).
    pub async fn delete_stale_files(&self) {
        let files = {
            let mut state = self.inner.state.lock().await;
            let mut files: Vec<PathBuf> = state.doomed_files.drain().collect();
            let mut seen: Vec<Arc<IndexEntry>> = Vec::new();
            for entry in state.entries.values() {
                if !seen.iter().any(|e| Arc::ptr_eq(e, entry)) {
                    seen.push(entry.clone());
                }
            }
            for entry in seen {
                if entry.dirty.load(Ordering::Relaxed) {
                    files.push(entry.cache_file.clone());
                }
            }
            files
        };
        for file in files {
            if !file.exists() {
                continue;
            }
            match fs::remove_file(&file) {
                Ok(()) => debug!(file = %file.display(), "removed a stale cache file"),
                Err(err) => warn!(file = %file.display(), ?err, "failed to remove a stale cache file"),
            }
        }
    }

    /// Unbounded convenience search.
    pub async fn search(&self, path: &Path, keyword: &str, use_regex: bool) -> Result<Vec<PathBuf>> {
        let page = self
            .search_bounded(&SearchQuery {
                path: path.to_path_buf(),
                keyword: keyword.to_string(),
                use_regex,
                max_count: usize::MAX,
                max_time: None,
                start: 0,
                end: 0,
            })
            .await?;
        Ok(page.paths)
    }

    /// Bounded, cursor-resumable search. Feeding the returned `(start,
    /// end)` back yields the continuation of the same scan.
    pub async fn search_bounded(&self, query: &SearchQuery) -> Result<SearchPage> {
        debug!(
            path = %query.path.display(),
            keyword = %query.keyword,
            regex = query.use_regex,
            max_count = query.max_count,
            "search"
        );
        let (key, entry) = {
            let state = self.inner.state.lock().await;
            match lookup_owners(&state, &query.path, true).into_iter().next() {
                Some((key, Owner::Ready(entry))) => (key, entry),
                Some((_, Owner::Building(_))) => return Err(Error::NotReady),
                None => return Err(Error::NotFound),
            }
        };
        let caller_path = normalize(&query.path);
        let buffer_path = rebase(&caller_path, &key, &entry.root_path).ok_or(Error::NotFound)?;
        let matcher = Matcher::new(&query.keyword, query.use_regex)?;
        let query = query.clone();
        let searched = tokio::task::spawn_blocking(move || {
            run_search(&entry, &caller_path, &buffer_path, &matcher, &query)
        })
        .await;
        match searched {
            Ok(page) => page,
            Err(join_err) => {
                warn!(?join_err, "search worker panicked");
                Err(Error::Io(io::Error::other("search worker panicked")))
            }
        }
    }

    /// Routes a creation event into every buffer covering `path`.
    /// Returns the root paths of the buffers that took the change.
    pub async fn insert_file(&self, path: &Path) -> Vec<PathBuf> {
        debug!(path = %path.display(), "insert change");
        let path = normalize(path);
        // Symlinks count as files, so do not follow here.
        let is_dir = fs::symlink_metadata(&path).map(|m| m.is_dir()).unwrap_or(false);
        let target = path.clone();
        self.apply_change(&path, move |buf, key, root| {
            let Some(rebased) = rebase(&target, key, root) else {
                return Err(fs_buf::Error::NotFound);
            };
            buf.insert_path(path_bytes(&rebased), is_dir).map(|change| vec![change])
        })
        .await
    }

    /// Routes a deletion event into every buffer covering `path`.
    pub async fn remove_file(&self, path: &Path) -> Vec<PathBuf> {
        debug!(path = %path.display(), "remove change");
        let path = normalize(path);
        let target = path.clone();
        self.apply_change(&path, move |buf, key, root| {
            let Some(rebased) = rebase(&target, key, root) else {
                return Err(fs_buf::Error::NotFound);
            };
            buf.remove_path(path_bytes(&rebased), CHANGE_LIMIT)
        })
        .await
    }

    /// Routes a rename event into every buffer covering the new path.
    pub async fn rename_file(&self, old_path: &Path, new_path: &Path) -> Vec<PathBuf> {
        debug!(old = %old_path.display(), new = %new_path.display(), "rename change");
        let old = normalize(old_path);
        let new = normalize(new_path);
        let lookup = new.clone();
        self.apply_change(&lookup, move |buf, key, root| {
            let (Some(old_rebased), Some(new_rebased)) =
                (rebase(&old, key, root), rebase(&new, key, root))
            else {
                return Err(fs_buf::Error::NotFound);
            };
            buf.rename_path(path_bytes(&old_rebased), path_bytes(&new_rebased), CHANGE_LIMIT)
        })
        .await
    }

    /// Applies one change event to all owning buffers. An event racing an
    /// in-flight build waits for it; if the build did not complete the
    /// event is dropped. Failures only log --- the kernel source cannot be
    /// pushed back on.
    async fn apply_change<F>(&self, path: &Path, mut mutate: F) -> Vec<PathBuf>
    where
        F: FnMut(&mut FsBuf, &Path, &Path) -> fs_buf::Result<Vec<FsChange>>,
    {
        let owners = {
            let state = self.inner.state.lock().await;
            lookup_owners(&state, path, false)
        };
        let mut roots = Vec::new();
        for (key, owner) in owners {
            let entry = match owner {
                Owner::Ready(entry) => entry,
                Owner::Building(task) => {
                    debug!(key = %key.display(), "change event waits for the in-flight build");
                    if task.wait().await != BuildOutcome::Completed {
                        continue;
                    }
                    let state = self.inner.state.lock().await;
                    match state.entries.get(&key) {
                        Some(entry) => entry.clone(),
                        None => continue,
                    }
                }
            };
            let applied = {
                let mut buf = entry.buf.write().unwrap_or_else(|e| e.into_inner());
                mutate(&mut buf, &key, &entry.root_path)
            };
            match applied {
                Ok(changes) => {
                    debug!(key = %key.display(), count = changes.len(), "change applied");
                    entry.dirty.store(true, Ordering::Relaxed);
                    roots.push(entry.root_path.clone());
                }
                Err(fs_buf::Error::OutOfMemory) => {
                    warn!(key = %key.display(), "change dropped, the index region cannot grow")
                }
                Err(err) => debug!(key = %key.display(), ?err, "change not applied"),
            }
        }
        roots
    }

    /// Auto-indexes every mounted, non-loop partition the policy allows.
    pub async fn index_all(&self) {
        for partition in self.inner.disks.partitions().await {
            if partition.loop_device || partition.mount_points.is_empty() {
                continue;
            }
            let mount = partition.mount_points[0].clone();
            if self.has_lft(&mount).await {
                debug!(mount = %mount.display(), "index data already present");
                continue;
            }
            let (internal, external) = self.policy().await;
            let allowed = if partition.removable { external } else { internal };
            if !allowed {
                continue;
            }
            if let Err(err) = self.add_path(&mount, true).await {
                debug!(mount = %mount.display(), ?err, "auto index not started");
            }
        }
    }

    pub async fn handle_mount_event(&self, event: MountEvent) {
        match event {
            MountEvent::MountAdded { device, mount_point } => {
                info!(device = %device, mount = %mount_point.display(), "mount added");
                self.handle_mount_added(&device, &mount_point).await;
            }
            MountEvent::MountRemoved { device, mount_point } => {
                info!(device = %device, mount = %mount_point.display(), "mount removed");
                self.handle_mount_removed(&mount_point).await;
            }
            MountEvent::FilesystemAdded { device } => self.handle_fs_added(&device).await,
            MountEvent::FilesystemRemoved { device } => self.handle_fs_removed(&device).await,
        }
    }

    async fn handle_mount_added(&self, _device: &str, mount: &Path) {
        let mount = normalize(mount);
        let serial_uri = disks::path_to_serial_uri(self.inner.disks.as_ref(), &mount).await;
        let filter = if serial_uri.is_empty() { None } else { Some(serial_uri.as_slice()) };
        // A cached index beats a rebuild.
        let installed = self.refresh(filter).await;
        if installed.iter().any(|path| path == &mount) {
            return;
        }
        let (internal, external) = self.policy().await;
        if !internal && !external {
            return;
        }
        let Some(partition) = self.inner.disks.partition_for_path(&mount).await else {
            return;
        };
        if partition.loop_device {
            return;
        }
        let allowed = if partition.removable { external } else { internal };
        if !allowed || self.has_lft(&mount).await {
            return;
        }
        if let Err(err) = self.add_path(&mount, true).await {
            debug!(mount = %mount.display(), ?err, "auto index not started");
        }
    }

    async fn handle_mount_removed(&self, mount: &Path) {
        let mount = normalize(mount);
        let build_keys: Vec<PathBuf> = {
            let state = self.inner.state.lock().await;
            state.builds.keys().filter(|key| key.starts_with(&mount)).cloned().collect()
        };
        for key in build_keys {
            self.cancel_build(&key).await;
        }
        for key in self.has_lft_subdirectories(&mount).await {
            let entry = {
                let state = self.inner.state.lock().await;
                state.entries.get(&key).cloned()
            };
            let Some(entry) = entry else { continue };
            if entry.dirty.load(Ordering::Relaxed) {
                self.sync(Some(&key)).await;
            }
            let mut state = self.inner.state.lock().await;
            drop_entry(&mut state, &entry, false);
        }
    }

    /// A partition's stable id became visible: drop auto caches written
    /// for it before (the filesystem may have been recreated).
    async fn handle_fs_added(&self, device: &str) {
        let partition =
            self.inner.disks.partitions().await.into_iter().find(|p| p.device == device);
        let Some(partition) = partition else { return };
        if partition.stable_id.is_empty() {
            return;
        }
        info!(device, id = %partition.stable_id, "filesystem added");
        self.inner
            .state
            .lock()
            .await
            .block_ids
            .insert(device.to_string(), partition.stable_id.clone());
        self.remove_auto_cache_files(&partition.stable_id).await;
    }

    async fn handle_fs_removed(&self, device: &str) {
        let id = self.inner.state.lock().await.block_ids.remove(device);
        let Some(id) = id else { return };
        info!(device, id = %id, "filesystem removed");
        self.remove_auto_cache_files(&id).await;
    }

    async fn remove_auto_cache_files(&self, stable_id: &str) {
        let mut prefix = Vec::from(SERIAL_URI_SCHEME);
        prefix.extend_from_slice(stable_id.as_bytes());
        for file in cache::list_cache_files(&self.inner.cache_dir, Some(&prefix), true) {
            match fs::remove_file(&file) {
                Ok(()) => debug!(file = %file.display(), "removed an auto-created cache file"),
                Err(err) => warn!(file = %file.display(), ?err, "failed to remove a cache file"),
            }
        }
    }

    pub async fn auto_index_internal(&self) -> bool {
        self.inner.state.lock().await.settings.auto_index_internal
    }

    pub async fn auto_index_external(&self) -> bool {
        self.inner.state.lock().await.settings.auto_index_external
    }

    pub async fn set_auto_index_internal(&self, value: bool) {
        {
            let mut state = self.inner.state.lock().await;
            if state.settings.auto_index_internal == value {
                return;
            }
            state.settings.auto_index_internal = value;
            self.save_settings(&state.settings);
        }
        info!(value, "auto indexing of internal partitions toggled");
        self.emit(Event::AutoIndexInternalChanged(value));
        if value {
            self.index_all().await;
        } else {
            self.clean_disallowed().await;
        }
    }

    pub async fn set_auto_index_external(&self, value: bool) {
        {
            let mut state = self.inner.state.lock().await;
            if state.settings.auto_index_external == value {
                return;
            }
            state.settings.auto_index_external = value;
            self.save_settings(&state.settings);
        }
        info!(value, "auto indexing of removable partitions toggled");
        self.emit(Event::AutoIndexExternalChanged(value));
        if value {
            self.index_all().await;
        } else {
            self.clean_disallowed().await;
        }
    }

    pub fn log_level(&self) -> u8 {
        self.inner.log_level.load(Ordering::Relaxed)
    }

    /// Stores the level and forwards it to the installed hook; the binary
    /// wires the hook to its tracing filter.
    pub fn set_log_level(&self, level: u8) {
        self.inner.log_level.store(level, Ordering::Relaxed);
        let hook = self.inner.log_hook.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(hook) = hook.as_ref() {
            hook(level);
        }
    }

    pub fn set_log_level_hook(&self, hook: impl Fn(u8) + Send + Sync + 'static) {
        *self.inner.log_hook.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(hook));
    }

    fn save_settings(&self, settings: &Settings) {
        let path = self.inner.cache_dir.join(cache::CONFIG_FILE);
        if let Err(err) = fs::create_dir_all(&self.inner.cache_dir) {
            warn!(?err, "cannot create the cache directory");
        }
        if let Err(err) = settings.save(&path) {
            warn!(path = %path.display(), ?err, "failed to save settings");
        }
    }

    async fn policy(&self) -> (bool, bool) {
        let state = self.inner.state.lock().await;
        (state.settings.auto_index_internal, state.settings.auto_index_external)
    }

    /// Whether the auto-index policy currently allows `path`. Paths on
    /// unrecognized partitions are allowed; only the device class gates.
    async fn allowable_path(&self, path: &Path) -> bool {
        let Some(partition) = self.inner.disks.partition_for_path(path).await else {
            return true;
        };
        let (internal, external) = self.policy().await;
        if partition.removable {
            external
        } else {
            internal
        }
    }

    /// Drops auto indexes and cancels auto builds the current policy no
    /// longer permits.
    async fn clean_disallowed(&self) {
        let (entries, builds) = {
            let state = self.inner.state.lock().await;
            let mut unique: Vec<Arc<IndexEntry>> = Vec::new();
            for entry in state.entries.values() {
                if !unique.iter().any(|e| Arc::ptr_eq(e, entry)) {
                    unique.push(entry.clone());
                }
            }
            let builds: Vec<(PathBuf, Arc<build::BuildTask>)> =
                state.builds.iter().map(|(key, task)| (key.clone(), task.clone())).collect();
            (unique, builds)
        };
        for entry in entries {
            if entry.auto_index && !self.allowable_path(&entry.root_path).await {
                info!(root = %entry.root_path.display(), "dropping a disallowed auto index");
                let mut state = self.inner.state.lock().await;
                drop_entry(&mut state, &entry, true);
            }
        }
        for (key, task) in builds {
            if task.auto_index() && !self.allowable_path(&key).await {
                self.cancel_build(&key).await;
            }
        }
    }
}

/// Removes every key mapping to `entry`, optionally dooming its cache file.
fn drop_entry(state: &mut State, entry: &Arc<IndexEntry>, doom_file: bool) {
    state.entries.retain(|_, e| !Arc::ptr_eq(e, entry));
    if doom_file {
        state.doomed_files.insert(entry.cache_file.clone());
    }
}

/// Walks `path` upward until registered keys match, collecting the owning
/// buffer (or in-flight build) per matching key.
fn lookup_owners(state: &State, path: &Path, only_first: bool) -> Vec<(PathBuf, Owner)> {
    let mut owners = Vec::new();
    if !path.is_absolute() {
        return owners;
    }
    let mut cursor = normalize(path);
    loop {
        if let Some(entry) = state.entries.get(&cursor) {
            owners.push((cursor.clone(), Owner::Ready(entry.clone())));
            if only_first {
                break;
            }
        } else if let Some(task) = state.builds.get(&cursor) {
            owners.push((cursor.clone(), Owner::Building(task.clone())));
            if only_first {
                break;
            }
        }
        if !cursor.pop() {
            break;
        }
    }
    owners
}

enum Matcher {
    Literal(Vec<u8>),
    Regex(regex::bytes::Regex),
}

impl Matcher {
    fn new(keyword: &str, use_regex: bool) -> Result<Matcher> {
        if use_regex {
            let regex = regex::bytes::RegexBuilder::new(keyword)
                .case_insensitive(true)
                .dot_matches_new_line(true)
                .build()
                .map_err(|err| Error::InvalidArgs(format!("invalid regular expression: {err}")))?;
            Ok(Matcher::Regex(regex))
        } else {
            Ok(Matcher::Literal(keyword.as_bytes().to_ascii_lowercase()))
        }
    }

    fn matches(&self, name: &[u8]) -> bool {
        match self {
            Matcher::Literal(needle) => contains_ignore_ascii_case(name, needle),
            Matcher::Regex(regex) => regex.is_match(name),
        }
    }
}

/// ASCII-folded substring scan; `needle` is pre-lowercased.
fn contains_ignore_ascii_case(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| window.eq_ignore_ascii_case(needle))
}

fn run_search(
    entry: &IndexEntry,
    caller_path: &Path,
    buffer_path: &Path,
    matcher: &Matcher,
    query: &SearchQuery,
) -> Result<SearchPage> {
    let buf = entry.buf.read().unwrap_or_else(|e| e.into_inner());
    let (mut cursor, end) = if query.start == 0 || query.end == 0 {
        match buf.path_range(path_bytes(buffer_path))? {
            Some(range) if !range.is_empty() => (range.start, range.end),
            _ => return Ok(SearchPage::default()),
        }
    } else {
        (query.start, query.end)
    };
    let deadline = query.max_time.map(|timeout| Instant::now() + timeout);
    let rebase_needed = caller_path != buffer_path;
    let mut paths = Vec::new();
    loop {
        let batch = (query.max_count - paths.len()).min(SEARCH_BATCH);
        if batch == 0 {
            break;
        }
        let offsets = buf.search_files(
            &mut cursor,
            end,
            batch,
            |name| matcher.matches(name),
            |_| deadline.is_some_and(|d| Instant::now() >= d),
        )?;
        for offset in offsets {
            let raw = buf.path_by_offset(offset)?;
            let path = if rebase_needed {
                let suffix = &raw[path_bytes(buffer_path).len()..];
                bytes_path(join_bytes(path_bytes(caller_path), suffix))
            } else {
                bytes_path(raw)
            };
            paths.push(path);
        }
        if cursor >= end {
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
    }
    Ok(SearchPage { paths, start: cursor, end })
}

/// Rewrites `path` from under `from` to under `to`.
fn rebase(path: &Path, from: &Path, to: &Path) -> Option<PathBuf> {
    let rel = path.strip_prefix(from).ok()?;
    if rel.as_os_str().is_empty() {
        Some(to.to_path_buf())
    } else {
        Some(to.join(rel))
    }
}

/// Strips trailing slashes; `/` keeps its single slash.
fn normalize(path: &Path) -> PathBuf {
    let bytes = path.as_os_str().as_bytes();
    let mut end = bytes.len();
    while end > 1 && bytes[end - 1] == b'/' {
        end -= 1;
    }
    PathBuf::from(OsStr::from_bytes(&bytes[..end]).to_os_string())
}

fn path_bytes(path: &Path) -> &[u8] {
    path.as_os_str().as_bytes()
}

fn bytes_path(bytes: Vec<u8>) -> PathBuf {
    PathBuf::from(OsString::from_vec(bytes))
}

/// Joins path byte strings without doubling or dropping the separator.
fn join_bytes(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut out = prefix.to_vec();
    match (out.last() == Some(&b'/'), suffix.first() == Some(&b'/')) {
        (true, true) => out.extend_from_slice(&suffix[1..]),
        (false, false) if !suffix.is_empty() => {
            out.push(b'/');
            out.extend_from_slice(suffix);
        }
        _ => out.extend_from_slice(suffix),
    }
    out
}
