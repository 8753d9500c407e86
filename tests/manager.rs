//! End-to-end scenarios over real temp directories and a scripted disk
//! layer.

use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use lft_index::cache;
use lft_index::disks::{DiskManager, MountEvent, Partition};
use lft_index::fs_buf::FsBuf;
use lft_index::manager::{Error, Event, LftManager, SearchQuery};

struct FakeDisks {
    partitions: Mutex<Vec<Partition>>,
}

#[async_trait]
impl DiskManager for FakeDisks {
    async fn partitions(&self) -> Vec<Partition> {
        self.partitions.lock().unwrap().clone()
    }
}

struct Fixture {
    _cache_dir: TempDir,
    _data_dir: TempDir,
    root: PathBuf,
    manager: LftManager,
}

fn fixture() -> Fixture {
    let cache_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();
    let root = data_dir.path().to_path_buf();
    let disks = Arc::new(FakeDisks {
        partitions: Mutex::new(vec![Partition {
            device: "/dev/fake1".into(),
            stable_id: "fake-uuid".into(),
            removable: false,
            loop_device: false,
            mount_points: vec![root.clone()],
        }]),
    });
    let manager = LftManager::new(cache_dir.path().to_path_buf(), disks);
    Fixture { _cache_dir: cache_dir, _data_dir: data_dir, root, manager }
}

fn populate_sample(root: &Path) {
    fs::write(root.join("a.txt"), b"").unwrap();
    fs::write(root.join("b.txt"), b"").unwrap();
    fs::create_dir(root.join("sub")).unwrap();
    fs::write(root.join("sub/c.txt"), b"").unwrap();
}

async fn build_and_wait(manager: &LftManager, path: &Path, auto_index: bool) -> bool {
    let events = manager.subscribe();
    manager.add_path(path, auto_index).await.unwrap();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("build did not finish in time")
            .unwrap();
        if let Event::AddPathFinished { path: finished, ok } = event {
            if finished == path {
                return ok;
            }
        }
    }
}

#[tokio::test]
async fn test_build_then_search() {
    let fx = fixture();
    populate_sample(&fx.root);

    assert!(build_and_wait(&fx.manager, &fx.root, false).await);
    assert!(fx.manager.has_lft(&fx.root).await);
    assert!(fx.manager.has_lft(&fx.root.join("sub")).await);
    assert_eq!(fx.manager.all_path().await, vec![fx.root.clone()]);

    let results = fx.manager.search(&fx.root, "c", false).await.unwrap();
    assert_eq!(results, vec![fx.root.join("sub/c.txt")]);

    let all = fx.manager.search(&fx.root, "", false).await.unwrap();
    assert_eq!(all.len(), 4);
}

#[tokio::test]
async fn test_insert_event_marks_dirty() {
    let fx = fixture();
    populate_sample(&fx.root);
    assert!(build_and_wait(&fx.manager, &fx.root, false).await);
    fx.manager.sync(None).await;

    fs::write(fx.root.join("sub/cc.txt"), b"").unwrap();
    let roots = fx.manager.insert_file(&fx.root.join("sub/cc.txt")).await;
    assert_eq!(roots, vec![fx.root.clone()]);

    let results = fx.manager.search(&fx.root, "cc", false).await.unwrap();
    assert_eq!(results, vec![fx.root.join("sub/cc.txt")]);

    // The mutation made the buffer dirty again.
    let outcomes = fx.manager.sync(None).await;
    assert_eq!(outcomes, vec![(fx.root.clone(), true)]);
}

#[tokio::test]
async fn test_rename_event_across_directories() {
    let fx = fixture();
    populate_sample(&fx.root);
    assert!(build_and_wait(&fx.manager, &fx.root, false).await);

    fs::write(fx.root.join("sub/cc.txt"), b"").unwrap();
    fx.manager.insert_file(&fx.root.join("sub/cc.txt")).await;

    fs::rename(fx.root.join("sub/cc.txt"), fx.root.join("cc.txt")).unwrap();
    let roots = fx.manager.rename_file(&fx.root.join("sub/cc.txt"), &fx.root.join("cc.txt")).await;
    assert_eq!(roots, vec![fx.root.clone()]);

    let in_sub = fx.manager.search(&fx.root.join("sub"), "cc", false).await.unwrap();
    assert!(in_sub.is_empty());
    let at_root = fx.manager.search(&fx.root, "cc", false).await.unwrap();
    assert_eq!(at_root, vec![fx.root.join("cc.txt")]);
}

#[tokio::test]
async fn test_remove_event() {
    let fx = fixture();
    populate_sample(&fx.root);
    assert!(build_and_wait(&fx.manager, &fx.root, false).await);

    fs::remove_file(fx.root.join("sub/c.txt")).unwrap();
    let roots = fx.manager.remove_file(&fx.root.join("sub/c.txt")).await;
    assert_eq!(roots, vec![fx.root.clone()]);
    assert!(fx.manager.search(&fx.root, "c.txt", false).await.unwrap().is_empty());

    // Unknown paths are dropped quietly; nothing reports a change.
    let roots = fx.manager.remove_file(&fx.root.join("ghost.txt")).await;
    assert!(roots.is_empty());
}

#[tokio::test]
async fn test_bounded_regex_search_resumes() {
    let fx = fixture();
    for i in 0..300 {
        fs::write(fx.root.join(format!("file{i:03}")), b"").unwrap();
    }
    assert!(build_and_wait(&fx.manager, &fx.root, false).await);

    let unbounded = fx.manager.search(&fx.root, "^file0\\d\\d$", true).await.unwrap();
    assert_eq!(unbounded.len(), 100);

    let mut paged = Vec::new();
    let mut start = 0u32;
    let mut end = 0u32;
    loop {
        let page = fx
            .manager
            .search_bounded(&SearchQuery {
                path: fx.root.clone(),
                keyword: "^file0\\d\\d$".into(),
                use_regex: true,
                max_count: 30,
                max_time: Some(Duration::from_secs(30)),
                start,
                end,
            })
            .await
            .unwrap();
        assert!(page.paths.len() <= 30);
        if paged.is_empty() {
            assert_eq!(page.paths.len(), 30);
            assert_ne!(page.end, 0);
        }
        if page.paths.is_empty() {
            break;
        }
        paged.extend(page.paths);
        start = page.start;
        end = page.end;
    }
    assert_eq!(paged, unbounded);
}

#[tokio::test]
async fn test_search_argument_errors() {
    let fx = fixture();
    populate_sample(&fx.root);
    assert!(build_and_wait(&fx.manager, &fx.root, false).await);

    assert!(matches!(
        fx.manager.search(Path::new("/nowhere"), "x", false).await,
        Err(Error::NotFound)
    ));
    assert!(matches!(
        fx.manager.search(&fx.root, "([", true).await,
        Err(Error::InvalidArgs(_))
    ));
    assert!(matches!(
        fx.manager.add_path(Path::new("relative/path"), false).await,
        Err(Error::InvalidArgs(_))
    ));
}

#[tokio::test]
async fn test_alias_mounts_share_one_buffer() {
    let cache_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();
    let mount_a = data_dir.path().join("a");
    let mount_b = data_dir.path().join("b");
    fs::create_dir(&mount_a).unwrap();
    fs::create_dir(&mount_b).unwrap();
    populate_sample(&mount_a);

    let disks = Arc::new(FakeDisks {
        partitions: Mutex::new(vec![Partition {
            device: "/dev/fake1".into(),
            stable_id: "fake-uuid".into(),
            removable: false,
            loop_device: false,
            mount_points: vec![mount_a.clone(), mount_b.clone()],
        }]),
    });
    let manager = LftManager::new(cache_dir.path().to_path_buf(), disks);

    assert!(build_and_wait(&manager, &mount_a, true).await);
    assert!(manager.has_lft(&mount_b).await);
    let mut registered = manager.all_path().await;
    registered.sort();
    assert_eq!(registered, vec![mount_a.clone(), mount_b.clone()]);

    let results = manager.search(&mount_b, "c.txt", false).await.unwrap();
    assert_eq!(results, vec![mount_b.join("sub/c.txt")]);

    // A change routed through one alias is visible through the other.
    fs::write(mount_a.join("fresh.txt"), b"").unwrap();
    fx_insert(&manager, &mount_a.join("fresh.txt")).await;
    let results = manager.search(&mount_b, "fresh", false).await.unwrap();
    assert_eq!(results, vec![mount_b.join("fresh.txt")]);
}

async fn fx_insert(manager: &LftManager, path: &Path) {
    let roots = manager.insert_file(path).await;
    assert!(!roots.is_empty());
}

#[tokio::test]
async fn test_sync_writes_once() {
    let fx = fixture();
    populate_sample(&fx.root);
    assert!(build_and_wait(&fx.manager, &fx.root, false).await);

    let outcomes = fx.manager.sync(None).await;
    assert_eq!(outcomes, vec![(fx.root.clone(), true)]);
    let files = cache::list_cache_files(fx.manager.cache_dir(), None, false);
    assert_eq!(files.len(), 1);
    assert!(!cache::is_auto_cache_file(&files[0]));

    // No intervening mutation: the second sync performs no I/O.
    fs::remove_file(&files[0]).unwrap();
    let outcomes = fx.manager.sync(None).await;
    assert!(outcomes.is_empty());
    assert!(cache::list_cache_files(fx.manager.cache_dir(), None, false).is_empty());
}

#[tokio::test]
async fn test_remove_path_refuses_auto_indexes() {
    let fx = fixture();
    populate_sample(&fx.root);
    assert!(build_and_wait(&fx.manager, &fx.root, true).await);
    assert!(matches!(fx.manager.remove_path(&fx.root).await, Err(Error::NotSupported)));
    assert!(fx.manager.has_lft(&fx.root).await);
    assert!(matches!(
        fx.manager.remove_path(Path::new("/not/registered")).await,
        Err(Error::NotFound)
    ));
}

#[tokio::test]
async fn test_remove_path_deletes_user_index() {
    let fx = fixture();
    populate_sample(&fx.root);
    assert!(build_and_wait(&fx.manager, &fx.root, false).await);
    fx.manager.sync(None).await;
    assert_eq!(cache::list_cache_files(fx.manager.cache_dir(), None, false).len(), 1);

    fx.manager.remove_path(&fx.root).await.unwrap();
    assert!(!fx.manager.has_lft(&fx.root).await);
    assert!(cache::list_cache_files(fx.manager.cache_dir(), None, false).is_empty());
}

#[tokio::test]
async fn test_busy_not_ready_and_cancel() {
    let fx = fixture();
    // A tree big enough that the build is still running when we poke it.
    for d in 0..40 {
        let dir = fx.root.join(format!("dir{d:02}"));
        fs::create_dir(&dir).unwrap();
        for f in 0..100 {
            fs::write(dir.join(format!("file{f:03}")), b"").unwrap();
        }
    }
    let events = fx.manager.subscribe();
    fx.manager.add_path(&fx.root, false).await.unwrap();
    assert!(fx.manager.lft_building(&fx.root).await);
    assert!(matches!(fx.manager.add_path(&fx.root, false).await, Err(Error::Busy)));
    assert!(matches!(fx.manager.search(&fx.root, "x", false).await, Err(Error::NotReady)));

    assert!(fx.manager.cancel_build(&fx.root).await);
    assert!(!fx.manager.lft_building(&fx.root).await);
    assert!(!fx.manager.has_lft(&fx.root).await);

    // The finished signal still fires, reporting no installed buffer.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("no completion signal")
            .unwrap();
        if let Event::AddPathFinished { path, ok } = event {
            assert_eq!(path, fx.root);
            assert!(!ok);
            break;
        }
    }
}

#[tokio::test]
async fn test_change_event_waits_for_build() {
    let fx = fixture();
    populate_sample(&fx.root);
    for f in 0..2000 {
        fs::write(fx.root.join(format!("bulk{f:04}")), b"").unwrap();
    }
    fs::write(fx.root.join("sub/late.txt"), b"").unwrap();

    fx.manager.add_path(&fx.root, false).await.unwrap();
    // Arrives while the build is (very likely) still in flight; it must
    // await completion and then apply. If the walk already picked the file
    // up, the insert is a no-op; either way the name is searchable after.
    fx.manager.insert_file(&fx.root.join("sub/late.txt")).await;
    let results = fx.manager.search(&fx.root, "late.txt", false).await;
    match results {
        Ok(paths) => assert_eq!(paths, vec![fx.root.join("sub/late.txt")]),
        Err(err) => panic!("index not ready after awaited build: {err:?}"),
    }
}

#[tokio::test]
async fn test_policy_toggle_discards_auto_index() {
    let fx = fixture();
    populate_sample(&fx.root);
    assert!(fx.manager.auto_index_internal().await);
    assert!(!fx.manager.auto_index_external().await);
    assert!(build_and_wait(&fx.manager, &fx.root, true).await);

    let events = fx.manager.subscribe();
    fx.manager.set_auto_index_internal(false).await;
    assert!(!fx.manager.has_lft(&fx.root).await);
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no policy signal")
            .unwrap();
        if let Event::AutoIndexInternalChanged(value) = event {
            assert!(!value);
            break;
        }
    }

    // Toggling back on schedules a fresh automatic build.
    fx.manager.set_auto_index_internal(true).await;
    assert!(fx.manager.lft_building(&fx.root).await || fx.manager.has_lft(&fx.root).await);
}

#[tokio::test]
async fn test_mount_removed_syncs_and_drops() {
    let fx = fixture();
    populate_sample(&fx.root);
    assert!(build_and_wait(&fx.manager, &fx.root, false).await);

    fx.manager
        .handle_mount_event(MountEvent::MountRemoved {
            device: "/dev/fake1".into(),
            mount_point: fx.root.clone(),
        })
        .await;
    assert!(!fx.manager.has_lft(&fx.root).await);
    // The buffer was dirty (fresh build) and got flushed on the way out.
    assert_eq!(cache::list_cache_files(fx.manager.cache_dir(), None, false).len(), 1);
}

#[tokio::test]
async fn test_crash_recovery_discards_auto_keeps_user() {
    let fx = fixture();
    populate_sample(&fx.root);
    let cache_dir = fx.manager.cache_dir().to_path_buf();
    fs::create_dir_all(&cache_dir).unwrap();

    // A user-created index for the mounted partition.
    let mut buf = FsBuf::new(1024, fx.root.as_os_str().as_bytes()).unwrap();
    buf.insert_path(fx.root.join("a.txt").as_os_str().as_bytes(), false).unwrap();
    let user_file = cache_dir.join(cache::cache_file_name(b"serial:fake-uuid/", false));
    buf.save(&user_file).unwrap();

    // A leftover auto-created index, and the sentinel of a crashed run.
    let auto_file = cache_dir.join(cache::cache_file_name(b"serial:other-uuid/", true));
    fs::write(&auto_file, b"whatever, it goes away unopened").unwrap();
    cache::create_sentinel(&cache_dir).unwrap();

    fx.manager.start().await;

    assert!(!auto_file.exists(), "auto-created cache must be dropped after a crash");
    assert!(user_file.exists(), "user-created cache must survive");
    assert!(fx.manager.has_lft(&fx.root).await);
    let results = fx.manager.search(&fx.root, "a.txt", false).await.unwrap();
    assert_eq!(results, vec![fx.root.join("a.txt")]);

    fx.manager.shutdown().await;
    assert!(!cache_dir.join(cache::SENTINEL_FILE).exists());
}

#[tokio::test]
async fn test_refresh_rebuilds_malformed_cache() {
    let fx = fixture();
    populate_sample(&fx.root);
    let cache_dir = fx.manager.cache_dir().to_path_buf();
    fs::create_dir_all(&cache_dir).unwrap();

    let broken = cache_dir.join(cache::cache_file_name(b"serial:fake-uuid/", false));
    fs::write(&broken, b"garbage").unwrap();

    let events = fx.manager.subscribe();
    let installed = fx.manager.refresh(None).await;
    assert!(installed.is_empty());
    assert!(!broken.exists(), "malformed cache file must be deleted");

    // The partition is mounted, so a rebuild was scheduled.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("rebuild did not finish")
            .unwrap();
        if let Event::AddPathFinished { path, ok } = event {
            assert_eq!(path, fx.root);
            assert!(ok);
            break;
        }
    }
    assert!(fx.manager.has_lft(&fx.root).await);
}

#[tokio::test]
async fn test_refresh_skips_unmounted_partitions() {
    let fx = fixture();
    let cache_dir = fx.manager.cache_dir().to_path_buf();
    fs::create_dir_all(&cache_dir).unwrap();
    let foreign = cache_dir.join(cache::cache_file_name(b"serial:unknown-uuid/", false));
    fs::write(&foreign, b"left alone").unwrap();

    let installed = fx.manager.refresh(None).await;
    assert!(installed.is_empty());
    assert!(foreign.exists(), "files of absent partitions stay untouched");
}
