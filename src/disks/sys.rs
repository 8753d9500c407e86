//! Bare procfs/sysfs implementation of [`DiskManager`].

use std::ffi::OsString;
use std::fs;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::{DiskManager, Partition};

/// Discovery over `/proc/self/mounts` and `/sys/class/block`, for hosts
/// where no block-device service is wired in.
#[derive(Debug, Default)]
pub struct SysDiskManager;

impl SysDiskManager {
    pub fn new() -> SysDiskManager {
        SysDiskManager
    }

    fn scan(&self) -> Vec<Partition> {
        let mounts = match fs::read_to_string("/proc/self/mounts") {
            Ok(mounts) => mounts,
            Err(err) => {
                debug!(?err, "cannot read the mount table");
                return Vec::new();
            }
        };
        let mut partitions: Vec<Partition> = Vec::new();
        for line in mounts.lines() {
            let mut fields = line.split_whitespace();
            let (Some(device), Some(mount)) = (fields.next(), fields.next()) else {
                continue;
            };
            if !device.starts_with("/dev/") {
                continue;
            }
            let mount = unescape_mount_path(mount);
            match partitions.iter_mut().find(|p| p.device == device) {
                Some(partition) => partition.mount_points.push(mount),
                None => {
                    let name = device.trim_start_matches("/dev/").replace('/', "!");
                    partitions.push(Partition {
                        device: device.to_string(),
                        stable_id: stable_id_for(device),
                        removable: is_removable(&name),
                        loop_device: name.starts_with("loop"),
                        mount_points: vec![mount],
                    });
                }
            }
        }
        for partition in &mut partitions {
            partition.mount_points.sort();
            partition.mount_points.dedup();
        }
        partitions
    }
}

#[async_trait]
impl DiskManager for SysDiskManager {
    async fn partitions(&self) -> Vec<Partition> {
        self.scan()
    }
}

/// `/proc/self/mounts` escapes whitespace as octal (`\040` etc.).
fn unescape_mount_path(raw: &str) -> PathBuf {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(value) =
                raw.get(i + 1..i + 4).and_then(|octal| u8::from_str_radix(octal, 8).ok())
            {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    PathBuf::from(OsString::from_vec(out))
}

/// UUID if the device has one, else its filesystem label, else a synthetic
/// identifier derived from the device name.
fn stable_id_for(device: &str) -> String {
    for dir in ["/dev/disk/by-uuid", "/dev/disk/by-label"] {
        if let Some(id) = link_id(dir, device) {
            return id;
        }
    }
    format!("dev-{}", device.trim_start_matches("/dev/").replace('/', "-"))
}

fn link_id(dir: &str, device: &str) -> Option<String> {
    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let Ok(target) = fs::canonicalize(entry.path()) else {
            continue;
        };
        if target.as_os_str() == device {
            return entry.file_name().to_str().map(str::to_string);
        }
    }
    None
}

fn is_removable(name: &str) -> bool {
    // The partition's own directory has no `removable` attribute; the
    // parent disk's does, reachable through the resolved symlink.
    for path in [
        format!("/sys/class/block/{name}/removable"),
        format!("/sys/class/block/{name}/../removable"),
    ] {
        if let Ok(value) = fs::read_to_string(&path) {
            return value.trim() == "1";
        }
    }
    false
}
