//! Block-device discovery seam --- [`DiskManager`] --- and mount events.
//!
//! The discovery layer itself (udisks, a device daemon) lives outside this
//! crate; the index manager consumes it through the [`DiskManager`] trait
//! plus a [`MountEvent`] channel. [`SysDiskManager`] is a bare procfs/sysfs
//! implementation for hosts without a richer service.

mod serial_uri;
mod sys;

pub use serial_uri::{from_serial_uri, path_to_serial_uri, SERIAL_URI_SCHEME};
pub use sys::SysDiskManager;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// One mountable partition as reported by the discovery layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Kernel block-device path, e.g. `/dev/sda1`.
    pub device: String,
    /// Stable identifier: filesystem UUID, else label, else a synthetic id.
    pub stable_id: String,
    /// Whether the owning drive is removable.
    pub removable: bool,
    /// Loop devices are never auto-indexed.
    pub loop_device: bool,
    /// All current mount points, bind mounts included, sorted.
    pub mount_points: Vec<PathBuf>,
}

impl Partition {
    /// The mount point that is the longest prefix of `path`, if any.
    pub fn covering_mount(&self, path: &Path) -> Option<&PathBuf> {
        self.mount_points
            .iter()
            .filter(|mount| path.starts_with(mount))
            .max_by_key(|mount| mount.as_os_str().len())
    }
}

/// Mount and filesystem lifecycle events delivered to the index manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountEvent {
    MountAdded { device: String, mount_point: PathBuf },
    MountRemoved { device: String, mount_point: PathBuf },
    FilesystemAdded { device: String },
    FilesystemRemoved { device: String },
}

/// Interface to the block-device discovery layer.
#[async_trait]
pub trait DiskManager: Send + Sync {
    /// Snapshot of every currently known partition.
    async fn partitions(&self) -> Vec<Partition>;

    /// The partition whose mount point is the longest prefix of `path`.
    async fn partition_for_path(&self, path: &Path) -> Option<Partition> {
        let mut best: Option<(usize, Partition)> = None;
        for partition in self.partitions().await {
            if let Some(mount) = partition.covering_mount(path) {
                let len = mount.as_os_str().len();
                if best.as_ref().map_or(true, |(l, _)| len > *l) {
                    best = Some((len, partition.clone()));
                }
            }
        }
        best.map(|(_, partition)| partition)
    }

    /// The partition carrying the given stable identifier.
    async fn partition_by_id(&self, stable_id: &str) -> Option<Partition> {
        self.partitions().await.into_iter().find(|p| p.stable_id == stable_id)
    }
}
