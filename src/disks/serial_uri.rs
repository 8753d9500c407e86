//! Mount-independent path identity: `serial:<stable-id>/<in-partition path>`.
//!
//! Two paths mapping to the same serial URI are aliases of the same data,
//! which is how bind mounts end up sharing one FS buffer.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use super::DiskManager;

/// Scheme prefix of every serial URI.
pub const SERIAL_URI_SCHEME: &[u8] = b"serial:";

/// Maps `path` to its serial URI; empty when no recognized partition
/// covers the path (virtual filesystems and the like).
pub async fn path_to_serial_uri(disks: &dyn DiskManager, path: &Path) -> Vec<u8> {
    let Some(partition) = disks.partition_for_path(path).await else {
        return Vec::new();
    };
    let Some(mount) = partition.covering_mount(path) else {
        return Vec::new();
    };
    let rel = path.strip_prefix(mount).unwrap_or_else(|_| Path::new(""));
    let mut uri = Vec::from(SERIAL_URI_SCHEME);
    uri.extend_from_slice(partition.stable_id.as_bytes());
    uri.push(b'/');
    uri.extend_from_slice(rel.as_os_str().as_bytes());
    uri
}

/// Expands a serial URI to every current absolute path it denotes, the
/// canonical (lexicographically lowest) one first. Empty when the
/// partition is not present.
pub async fn from_serial_uri(disks: &dyn DiskManager, uri: &[u8]) -> Vec<PathBuf> {
    let Some(rest) = uri.strip_prefix(SERIAL_URI_SCHEME) else {
        return Vec::new();
    };
    let (id, rel) = match rest.iter().position(|b| *b == b'/') {
        Some(pos) => (&rest[..pos], &rest[pos + 1..]),
        None => (rest, &rest[..0]),
    };
    let Ok(id) = std::str::from_utf8(id) else {
        return Vec::new();
    };
    let Some(partition) = disks.partition_by_id(id).await else {
        return Vec::new();
    };
    let mut paths = Vec::new();
    for mount in &partition.mount_points {
        let mut path = mount.clone();
        if !rel.is_empty() {
            path.push(Path::new(OsStr::from_bytes(rel)));
        }
        paths.push(path);
    }
    paths.sort();
    paths.dedup();
    paths
}
