//! Cache-directory bookkeeping: file naming, the startup sentinel and the
//! settings store.
//!
//! Cache files carry the percent-encoded serial URI of their root as the
//! filename, so a file can be matched back to its partition without being
//! opened. The extension tells the origin apart: `.lft` for user-requested
//! indexes, `.LFT` for automatically created ones; readers accept both.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Organization segment of the cache paths.
pub const ORG_NAME: &str = "deepin";

const CACHE_SUBDIR: &str = "deepin-anything";

/// Extension of user-requested index files.
pub const USER_EXT: &str = "lft";

/// Extension of automatically created index files.
pub const AUTO_EXT: &str = "LFT";

/// Sentinel created at startup and removed on clean shutdown.
pub const SENTINEL_FILE: &str = "app.running";

/// Settings file name inside the cache directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Resolves the cache directory: the system-wide location when writable
/// (the usual case for root), else the per-user cache, else `/tmp`.
pub fn resolve_cache_dir() -> PathBuf {
    let system = PathBuf::from(format!("/var/cache/{ORG_NAME}/{CACHE_SUBDIR}"));
    if dir_writable(&system) {
        return system;
    }
    if let Some(user) = user_cache_dir() {
        let dir = user.join(CACHE_SUBDIR);
        if dir_writable(&dir) {
            return dir;
        }
    }
    PathBuf::from(format!("/tmp/{ORG_NAME}/{CACHE_SUBDIR}"))
}

fn dir_writable(dir: &Path) -> bool {
    if fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(".probe");
    match fs::OpenOptions::new().write(true).create(true).open(&probe) {
        Ok(_) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

fn user_cache_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CACHE_HOME") {
        if !dir.is_empty() {
            return Some(PathBuf::from(dir));
        }
    }
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(|home| PathBuf::from(home).join(".cache"))
}

/// Percent-encodes a serial URI for use as a filename. `:` stays literal;
/// `/` and everything else outside the unreserved set is encoded.
pub fn encode_cache_name(uri: &[u8]) -> String {
    let mut out = String::with_capacity(uri.len());
    for &byte in uri {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~' | b':') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Reverses [`encode_cache_name`]; malformed escapes pass through verbatim.
pub fn decode_cache_name(name: &str) -> Vec<u8> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(value) =
                name.get(i + 1..i + 3).and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// Cache filename (without directory) for a serial URI and origin.
pub fn cache_file_name(uri: &[u8], auto_index: bool) -> String {
    let ext = if auto_index { AUTO_EXT } else { USER_EXT };
    format!("{}.{ext}", encode_cache_name(uri))
}

/// True when `path` names an automatically created index file.
pub fn is_auto_cache_file(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == AUTO_EXT)
}

/// Serial URI a cache file was written for.
pub fn uri_of_cache_file(path: &Path) -> Vec<u8> {
    let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
        return Vec::new();
    };
    decode_cache_name(stem)
}

/// Index files inside `dir`, optionally restricted to those whose serial
/// URI starts with `uri_prefix`, and to auto-created ones.
pub fn list_cache_files(dir: &Path, uri_prefix: Option<&[u8]>, auto_only: bool) -> Vec<PathBuf> {
    let prefix = uri_prefix.map(encode_cache_name);
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let stem = if let Some(stem) = name.strip_suffix(".LFT") {
            stem
        } else if let Some(stem) = name.strip_suffix(".lft") {
            if auto_only {
                continue;
            }
            stem
        } else {
            continue;
        };
        if let Some(prefix) = &prefix {
            if !stem.starts_with(prefix.as_str()) {
                continue;
            }
        }
        out.push(entry.path());
    }
    out.sort();
    out
}

/// Creates the startup sentinel. Returns `true` when it already existed,
/// meaning the previous run did not shut down cleanly.
pub fn create_sentinel(dir: &Path) -> io::Result<bool> {
    let path = dir.join(SENTINEL_FILE);
    let existed = path.exists();
    if !existed {
        fs::File::create(&path)?;
    }
    Ok(existed)
}

/// Removes the startup sentinel, marking a clean shutdown.
pub fn remove_sentinel(dir: &Path) {
    let _ = fs::remove_file(dir.join(SENTINEL_FILE));
}

/// Daemon settings. Keys this build does not recognize survive a
/// load/save round trip untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Auto-build indexes for internal (non-removable) partitions.
    #[serde(rename = "autoIndexInternal", default = "default_true")]
    pub auto_index_internal: bool,
    /// Auto-build indexes for removable partitions.
    #[serde(rename = "autoIndexExternal", default)]
    pub auto_index_external: bool,
    #[serde(flatten)]
    extra: toml::map::Map<String, toml::Value>,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            auto_index_internal: true,
            auto_index_external: false,
            extra: toml::map::Map::new(),
        }
    }
}

impl Settings {
    /// Loads settings from `path`; missing or malformed files yield the
    /// defaults.
    pub fn load(path: &Path) -> Settings {
        match fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text).unwrap_or_else(|err| {
                warn!(path = %path.display(), ?err, "malformed settings, using defaults");
                Settings::default()
            }),
            Err(_) => {
                info!(path = %path.display(), "no settings file, using defaults");
                Settings::default()
            }
        }
    }

    /// Writes settings to `path`.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let text = toml::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(path, text)
    }
}
