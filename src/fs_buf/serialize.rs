//! Cache-file encoding of [`FsBuf`] --- save and load.
//!
//! Layout: 4-byte little-endian magic, 4-byte version, 4-byte root-path
//! length, the root-path bytes, 4-byte `tail`, then the region bytes
//! `[0, tail)` verbatim so record offsets survive a round trip unchanged.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{Error, FsBuf, Result, DEFAULT_CAPACITY, MAX_PATH};

/// Magic tag at offset 0 of every cache file ("LFTB").
pub const MAGIC: u32 = 0x4C46_5442;

/// Current cache-file format version.
pub const VERSION: u32 = 1;

impl FsBuf {
    /// Writes the buffer to `path` through a sibling temporary file, so a
    /// crash mid-write never leaves a half-written cache file behind.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = tmp_sibling(path);
        let result = (|| -> Result<()> {
            let mut dest = BufWriter::new(File::create(&tmp)?);
            dest.write_u32::<LittleEndian>(MAGIC)?;
            dest.write_u32::<LittleEndian>(VERSION)?;
            let root = self.root_path();
            dest.write_u32::<LittleEndian>(root.len() as u32)?;
            dest.write_all(root)?;
            dest.write_u32::<LittleEndian>(self.tail)?;
            dest.write_all(&self.data[..self.tail as usize])?;
            dest.flush()?;
            Ok(())
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
            return result;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Reads a buffer back from `path`, allocating
    /// `max(`[`DEFAULT_CAPACITY`]`, tail)` bytes for the region.
    pub fn load(path: &Path) -> Result<FsBuf> {
        let mut src = BufReader::new(File::open(path)?);
        let magic = src.read_u32::<LittleEndian>().map_err(short_read)?;
        if magic != MAGIC {
            return Err(Error::BadMagic);
        }
        let version = src.read_u32::<LittleEndian>().map_err(short_read)?;
        if version != VERSION {
            return Err(Error::VersionMismatch);
        }
        let root_len = src.read_u32::<LittleEndian>().map_err(short_read)? as usize;
        if root_len == 0 || root_len > MAX_PATH {
            return Err(Error::Truncated);
        }
        let mut root = vec![0u8; root_len];
        src.read_exact(&mut root).map_err(short_read)?;
        let tail = src.read_u32::<LittleEndian>().map_err(short_read)?;
        let first_name = root_len as u32 + 1;
        if tail < first_name {
            return Err(Error::Truncated);
        }
        let capacity = (DEFAULT_CAPACITY as u64).max(tail as u64) as usize;
        let mut data = Vec::new();
        data.try_reserve_exact(capacity).map_err(|_| Error::OutOfMemory)?;
        data.resize(capacity, 0);
        src.read_exact(&mut data[..tail as usize]).map_err(short_read)?;
        // The region must open with the advertised root path.
        if data[..root_len] != root[..] || data[root_len] != 0 {
            return Err(Error::Truncated);
        }
        Ok(FsBuf { data, tail, first_name })
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn short_read(err: std::io::Error) -> Error {
    if err.kind() == ErrorKind::UnexpectedEof {
        Error::Truncated
    } else {
        Error::Io(err)
    }
}
