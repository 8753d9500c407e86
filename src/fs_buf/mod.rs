//! Compact serialized tree of filesystem names --- [`FsBuf`].
//!
//! An [`FsBuf`] owns one contiguous byte region holding a rooted directory
//! tree in preorder: the root path (NUL terminated) at offset 0, then one
//! name record per entry, siblings ordered by unsigned byte-wise name
//! comparison. The layout supports linear scans with a resumable cursor,
//! subtree range extraction and in-place insert/remove/rename, which is
//! what keeps interactive searches over millions of names in the
//! millisecond range.

mod record;
mod serialize;

#[cfg(test)]
mod tests;

pub use record::{Record, RecordKind};
pub use serialize::{MAGIC, VERSION};

use std::cmp::Ordering;
use std::fmt;
use std::io;

use record::SENTINEL_LEN;

/// Result of [`FsBuf`] operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Default region capacity for freshly built buffers (16 MiB).
pub const DEFAULT_CAPACITY: u32 = 1 << 24;

/// Hard ceiling on the region size; offsets are 32-bit.
pub const MAX_CAPACITY: u64 = 1 << 32;

/// Upper bound on reconstructed absolute paths.
#[cfg(target_os = "linux")]
pub const MAX_PATH: usize = libc::PATH_MAX as usize;
#[cfg(not(target_os = "linux"))]
pub const MAX_PATH: usize = 4096;

/// [`FsBuf`] errors.
#[derive(Debug)]
pub enum Error {
    /// The region would grow past 4 GiB, or the allocation itself failed.
    OutOfMemory,
    /// The parent directory of an inserted path is not in the tree.
    ParentMissing,
    /// The inserted path is already in the tree.
    AlreadyExists,
    /// The target path is not in the tree.
    NotFound,
    /// A reconstructed path or a single name exceeds the supported length.
    PathTooLong,
    /// Cache file I/O failed.
    Io(io::Error),
    /// The cache file does not start with the expected magic tag.
    BadMagic,
    /// The cache file was written by an incompatible format version.
    VersionMismatch,
    /// The cache file or the region itself is cut short or malformed.
    Truncated,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// One structural edit applied to the region by a mutation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FsChange {
    pub op: ChangeOp,
    /// Record offset the edit applies to; removals report pre-edit offsets.
    pub offset: u32,
}

/// Kind of a [`FsChange`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Remove,
    Rename,
}

/// Resolved subtree of a query path.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PathRange {
    /// Offset of the resolved record; `0` for the root itself.
    pub offset: u32,
    /// First byte of the descendant range.
    pub start: u32,
    /// One past the last byte of the descendant range.
    pub end: u32,
}

impl PathRange {
    /// True when the range holds no scannable records (files, empty root).
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Preorder tree of filesystem names backed by one owned byte region.
pub struct FsBuf {
    data: Vec<u8>,
    tail: u32,
    first_name: u32,
}

impl fmt::Debug for FsBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsBuf")
            .field("root_path", &String::from_utf8_lossy(self.root_path()))
            .field("tail", &self.tail)
            .field("capacity", &self.data.len())
            .finish()
    }
}

impl FsBuf {
    /// Allocates a region of at least `capacity` bytes rooted at `root_path`.
    ///
    /// The root path is normalized to carry no trailing slash (except `/`).
    pub fn new(capacity: u32, root_path: &[u8]) -> Result<FsBuf> {
        let root = normalize_root(root_path);
        let first_name = root.len() as u32 + 1;
        let capacity = capacity.max(first_name) as usize;
        let mut data = Vec::new();
        data.try_reserve_exact(capacity).map_err(|_| Error::OutOfMemory)?;
        data.resize(capacity, 0);
        data[..root.len()].copy_from_slice(root);
        data[root.len()] = 0;
        Ok(FsBuf { data, tail: first_name, first_name })
    }

    /// Absolute path of the tree's root.
    pub fn root_path(&self) -> &[u8] {
        &self.data[..(self.first_name - 1) as usize]
    }

    /// One past the last used byte of the region.
    pub fn tail(&self) -> u32 {
        self.tail
    }

    /// Offset of the first name record.
    pub fn first_name(&self) -> u32 {
        self.first_name
    }

    /// Allocated region size in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// True when the tree holds the root only.
    pub fn is_empty(&self) -> bool {
        self.tail == self.first_name
    }

    fn region(&self) -> &[u8] {
        &self.data[..self.tail as usize]
    }

    /// Decodes the record at `off`; offsets come from [`Self::path_range`]
    /// and [`Self::search_files`].
    pub fn record(&self, off: u32) -> Result<Record<'_>> {
        record::decode(self.region(), off)
    }

    /// Kind, parent back-link and encoded length of the record at `off`.
    fn record_meta(&self, off: u32) -> Result<(RecordKind, u32, u32)> {
        let rec = self.record(off)?;
        Ok((rec.kind, rec.parent, rec.encoded_len()))
    }

    /// Offset of the sibling following the record at `off`, skipping the
    /// record's whole subtree when it is a directory.
    fn next_sibling(&self, off: u32) -> Result<u32> {
        let (kind, _, len) = self.record_meta(off)?;
        match kind {
            RecordKind::Directory => Ok(self.children_end(off + len)? + SENTINEL_LEN),
            _ => Ok(off + len),
        }
    }

    /// Scans from the first child at `off` to the offset of the sentinel
    /// closing the enclosing directory. The root's child list has no
    /// sentinel and runs into `tail` instead.
    fn children_end(&self, mut off: u32) -> Result<u32> {
        let mut depth = 0u32;
        while off < self.tail {
            let (kind, _, len) = self.record_meta(off)?;
            match kind {
                RecordKind::Directory => depth += 1,
                RecordKind::EndOfChildren => {
                    if depth == 0 {
                        return Ok(off);
                    }
                    depth -= 1;
                }
                RecordKind::File => {}
            }
            off += len;
        }
        Ok(off)
    }

    /// Child-list range `[start, end)` of the directory record at `off`
    /// (`0` addresses the root).
    fn children_range(&self, off: u32) -> Result<(u32, u32)> {
        if off == 0 {
            return Ok((self.first_name, self.tail));
        }
        let (kind, _, len) = self.record_meta(off)?;
        if kind != RecordKind::Directory {
            return Err(Error::NotFound);
        }
        let start = off + len;
        Ok((start, self.children_end(start)?))
    }

    /// Part of `path` below the root, with the separator trimmed.
    /// `None` when `path` does not lie under the root.
    fn strip_root<'a>(&self, path: &'a [u8]) -> Option<&'a [u8]> {
        let root = self.root_path();
        if !path.starts_with(root) {
            return None;
        }
        let rest = &path[root.len()..];
        if rest.is_empty() || root == b"/" {
            return Some(rest);
        }
        if rest[0] != b'/' {
            return None;
        }
        Some(&rest[1..])
    }

    /// Record offset of the root-relative path `rel`; `Some(0)` addresses
    /// the root itself.
    fn find_rel_record(&self, rel: &[u8]) -> Result<Option<u32>> {
        let mut components = rel.split(|b| *b == b'/').filter(|c| !c.is_empty()).peekable();
        if components.peek().is_none() {
            return Ok(Some(0));
        }
        let (mut start, mut end) = self.children_range(0)?;
        let mut found = 0u32;
        while let Some(component) = components.next() {
            let mut hit = None;
            let mut off = start;
            while off < end {
                let rec = self.record(off)?;
                match rec.name.cmp(component) {
                    Ordering::Equal => {
                        hit = Some((off, rec.kind, rec.encoded_len()));
                        break;
                    }
                    Ordering::Greater => break,
                    Ordering::Less => {}
                }
                off = self.next_sibling(off)?;
            }
            let Some((off, kind, len)) = hit else { return Ok(None) };
            if components.peek().is_some() {
                if kind != RecordKind::Directory {
                    return Ok(None);
                }
                start = off + len;
                end = self.children_end(start)?;
            } else {
                found = off;
            }
        }
        Ok(Some(found))
    }

    /// Record offset of an absolute `path`; `Some(0)` addresses the root.
    pub fn find_record(&self, path: &[u8]) -> Result<Option<u32>> {
        match self.strip_root(path) {
            Some(rel) => self.find_rel_record(trim_slashes(rel)),
            None => Ok(None),
        }
    }

    /// Resolves `query_path` to its record and descendant byte range.
    ///
    /// A directory's range covers its whole subtree including the closing
    /// sentinel; a file yields an empty range; a missing path yields `None`.
    pub fn path_range(&self, query_path: &[u8]) -> Result<Option<PathRange>> {
        let Some(off) = self.find_record(query_path)? else { return Ok(None) };
        if off == 0 {
            return Ok(Some(PathRange { offset: 0, start: self.first_name, end: self.tail }));
        }
        let (kind, _, len) = self.record_meta(off)?;
        match kind {
            RecordKind::Directory => {
                let start = off + len;
                let end = self.children_end(start)? + SENTINEL_LEN;
                Ok(Some(PathRange { offset: off, start, end }))
            }
            _ => Ok(Some(PathRange { offset: off, start: off + len, end: off + len })),
        }
    }

    /// Reconstructs the absolute path of the record at `name_off` by
    /// walking parent back-links.
    pub fn path_by_offset(&self, name_off: u32) -> Result<Vec<u8>> {
        if name_off < self.first_name || name_off >= self.tail {
            return Err(Error::NotFound);
        }
        let mut parts = Vec::new();
        let mut total = self.root_path().len();
        let mut off = name_off;
        loop {
            let rec = self.record(off)?;
            if rec.kind == RecordKind::EndOfChildren {
                return Err(Error::NotFound);
            }
            parts.push(rec.name);
            total += rec.name.len() + 1;
            if rec.parent == 0 {
                break;
            }
            if rec.parent >= off {
                return Err(Error::Truncated);
            }
            off = rec.parent;
        }
        if total > MAX_PATH {
            return Err(Error::PathTooLong);
        }
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(self.root_path());
        for name in parts.iter().rev() {
            if out.last() != Some(&b'/') {
                out.push(b'/');
            }
            out.extend_from_slice(name);
        }
        Ok(out)
    }

    /// Scans records in `[cursor, end)`, collecting offsets of records whose
    /// name satisfies `matches`, at most `limit` of them.
    ///
    /// The scan also stops when `progress` returns `true`. On return the
    /// cursor points at the next unexamined offset, so repeated calls with
    /// the updated cursor resume exactly where the previous one stopped.
    pub fn search_files(
        &self,
        cursor: &mut u32,
        end: u32,
        limit: usize,
        mut matches: impl FnMut(&[u8]) -> bool,
        mut progress: impl FnMut(u32) -> bool,
    ) -> Result<Vec<u32>> {
        let end = end.min(self.tail);
        let mut out = Vec::new();
        let mut off = (*cursor).max(self.first_name);
        while off < end && out.len() < limit {
            if progress(out.len() as u32) {
                break;
            }
            let rec = self.record(off)?;
            if rec.kind != RecordKind::EndOfChildren && matches(rec.name) {
                out.push(off);
            }
            off += rec.encoded_len();
        }
        *cursor = off;
        Ok(out)
    }

    /// Inserts `path` as a file or directory. The parent must already be in
    /// the tree; the new record lands at its byte-ordered sibling position.
    pub fn insert_path(&mut self, path: &[u8], is_dir: bool) -> Result<FsChange> {
        let (parent_off, name) = self.split_parent(path)?;
        if name.is_empty() || name.len() > u16::MAX as usize {
            return Err(Error::PathTooLong);
        }
        let (start, end) = self.children_range(parent_off)?;
        let mut insert_off = end;
        let mut off = start;
        while off < end {
            let rec = self.record(off)?;
            match rec.name.cmp(name) {
                Ordering::Equal => return Err(Error::AlreadyExists),
                Ordering::Greater => {
                    insert_off = off;
                    break;
                }
                Ordering::Less => {}
            }
            off = self.next_sibling(off)?;
        }
        let rec_len = record::record_len(name.len());
        let needed = rec_len + if is_dir { SENTINEL_LEN } else { 0 };
        self.shift_right(insert_off, needed)?;
        let kind = if is_dir { RecordKind::Directory } else { RecordKind::File };
        let at = insert_off as usize;
        record::encode(&mut self.data[at..at + rec_len as usize], kind, parent_off, name);
        if is_dir {
            let s = at + rec_len as usize;
            record::encode(
                &mut self.data[s..s + SENTINEL_LEN as usize],
                RecordKind::EndOfChildren,
                insert_off,
                b"",
            );
        }
        Ok(FsChange { op: ChangeOp::Insert, offset: insert_off })
    }

    /// Removes `path`; a directory goes together with all its descendants.
    ///
    /// Returns the applied edits outer-first, truncated to `change_limit`;
    /// the removal itself always completes in full.
    pub fn remove_path(&mut self, path: &[u8], change_limit: usize) -> Result<Vec<FsChange>> {
        let off = self.find_record(path)?.ok_or(Error::NotFound)?;
        if off == 0 {
            return Err(Error::NotFound);
        }
        let (kind, _, len) = self.record_meta(off)?;
        let mut changes = vec![FsChange { op: ChangeOp::Remove, offset: off }];
        let span_end = match kind {
            RecordKind::Directory => {
                let children_end = self.children_end(off + len)?;
                let mut o = off + len;
                while o < children_end && changes.len() < change_limit {
                    let (k, _, l) = self.record_meta(o)?;
                    if k != RecordKind::EndOfChildren {
                        changes.push(FsChange { op: ChangeOp::Remove, offset: o });
                    }
                    o += l;
                }
                children_end + SENTINEL_LEN
            }
            _ => off + len,
        };
        changes.truncate(change_limit);
        self.shift_left(off, span_end)?;
        Ok(changes)
    }

    /// Renames `old_path` to `new_path`; both must lie under this root.
    ///
    /// A same-parent rename that keeps the sibling order is done in place;
    /// anything else is a removal plus re-insertion (a directory's
    /// descendants are re-inserted under the new name).
    pub fn rename_path(
        &mut self,
        old_path: &[u8],
        new_path: &[u8],
        change_limit: usize,
    ) -> Result<Vec<FsChange>> {
        let old_off = self.find_record(old_path)?.ok_or(Error::NotFound)?;
        if old_off == 0 {
            return Err(Error::NotFound);
        }
        if self.find_record(new_path)?.is_some() {
            return Err(Error::AlreadyExists);
        }
        let (new_parent, new_name) = self.split_parent(new_path)?;
        if new_name.is_empty() || new_name.len() > u16::MAX as usize {
            return Err(Error::PathTooLong);
        }
        let (kind, old_parent, _) = self.record_meta(old_off)?;
        if new_parent == old_parent && self.order_preserved(old_off, new_name)? {
            self.rename_in_place(old_off, new_name)?;
            return Ok(vec![FsChange { op: ChangeOp::Rename, offset: old_off }]);
        }
        let mut descendants = Vec::new();
        if kind == RecordKind::Directory {
            self.collect_subtree(old_off, &mut descendants)?;
        }
        // Reserve up front so the re-insertion cannot fail halfway through.
        let extra = record::record_len(new_name.len()) as u64 + SENTINEL_LEN as u64;
        self.ensure_capacity(self.tail as u64 + extra)?;
        let mut changes = self.remove_path(old_path, change_limit)?;
        let inserted = self.insert_path(new_path, kind == RecordKind::Directory)?;
        if changes.len() < change_limit {
            changes.push(inserted);
        }
        for (rel, is_dir) in descendants {
            let mut path = new_path.to_vec();
            path.push(b'/');
            path.extend_from_slice(&rel);
            let change = self.insert_path(&path, is_dir)?;
            if changes.len() < change_limit {
                changes.push(change);
            }
        }
        Ok(changes)
    }

    /// Appends a record at `tail`; the walker drives this in preorder with
    /// siblings pre-sorted, keeping the ordering invariant intact.
    pub(crate) fn append_entry(&mut self, parent: u32, name: &[u8], is_dir: bool) -> Result<u32> {
        if name.is_empty() || name.len() > u16::MAX as usize {
            return Err(Error::PathTooLong);
        }
        let off = self.tail;
        let len = record::record_len(name.len());
        let new_tail = off as u64 + len as u64;
        if new_tail > u32::MAX as u64 {
            return Err(Error::OutOfMemory);
        }
        self.ensure_capacity(new_tail)?;
        let kind = if is_dir { RecordKind::Directory } else { RecordKind::File };
        record::encode(&mut self.data[off as usize..new_tail as usize], kind, parent, name);
        self.tail = new_tail as u32;
        Ok(off)
    }

    /// Appends the sentinel closing the child list of the directory record
    /// at `dir_off`.
    pub(crate) fn close_dir(&mut self, dir_off: u32) -> Result<()> {
        let off = self.tail;
        let new_tail = off as u64 + SENTINEL_LEN as u64;
        if new_tail > u32::MAX as u64 {
            return Err(Error::OutOfMemory);
        }
        self.ensure_capacity(new_tail)?;
        record::encode(
            &mut self.data[off as usize..new_tail as usize],
            RecordKind::EndOfChildren,
            dir_off,
            b"",
        );
        self.tail = new_tail as u32;
        Ok(())
    }

    /// Parent record offset and final name component of `path`.
    fn split_parent<'a>(&self, path: &'a [u8]) -> Result<(u32, &'a [u8])> {
        let rel = self.strip_root(path).ok_or(Error::ParentMissing)?;
        let rel = trim_slashes(rel);
        if rel.is_empty() {
            return Err(Error::AlreadyExists);
        }
        let (parent_rel, name) = match rel.iter().rposition(|b| *b == b'/') {
            Some(pos) => (&rel[..pos], &rel[pos + 1..]),
            None => (&rel[..0], rel),
        };
        let parent_off = self.find_rel_record(parent_rel)?.ok_or(Error::ParentMissing)?;
        if parent_off != 0 {
            let (kind, _, _) = self.record_meta(parent_off)?;
            if kind != RecordKind::Directory {
                return Err(Error::ParentMissing);
            }
        }
        Ok((parent_off, name))
    }

    /// True when renaming the record at `off` to `new_name` keeps it between
    /// its current neighbors in sibling order.
    fn order_preserved(&self, off: u32, new_name: &[u8]) -> Result<bool> {
        let (_, parent, _) = self.record_meta(off)?;
        let (start, end) = self.children_range(parent)?;
        let mut prev = None;
        let mut cur = start;
        while cur < end && cur != off {
            prev = Some(cur);
            cur = self.next_sibling(cur)?;
        }
        if cur != off {
            return Err(Error::NotFound);
        }
        if let Some(prev) = prev {
            if self.record(prev)?.name >= new_name {
                return Ok(false);
            }
        }
        let next = self.next_sibling(off)?;
        if next < end && self.record(next)?.name <= new_name {
            return Ok(false);
        }
        Ok(true)
    }

    /// Rewrites the name of the record at `off`, shifting the suffix of the
    /// region when the encoded size changes.
    fn rename_in_place(&mut self, off: u32, new_name: &[u8]) -> Result<()> {
        let (kind, parent, old_len) = self.record_meta(off)?;
        let new_len = record::record_len(new_name.len());
        let old_end = off + old_len;
        let new_end = off + new_len;
        if new_len > old_len {
            let delta = new_len - old_len;
            let new_tail = self.tail as u64 + delta as u64;
            if new_tail > u32::MAX as u64 {
                return Err(Error::OutOfMemory);
            }
            self.ensure_capacity(new_tail)?;
            self.data.copy_within(old_end as usize..self.tail as usize, new_end as usize);
            self.tail = new_tail as u32;
            record::encode(&mut self.data[off as usize..new_end as usize], kind, parent, new_name);
            self.adjust_parents(new_end, |p| if p >= old_end { p + delta } else { p })?;
        } else if new_len < old_len {
            let delta = old_len - new_len;
            self.data.copy_within(old_end as usize..self.tail as usize, new_end as usize);
            self.tail -= delta;
            record::encode(&mut self.data[off as usize..new_end as usize], kind, parent, new_name);
            self.adjust_parents(new_end, |p| if p >= old_end { p - delta } else { p })?;
        } else {
            let names_at = off as usize + record::RECORD_HEADER_LEN as usize;
            self.data[names_at..new_end as usize].copy_from_slice(new_name);
        }
        Ok(())
    }

    /// Root-relative paths of all descendants of the directory at `dir_off`,
    /// in preorder, relative to that directory.
    fn collect_subtree(&self, dir_off: u32, out: &mut Vec<(Vec<u8>, bool)>) -> Result<()> {
        let (start, end) = self.children_range(dir_off)?;
        let mut prefix: Vec<Vec<u8>> = Vec::new();
        let mut off = start;
        while off < end {
            let rec = self.record(off)?;
            match rec.kind {
                RecordKind::EndOfChildren => {
                    prefix.pop();
                    off += SENTINEL_LEN;
                }
                _ => {
                    let mut rel = Vec::new();
                    for component in &prefix {
                        rel.extend_from_slice(component);
                        rel.push(b'/');
                    }
                    rel.extend_from_slice(rec.name);
                    let is_dir = rec.kind == RecordKind::Directory;
                    out.push((rel, is_dir));
                    let len = rec.encoded_len();
                    if is_dir {
                        prefix.push(rec.name.to_vec());
                    }
                    off += len;
                }
            }
        }
        Ok(())
    }

    /// Opens a `by`-byte gap at `at`, fixing back-links of shifted records.
    fn shift_right(&mut self, at: u32, by: u32) -> Result<()> {
        let new_tail = self.tail as u64 + by as u64;
        if new_tail > u32::MAX as u64 {
            return Err(Error::OutOfMemory);
        }
        self.ensure_capacity(new_tail)?;
        self.data.copy_within(at as usize..self.tail as usize, (at + by) as usize);
        self.tail = new_tail as u32;
        self.adjust_parents(at + by, |p| if p >= at { p + by } else { p })
    }

    /// Closes the `[start, end)` gap, fixing back-links of shifted records.
    fn shift_left(&mut self, start: u32, end: u32) -> Result<()> {
        let by = end - start;
        self.data.copy_within(end as usize..self.tail as usize, start as usize);
        self.tail -= by;
        self.adjust_parents(start, |p| if p >= end { p - by } else { p })
    }

    /// Applies `f` to the parent back-link of every record in `[off, tail)`.
    fn adjust_parents(&mut self, mut off: u32, f: impl Fn(u32) -> u32) -> Result<()> {
        while off < self.tail {
            let (_, parent, len) = self.record_meta(off)?;
            let adjusted = f(parent);
            if adjusted != parent {
                record::set_parent(&mut self.data, off, adjusted);
            }
            off += len;
        }
        Ok(())
    }

    /// Grows the region geometrically until `needed` bytes fit, capped at
    /// [`MAX_CAPACITY`].
    fn ensure_capacity(&mut self, needed: u64) -> Result<()> {
        if needed <= self.data.len() as u64 {
            return Ok(());
        }
        if needed > MAX_CAPACITY {
            return Err(Error::OutOfMemory);
        }
        let mut capacity = (self.data.len() as u64).max(1);
        while capacity < needed {
            capacity *= 2;
        }
        let capacity = capacity.min(MAX_CAPACITY) as usize;
        let extra = capacity - self.data.len();
        self.data.try_reserve_exact(extra).map_err(|_| Error::OutOfMemory)?;
        self.data.resize(capacity, 0);
        Ok(())
    }
}

/// Strips trailing slashes; the root path `/` keeps its single slash.
fn normalize_root(root: &[u8]) -> &[u8] {
    let mut end = root.len();
    while end > 1 && root[end - 1] == b'/' {
        end -= 1;
    }
    &root[..end]
}

/// Trims leading and trailing slashes of a root-relative path.
fn trim_slashes(mut rel: &[u8]) -> &[u8] {
    while rel.first() == Some(&b'/') {
        rel = &rel[1..];
    }
    while rel.last() == Some(&b'/') {
        rel = &rel[..rel.len() - 1];
    }
    rel
}
