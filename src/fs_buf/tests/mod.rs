mod search;
mod serialize;

use super::FsBuf;

/// `/tmp/t` with `{ a.txt, b.txt, sub/, sub/c.txt }`.
pub(crate) fn sample_buf() -> FsBuf {
    let mut buf = FsBuf::new(1024, b"/tmp/t").unwrap();
    buf.insert_path(b"/tmp/t/a.txt", false).unwrap();
    buf.insert_path(b"/tmp/t/b.txt", false).unwrap();
    buf.insert_path(b"/tmp/t/sub", true).unwrap();
    buf.insert_path(b"/tmp/t/sub/c.txt", false).unwrap();
    buf
}

/// Every indexed path in region order (which is preorder).
pub(crate) fn all_paths(buf: &FsBuf) -> Vec<String> {
    let mut cursor = buf.first_name();
    let offsets = buf
        .search_files(&mut cursor, buf.tail(), usize::MAX, |_| true, |_| false)
        .unwrap();
    offsets
        .into_iter()
        .map(|off| String::from_utf8(buf.path_by_offset(off).unwrap()).unwrap())
        .collect()
}

/// The used record bytes, for bit-identity assertions.
pub(crate) fn record_bytes(buf: &FsBuf) -> Vec<u8> {
    buf.data[buf.first_name as usize..buf.tail as usize].to_vec()
}
