use crate::fs_buf::tests::sample_buf;
use crate::fs_buf::FsBuf;

fn contains(name: &[u8], needle: &[u8]) -> bool {
    name.windows(needle.len()).any(|window| window.eq_ignore_ascii_case(needle))
}

fn search_all(buf: &FsBuf, needle: &[u8], batch: usize) -> Vec<String> {
    let range = buf.path_range(buf.root_path()).unwrap().unwrap();
    let mut cursor = range.start;
    let mut paths = Vec::new();
    loop {
        let offsets = buf
            .search_files(&mut cursor, range.end, batch, |name| contains(name, needle), |_| false)
            .unwrap();
        let done = offsets.len() < batch;
        for off in offsets {
            paths.push(String::from_utf8(buf.path_by_offset(off).unwrap()).unwrap());
        }
        if done || cursor >= range.end {
            break;
        }
    }
    paths
}

#[test]
fn test_search_matches_final_component() {
    let buf = sample_buf();
    assert_eq!(search_all(&buf, b"c.txt", 100), vec!["/tmp/t/sub/c.txt"]);
    assert_eq!(search_all(&buf, b"C.TXT", 100), vec!["/tmp/t/sub/c.txt"]);
    assert_eq!(search_all(&buf, b"txt", 100).len(), 3);
    assert!(search_all(&buf, b"nothing", 100).is_empty());
}

#[test]
fn test_search_matches_directory_names() {
    let buf = sample_buf();
    assert_eq!(search_all(&buf, b"sub", 100), vec!["/tmp/t/sub"]);
}

#[test]
fn test_search_within_subtree_only() {
    let buf = sample_buf();
    let range = buf.path_range(b"/tmp/t/sub").unwrap().unwrap();
    let mut cursor = range.start;
    let offsets = buf
        .search_files(&mut cursor, range.end, 100, |name| contains(name, b"txt"), |_| false)
        .unwrap();
    assert_eq!(offsets.len(), 1);
    assert_eq!(buf.path_by_offset(offsets[0]).unwrap(), b"/tmp/t/sub/c.txt");
}

#[test]
fn test_search_cursor_resumes_exactly() {
    let mut buf = FsBuf::new(4096, b"/r").unwrap();
    for i in 0..25 {
        buf.insert_path(format!("/r/f{i:02}").as_bytes(), false).unwrap();
    }
    let one_shot = search_all(&buf, b"f", 100);
    assert_eq!(one_shot.len(), 25);
    for batch in [1, 3, 7, 10] {
        assert_eq!(search_all(&buf, b"f", batch), one_shot, "batch size {batch}");
    }
}

#[test]
fn test_search_limit_is_respected() {
    let mut buf = FsBuf::new(4096, b"/r").unwrap();
    for i in 0..10 {
        buf.insert_path(format!("/r/f{i}").as_bytes(), false).unwrap();
    }
    let range = buf.path_range(b"/r").unwrap().unwrap();
    let mut cursor = range.start;
    let offsets = buf
        .search_files(&mut cursor, range.end, 4, |_| true, |_| false)
        .unwrap();
    assert_eq!(offsets.len(), 4);
    assert!(cursor < range.end);
}

#[test]
fn test_search_progress_abort_is_resumable() {
    let mut buf = FsBuf::new(4096, b"/r").unwrap();
    for i in 0..10 {
        buf.insert_path(format!("/r/f{i}").as_bytes(), false).unwrap();
    }
    let range = buf.path_range(b"/r").unwrap().unwrap();

    let mut cursor = range.start;
    let mut examined = 0u32;
    let first = buf
        .search_files(&mut cursor, range.end, 100, |_| true, |_| {
            examined += 1;
            examined > 4
        })
        .unwrap();
    assert_eq!(first.len(), 4);

    let rest = buf
        .search_files(&mut cursor, range.end, 100, |_| true, |_| false)
        .unwrap();
    assert_eq!(first.len() + rest.len(), 10);
    assert_eq!(cursor, range.end);
}
