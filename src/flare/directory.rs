//! Directory body encoding: an append-only sequence of NUL-terminated
//! entry names, seeded with `.` and `..`. Removal zeroes the removed
//! entry's bytes in place rather than compacting, so offsets into the
//! buffer stay stable across removes.

use crate::error::Result;
use std::fs;
use std::path::Path;

/// Maximum entries the extended-readdir response batches per reply.
pub const READDIR_BATCH: usize = 50;
/// Chunk size used by the legacy remote `opendir` read protocol.
pub const OPENDIR_CHUNK: usize = 50 * 1024;

/// Iterate every non-zero NUL-terminated run in `body`, in storage order.
pub fn iter_entries(body: &[u8]) -> impl Iterator<Item = &str> {
    body.split(|&b| b == 0).filter(|run| !run.is_empty()).filter_map(|run| std::str::from_utf8(run).ok())
}

/// Append `name` as a new NUL-terminated entry.
pub fn append_entry(body: &mut Vec<u8>, name: &str) {
    body.extend_from_slice(name.as_bytes());
    body.push(0);
}

/// Zero the bytes of the first entry matching `name`, keeping the buffer's
/// size stable. Returns whether an entry was found and removed.
pub fn remove_entry(body: &mut [u8], name: &str) -> bool {
    let target = name.as_bytes();
    let mut start = 0usize;
    for i in 0..=body.len() {
        if i == body.len() || body[i] == 0 {
            if i > start && &body[start..i] == target {
                for b in &mut body[start..i] {
                    *b = 0;
                }
                return true;
            }
            start = i + 1;
        }
    }
    false
}

/// Whether a directory body is empty of anything but `.` and `..`: any
/// non-zero byte past the initial four-byte prefix means non-empty.
pub fn is_empty_directory(body: &[u8]) -> bool {
    body.len() <= 4 || body[4..].iter().all(|&b| b == 0)
}

/// Read the full on-disk contents of a directory flare.
pub fn load_body(contents: &Path) -> Result<Vec<u8>> {
    Ok(fs::read(contents)?)
}

/// Overwrite the full on-disk contents of a directory flare.
pub fn save_body(contents: &Path, body: &[u8]) -> Result<()> {
    Ok(fs::write(contents, body)?)
}

/// `readdir(handle)`: from `offset`, skip zero runs, return the next
/// non-empty entry and the offset to resume from (just past its NUL).
pub fn next_entry(body: &[u8], offset: usize) -> Option<(String, usize)> {
    let mut i = offset;
    while i < body.len() {
        if body[i] == 0 {
            i += 1;
            continue;
        }
        let start = i;
        while i < body.len() && body[i] != 0 {
            i += 1;
        }
        let name = std::str::from_utf8(&body[start..i]).ok()?.to_string();
        return Some((name, i + 1));
    }
    None
}

/// A chunk of `body` starting at `offset`, capped at [`OPENDIR_CHUNK`]
/// bytes, for the legacy remote-read `opendir` path.
pub fn chunk(body: &[u8], offset: usize) -> &[u8] {
    if offset >= body.len() {
        return &[];
    }
    let end = (offset + OPENDIR_CHUNK).min(body.len());
    &body[offset..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Vec<u8> {
        super::super::store::EMPTY_DIRECTORY_BODY.to_vec()
    }

    #[test]
    fn seed_contains_dot_and_dotdot() {
        let body = seeded();
        let names: Vec<&str> = iter_entries(&body).collect();
        assert_eq!(names, vec![".", ".."]);
    }

    #[test]
    fn created_names_appear_exactly_once() {
        let mut body = seeded();
        for i in 0..100 {
            append_entry(&mut body, &format!("f{i}"));
        }
        let names: Vec<&str> = iter_entries(&body).collect();
        assert_eq!(names.len(), 102);
        for i in 0..100 {
            assert_eq!(names.iter().filter(|&&n| n == format!("f{i}")).count(), 1);
        }
    }

    #[test]
    fn removed_names_do_not_reappear_after_interleaved_removes() {
        let mut body = seeded();
        for i in 0..100 {
            append_entry(&mut body, &format!("f{i}"));
        }
        for i in (0..100).step_by(2) {
            assert!(remove_entry(&mut body, &format!("f{i}")));
        }
        let names: Vec<&str> = iter_entries(&body).collect();
        for i in (0..100).step_by(2) {
            assert!(!names.contains(&format!("f{i}").as_str()));
        }
        for i in (1..100).step_by(2) {
            assert_eq!(names.iter().filter(|&&n| n == format!("f{i}")).count(), 1);
        }
    }

    #[test]
    fn remove_keeps_body_length_stable() {
        let mut body = seeded();
        append_entry(&mut body, "onlyone");
        let before = body.len();
        remove_entry(&mut body, "onlyone");
        assert_eq!(body.len(), before);
    }

    #[test]
    fn empty_directory_detection() {
        let mut body = seeded();
        assert!(is_empty_directory(&body));
        append_entry(&mut body, "f");
        assert!(!is_empty_directory(&body));
        remove_entry(&mut body, "f");
        assert!(is_empty_directory(&body));
    }

    #[test]
    fn next_entry_walks_offsets_across_zero_runs() {
        let mut body = seeded();
        append_entry(&mut body, "a");
        append_entry(&mut body, "b");
        remove_entry(&mut body, "a");

        let mut out = Vec::new();
        let mut offset = 0;
        while let Some((name, next)) = next_entry(&body, offset) {
            out.push(name);
            offset = next;
        }
        assert_eq!(out, vec![".", "..", "b"]);
    }
}
