//! Path simplification.
//!
//! `search_or_create` and the directory add/remove fan-out all operate on
//! a canonical form: collapse `.` and `..` components and duplicate `/`,
//! always anchored at `/`. This never touches the filesystem — it is pure
//! string surgery over the POSIX path presented by the client, not the
//! node's on-disk `hashpath`.

/// Collapse `.`, `..` and duplicate slashes in `path`. The empty path (or
/// one that simplifies away to nothing) becomes `/`.
pub fn simplify(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }
    if stack.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", stack.join("/"))
    }
}

/// The parent of a simplified path, and the final component (the name).
/// `/` is its own parent with an empty name.
pub fn split_parent(path: &str) -> (String, String) {
    let simplified = simplify(path);
    if simplified == "/" {
        return ("/".to_string(), String::new());
    }
    match simplified.rfind('/') {
        Some(0) => ("/".to_string(), simplified[1..].to_string()),
        Some(idx) => (simplified[..idx].to_string(), simplified[idx + 1..].to_string()),
        None => ("/".to_string(), simplified),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simplify_collapses_dot_and_dotdot() {
        assert_eq!(simplify("/a/./b/../c"), "/a/c");
        assert_eq!(simplify("/a//b///c"), "/a/b/c");
        assert_eq!(simplify(""), "/");
        assert_eq!(simplify("."), "/");
        assert_eq!(simplify("/.."), "/");
    }

    #[test]
    fn simplify_is_idempotent() {
        for p in ["/a/b/c", "/a/./b/../c", "", "/", "/../../x", "//a//b//"] {
            let once = simplify(p);
            let twice = simplify(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn split_parent_basic() {
        assert_eq!(split_parent("/a/b/c"), ("/a/b".to_string(), "c".to_string()));
        assert_eq!(split_parent("/f"), ("/".to_string(), "f".to_string()));
        assert_eq!(split_parent("/"), ("/".to_string(), String::new()));
    }
}
