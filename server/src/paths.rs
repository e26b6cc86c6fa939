//! Identifier validation and path containment.
//!
//! Every PRD id, document id and tasks-directory name that arrives from a
//! request or from the configuration file passes through this module before
//! it is joined onto a filesystem path. All checks are pure string checks
//! except [`contain_in_root`], which expects both sides to be canonical.

use std::path::{Component, Path, PathBuf};

/// Maximum length, in characters, of a markdown document id.
pub const MAX_DOC_ID_LEN: usize = 120;

/// Names that refer to devices on Windows regardless of extension.
const RESERVED_DEVICE_NAMES: &[&str] = &[
    "con", "conin$", "conout$", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5",
    "com6", "com7", "com8", "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7",
    "lpt8", "lpt9",
];

/// Returns `true` if `name` is usable as a single path segment.
///
/// Rejects empty or whitespace-only names, surrounding whitespace, `.` and
/// `..`, any `..` substring, path separators, NUL bytes, trailing dots or
/// spaces and reserved device names (including dotted variants such as
/// `con.txt`).
///
/// # Example
///
/// ```
/// use pgch_server::paths::is_safe_segment;
///
/// assert!(is_safe_segment("feature-login"));
/// assert!(!is_safe_segment("../etc"));
/// assert!(!is_safe_segment("aux.md"));
/// ```
pub fn is_safe_segment(name: &str) -> bool {
    if name.trim().is_empty() || name != name.trim() {
        return false;
    }
    if name == "." || name == ".." || name.contains("..") {
        return false;
    }
    if name.contains(['/', '\\', '\0']) {
        return false;
    }
    if name.ends_with('.') || name.ends_with(' ') {
        return false;
    }
    !is_reserved_device_name(name)
}

fn is_reserved_device_name(name: &str) -> bool {
    let lowered = name.to_lowercase();
    let stem = lowered.split('.').next().unwrap_or(&lowered);
    RESERVED_DEVICE_NAMES.contains(&stem)
}

/// Returns `true` if `name` is a valid PRD directory name.
pub fn is_safe_prd_id(name: &str) -> bool {
    is_safe_segment(name)
}

/// Returns `true` if `name` is a valid markdown document id.
///
/// Document ids are the file stem of a `*.md` file. `plan` is reserved for
/// the plan pair and is never served as a plain document.
pub fn is_safe_doc_id(name: &str) -> bool {
    is_safe_segment(name)
        && name.chars().count() <= MAX_DOC_ID_LEN
        && !name.eq_ignore_ascii_case("plan")
}

/// Returns `true` if `name` is a valid tasks-directory name from config.
pub fn is_safe_dir_name(name: &str) -> bool {
    is_safe_segment(name) && !name.contains(':')
}

/// Returns `true` if `candidate` equals `root` or lies beneath it.
///
/// The comparison is component-wise, so `/tasks-evil` is not inside
/// `/tasks`. Callers canonicalize both sides first.
pub fn contain_in_root(candidate: &Path, root: &Path) -> bool {
    candidate.starts_with(root)
}

/// Resolves `.` and `..` components without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() && !normalized.has_root() {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// Makes `path` absolute against `base` and normalizes it lexically.
pub fn resolve_against(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize_lexically(path)
    } else {
        normalize_lexically(&base.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_names() {
        for name in ["alpha", "feature-login", "v1.2", "My PRD", ".hidden"] {
            assert!(is_safe_segment(name), "{name} should be accepted");
        }
    }

    #[test]
    fn rejects_traversal_and_separators() {
        for name in ["", "   ", ".", "..", "a..b", "a/b", "a\\b", "nul\0byte"] {
            assert!(!is_safe_segment(name), "{name:?} should be rejected");
        }
    }

    #[test]
    fn rejects_surrounding_whitespace_and_trailing_dot() {
        assert!(!is_safe_segment(" alpha"));
        assert!(!is_safe_segment("alpha "));
        assert!(!is_safe_segment("alpha."));
    }

    #[test]
    fn rejects_reserved_device_names() {
        for name in ["con", "CON", "con.txt", "Aux.md", "com1", "LPT9", "conin$"] {
            assert!(!is_safe_segment(name), "{name} should be rejected");
        }
        assert!(is_safe_segment("console"));
        assert!(is_safe_segment("com10"));
    }

    #[test]
    fn doc_ids_exclude_plan_and_long_names() {
        assert!(is_safe_doc_id("notes"));
        assert!(!is_safe_doc_id("plan"));
        assert!(!is_safe_doc_id("PLAN"));
        assert!(is_safe_doc_id(&"a".repeat(MAX_DOC_ID_LEN)));
        assert!(!is_safe_doc_id(&"a".repeat(MAX_DOC_ID_LEN + 1)));
    }

    #[test]
    fn dir_names_reject_colons() {
        assert!(is_safe_dir_name(".tasks"));
        assert!(!is_safe_dir_name("c:tasks"));
        assert!(!is_safe_dir_name("../tasks"));
    }

    #[test]
    fn containment_is_component_wise() {
        let root = Path::new("/srv/tasks");
        assert!(contain_in_root(Path::new("/srv/tasks"), root));
        assert!(contain_in_root(Path::new("/srv/tasks/alpha"), root));
        assert!(!contain_in_root(Path::new("/srv/tasks-evil"), root));
        assert!(!contain_in_root(Path::new("/srv"), root));
    }

    #[test]
    fn normalize_resolves_parent_components() {
        assert_eq!(
            normalize_lexically(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(
            resolve_against(Path::new("/work"), Path::new("../repo")),
            PathBuf::from("/repo")
        );
    }
}
