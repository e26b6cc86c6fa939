//! Link-safe, swap-safe file reads.
//!
//! [`read_text_within`] only returns content that came from a regular file
//! strictly inside the base directory, with a link count of one, and with
//! the same device and inode at validation time and at read time. Any
//! defensive rejection is reported as [`TasksError::NotFound`].
//!
//! The read is attempted at most twice: an identity mismatch between the
//! pre-open `lstat` and the post-open `fstat` means the file was swapped in
//! between, which warrants one retry from scratch.

use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::TasksError;
use crate::paths::contain_in_root;

/// Validation-plus-read attempts before giving up on a swapping file.
const MAX_READ_ATTEMPTS: usize = 2;

enum ReadOutcome {
    Content(String),
    Swapped,
}

/// Reads `base_dir/filename` as text after validating it.
///
/// # Errors
///
/// Returns [`TasksError::NotFound`] if the file is missing, is a symlink or
/// other non-regular file, is hardlinked elsewhere, resolves outside
/// `base_dir`, or keeps changing identity while being opened.
pub fn read_text_within(base_dir: &Path, filename: &str) -> Result<String, TasksError> {
    read_text_checked(base_dir, filename, |_| {})
}

/// [`read_text_within`] with `before_open` run between the `lstat` and the
/// open of each attempt.
fn read_text_checked<F>(
    base_dir: &Path,
    filename: &str,
    mut before_open: F,
) -> Result<String, TasksError>
where
    F: FnMut(&Path),
{
    let base_real = fs::canonicalize(base_dir).map_err(|_| TasksError::not_found())?;

    for attempt in 1..=MAX_READ_ATTEMPTS {
        match read_once(&base_real, filename, &mut before_open)? {
            ReadOutcome::Content(text) => return Ok(text),
            ReadOutcome::Swapped => {
                debug!(
                    file = filename,
                    attempt = attempt,
                    "File identity changed while opening"
                );
            }
        }
    }

    Err(TasksError::not_found())
}

fn read_once<F>(
    base_real: &Path,
    filename: &str,
    before_open: &mut F,
) -> Result<ReadOutcome, TasksError>
where
    F: FnMut(&Path),
{
    let resolved = resolve_candidate(base_real, filename)?;

    let before = fs::symlink_metadata(&resolved).map_err(|_| TasksError::not_found())?;
    if !before.file_type().is_file() {
        return Err(TasksError::not_found());
    }
    before_open(&resolved);

    let mut file = open_no_follow(&resolved).map_err(|_| TasksError::not_found())?;

    let reopened = fs::canonicalize(&resolved).map_err(|_| TasksError::not_found())?;
    if !contain_in_root(&reopened, base_real) {
        return Err(TasksError::not_found());
    }

    let after = file.metadata().map_err(|_| TasksError::not_found())?;
    if !after.is_file() {
        return Err(TasksError::not_found());
    }
    if link_count(&before) > 1 || link_count(&after) > 1 {
        return Err(TasksError::not_found());
    }
    if !same_identity(&before, &after) {
        return Ok(ReadOutcome::Swapped);
    }

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|_| TasksError::not_found())?;
    Ok(ReadOutcome::Content(
        String::from_utf8_lossy(&bytes).into_owned(),
    ))
}

/// First-pass check: the entry itself must be a regular, non-symlink file
/// whose canonical path stays inside the base directory.
fn resolve_candidate(base_real: &Path, filename: &str) -> Result<PathBuf, TasksError> {
    let candidate = base_real.join(filename);
    let meta = fs::symlink_metadata(&candidate).map_err(|_| TasksError::not_found())?;
    if meta.file_type().is_symlink() || !meta.is_file() {
        return Err(TasksError::not_found());
    }

    let resolved = fs::canonicalize(&candidate).map_err(|_| TasksError::not_found())?;
    if !contain_in_root(&resolved, base_real) {
        return Err(TasksError::not_found());
    }
    Ok(resolved)
}

/// Returns `true` if `path` is a regular, non-symlink file with a single
/// link. Used to qualify plan pairs and documents during listing.
pub fn is_exclusive_regular_file(path: &Path) -> bool {
    match fs::symlink_metadata(path) {
        Ok(meta) => meta.file_type().is_file() && link_count(&meta) <= 1,
        Err(_) => false,
    }
}

#[cfg(unix)]
fn open_no_follow(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
}

#[cfg(not(unix))]
fn open_no_follow(path: &Path) -> io::Result<File> {
    File::open(path)
}

#[cfg(unix)]
fn link_count(meta: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.nlink()
}

#[cfg(not(unix))]
fn link_count(_meta: &Metadata) -> u64 {
    1
}

#[cfg(unix)]
fn same_identity(before: &Metadata, after: &Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    before.dev() == after.dev() && before.ino() == after.ino()
}

#[cfg(not(unix))]
fn same_identity(before: &Metadata, after: &Metadata) -> bool {
    before.len() == after.len() && before.modified().ok() == after.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> TempDir {
        let dir = TempDir::new().expect("create temp dir");
        fs::write(dir.path().join("plan.md"), "# Plan\n").expect("write plan");
        dir
    }

    #[test]
    fn reads_regular_file() {
        let dir = setup();
        let text = read_text_within(dir.path(), "plan.md").expect("read");
        assert_eq!(text, "# Plan\n");
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = setup();
        let err = read_text_within(dir.path(), "absent.md").unwrap_err();
        assert!(matches!(err, TasksError::NotFound(_)));
    }

    #[test]
    fn traversal_outside_base_is_not_found() {
        let outer = TempDir::new().expect("create temp dir");
        let base = outer.path().join("base");
        fs::create_dir(&base).expect("mkdir");
        fs::write(outer.path().join("secret.md"), "secret").expect("write");

        let err = read_text_within(&base, "../secret.md").unwrap_err();
        assert!(matches!(err, TasksError::NotFound(_)));
    }

    #[test]
    fn directory_is_not_found() {
        let dir = setup();
        fs::create_dir(dir.path().join("nested.md")).expect("mkdir");
        let err = read_text_within(dir.path(), "nested.md").unwrap_err();
        assert!(matches!(err, TasksError::NotFound(_)));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_is_not_found() {
        let dir = setup();
        let outside = TempDir::new().expect("create temp dir");
        let target = outside.path().join("secret.md");
        fs::write(&target, "secret").expect("write");
        std::os::unix::fs::symlink(&target, dir.path().join("notes.md")).expect("symlink");

        let err = read_text_within(dir.path(), "notes.md").unwrap_err();
        assert!(matches!(err, TasksError::NotFound(_)));
    }

    #[cfg(unix)]
    #[test]
    fn hardlink_alias_is_not_found() {
        let dir = setup();
        let outside = TempDir::new().expect("create temp dir");
        let target = outside.path().join("secret.md");
        fs::write(&target, "secret").expect("write");
        fs::hard_link(&target, dir.path().join("notes.md")).expect("hard link");

        let err = read_text_within(dir.path(), "notes.md").unwrap_err();
        assert!(matches!(err, TasksError::NotFound(_)));
        assert!(!is_exclusive_regular_file(&dir.path().join("notes.md")));
    }

    #[test]
    fn exclusive_regular_file_checks() {
        let dir = setup();
        assert!(is_exclusive_regular_file(&dir.path().join("plan.md")));
        assert!(!is_exclusive_regular_file(&dir.path().join("missing.md")));
        assert!(!is_exclusive_regular_file(dir.path()));
    }

    /// Replaces `path` with a fresh inode holding `text`.
    #[cfg(unix)]
    fn replace_file(path: &Path, text: &str) {
        let staging = path.with_extension("staging");
        fs::write(&staging, text).expect("write staging");
        fs::rename(&staging, path).expect("rename over");
    }

    #[cfg(unix)]
    #[test]
    fn single_swap_is_retried() {
        let dir = setup();
        let mut swaps = 0;
        let text = read_text_checked(dir.path(), "plan.md", |path| {
            if swaps == 0 {
                replace_file(path, "# Swapped\n");
            }
            swaps += 1;
        })
        .expect("read after retry");

        assert_eq!(swaps, 2);
        assert_eq!(text, "# Swapped\n");
    }

    #[cfg(unix)]
    #[test]
    fn repeated_swaps_are_not_found() {
        let dir = setup();
        let mut swaps = 0;
        let err = read_text_checked(dir.path(), "plan.md", |path| {
            swaps += 1;
            replace_file(path, &format!("# Swap {swaps}\n"));
        })
        .unwrap_err();

        assert_eq!(swaps, MAX_READ_ATTEMPTS);
        assert!(matches!(err, TasksError::NotFound(_)));
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let dir = setup();
        fs::write(dir.path().join("bin.md"), [b'o', b'k', 0xff]).expect("write");
        let text = read_text_within(dir.path(), "bin.md").expect("read");
        assert!(text.starts_with("ok"));
    }
}
