//! Git metadata inspection: current branch and linked worktrees.
//!
//! Only the on-disk layout is consulted (`.git`, `HEAD`,
//! `worktrees/*/gitdir`); no git binary is invoked. Every failure degrades
//! to "no branch" or "no worktrees" because a project without git is normal.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::paths::normalize_lexically;
use crate::utils::{label_cmp, short_id};

/// Location of a project's git directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitInfo {
    /// The resolved git directory.
    pub git_dir: PathBuf,
    /// `true` when the project is itself a linked worktree.
    pub is_worktree: bool,
}

/// A linked worktree of a root's repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    /// Short id of the canonical worktree path.
    pub id: String,
    /// Canonical working directory.
    pub path: PathBuf,
    /// Display label (directory name minus the root's name prefix).
    pub label: String,
}

/// Locates the git directory for `project_dir`.
///
/// A `.git` directory is the git dir. A `.git` file must start with
/// `gitdir: <path>`, the path being resolved relative to the file. A
/// symlinked `.git` is followed when it resolves.
pub fn resolve_git_info(project_dir: &Path) -> Option<GitInfo> {
    let dot_git = project_dir.join(".git");
    let mut target = dot_git.clone();
    let mut meta = fs::symlink_metadata(&dot_git).ok()?;

    if meta.file_type().is_symlink() {
        target = fs::canonicalize(&dot_git).ok()?;
        meta = fs::symlink_metadata(&target).ok()?;
    }

    if meta.is_dir() {
        return Some(GitInfo {
            git_dir: target,
            is_worktree: false,
        });
    }
    if !meta.is_file() {
        return None;
    }

    let contents = fs::read_to_string(&target).ok()?;
    let first_line = contents.lines().next()?.trim();
    let pointer = strip_prefix_ignore_case(first_line, "gitdir:")?.trim();
    if pointer.is_empty() {
        return None;
    }

    let base = target.parent()?;
    let git_dir = normalize_lexically(&base.join(pointer));
    let is_worktree = is_worktree_git_dir(&git_dir);
    Some(GitInfo {
        git_dir,
        is_worktree,
    })
}

/// Reads the checked-out branch name, or `None` for a detached HEAD.
pub fn resolve_branch(project_dir: &Path) -> Option<String> {
    let info = resolve_git_info(project_dir)?;
    let head = fs::read_to_string(info.git_dir.join("HEAD")).ok()?;
    let reference = strip_prefix_ignore_case(head.trim(), "ref:")?.trim();
    let branch = reference.strip_prefix("refs/heads/")?.trim();
    if branch.is_empty() {
        None
    } else {
        Some(branch.to_string())
    }
}

/// Lists the linked worktrees registered under `git_dir/worktrees`.
///
/// Missing working directories are skipped, duplicates collapse onto their
/// canonical path and the project itself is never listed.
pub fn list_worktrees(project_dir: &Path, git_dir: &Path) -> Vec<Worktree> {
    let Ok(entries) = fs::read_dir(git_dir.join("worktrees")) else {
        return Vec::new();
    };

    let project_real =
        fs::canonicalize(project_dir).unwrap_or_else(|_| project_dir.to_path_buf());
    let root_name = dir_name(&project_real);
    let mut seen = HashSet::new();
    let mut worktrees = Vec::new();

    for entry in entries.flatten() {
        let admin_dir = entry.path();
        if !admin_dir.is_dir() {
            continue;
        }
        let Ok(text) = fs::read_to_string(admin_dir.join("gitdir")) else {
            continue;
        };
        let Some(line) = text.lines().next().map(str::trim).filter(|l| !l.is_empty()) else {
            continue;
        };

        let pointer = normalize_lexically(&admin_dir.join(line));
        let Some(working_dir) = pointer.parent() else {
            continue;
        };
        let Ok(real) = fs::canonicalize(working_dir) else {
            continue;
        };
        if real == project_real || !seen.insert(real.clone()) {
            continue;
        }

        let name = dir_name(&real);
        worktrees.push(Worktree {
            id: short_id(&real.to_string_lossy()),
            label: worktree_label(&root_name, &name),
            path: real,
        });
    }

    worktrees.sort_by(|a, b| label_cmp(&a.label, &b.label).then_with(|| a.id.cmp(&b.id)));
    worktrees
}

/// Linked worktrees of `project_dir`, only when it is a primary checkout.
///
/// A project that is itself a worktree contributes no further worktrees.
pub fn discover_worktrees(project_dir: &Path) -> Vec<Worktree> {
    match resolve_git_info(project_dir) {
        Some(info) if !info.is_worktree => list_worktrees(project_dir, &info.git_dir),
        _ => Vec::new(),
    }
}

fn is_worktree_git_dir(git_dir: &Path) -> bool {
    let normalized = git_dir.to_string_lossy().replace('\\', "/");
    normalized.contains("/.git/worktrees/") || normalized.starts_with(".git/worktrees/")
}

fn worktree_label(root_name: &str, name: &str) -> String {
    if !root_name.is_empty() {
        if let Some(rest) = name.strip_prefix(root_name) {
            let rest = rest.trim_start_matches(['-', '_', '.']);
            if !rest.is_empty() {
                return rest.to_string();
            }
        }
    }
    name.to_string()
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        value.get(prefix.len()..)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git_repo(dir: &Path, branch: &str) {
        fs::create_dir_all(dir.join(".git")).expect("mkdir .git");
        fs::write(dir.join(".git/HEAD"), format!("ref: refs/heads/{branch}\n")).expect("HEAD");
    }

    fn link_worktree(project: &Path, admin_name: &str, worktree: &Path) {
        let admin = project.join(".git/worktrees").join(admin_name);
        fs::create_dir_all(&admin).expect("mkdir admin");
        fs::create_dir_all(worktree).expect("mkdir worktree");
        fs::write(
            admin.join("gitdir"),
            format!("{}\n", worktree.join(".git").display()),
        )
        .expect("write gitdir");
        fs::write(
            worktree.join(".git"),
            format!("gitdir: {}\n", admin.display()),
        )
        .expect("write .git file");
    }

    #[test]
    fn directory_git_is_primary() {
        let tmp = TempDir::new().unwrap();
        git_repo(tmp.path(), "main");
        let info = resolve_git_info(tmp.path()).unwrap();
        assert!(!info.is_worktree);
        assert_eq!(resolve_branch(tmp.path()).as_deref(), Some("main"));
    }

    #[test]
    fn missing_git_has_no_branch() {
        let tmp = TempDir::new().unwrap();
        assert!(resolve_git_info(tmp.path()).is_none());
        assert!(resolve_branch(tmp.path()).is_none());
        assert!(discover_worktrees(tmp.path()).is_empty());
    }

    #[test]
    fn detached_head_has_no_branch() {
        let tmp = TempDir::new().unwrap();
        git_repo(tmp.path(), "main");
        fs::write(tmp.path().join(".git/HEAD"), "3f4e2a1b\n").unwrap();
        assert!(resolve_branch(tmp.path()).is_none());
    }

    #[test]
    fn gitdir_file_pointing_nowhere_has_no_branch() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(".git"), "gitdir: ../missing/.git\n").unwrap();
        let info = resolve_git_info(tmp.path()).unwrap();
        assert!(!info.is_worktree);
        assert!(resolve_branch(tmp.path()).is_none());
    }

    #[test]
    fn gitdir_key_is_case_insensitive() {
        let tmp = TempDir::new().unwrap();
        let real_git = tmp.path().join("store");
        fs::create_dir_all(&real_git).unwrap();
        fs::write(real_git.join("HEAD"), "ref: refs/heads/feature/x\n").unwrap();
        let project = tmp.path().join("project");
        fs::create_dir_all(&project).unwrap();
        fs::write(project.join(".git"), "GITDIR: ../store\n").unwrap();

        assert_eq!(resolve_branch(&project).as_deref(), Some("feature/x"));
    }

    #[test]
    fn lists_linked_worktrees_with_labels() {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("app");
        git_repo(&project, "main");
        link_worktree(&project, "wt-b", &tmp.path().join("app-beta"));
        link_worktree(&project, "wt-a", &tmp.path().join("app_alpha"));
        link_worktree(&project, "wt-gone", &tmp.path().join("app-gone"));
        fs::remove_dir_all(tmp.path().join("app-gone")).unwrap();

        let worktrees = discover_worktrees(&project);
        let labels: Vec<_> = worktrees.iter().map(|w| w.label.as_str()).collect();
        assert_eq!(labels, vec!["alpha", "beta"]);
        for worktree in &worktrees {
            assert_eq!(worktree.id, short_id(&worktree.path.to_string_lossy()));
        }
    }

    #[test]
    fn worktree_is_itself_not_primary() {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("app");
        git_repo(&project, "main");
        let worktree = tmp.path().join("app-feature");
        link_worktree(&project, "feature", &worktree);

        let info = resolve_git_info(&worktree).unwrap();
        assert!(info.is_worktree);
        assert!(discover_worktrees(&worktree).is_empty());
    }

    #[test]
    fn duplicate_and_self_entries_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("app");
        git_repo(&project, "main");
        let worktree = tmp.path().join("app-one");
        link_worktree(&project, "one", &worktree);
        link_worktree(&project, "one-again", &worktree);
        let admin = project.join(".git/worktrees/self");
        fs::create_dir_all(&admin).unwrap();
        fs::write(admin.join("gitdir"), format!("{}\n", project.join(".git").display())).unwrap();

        let worktrees = discover_worktrees(&project);
        assert_eq!(worktrees.len(), 1);
        assert_eq!(worktrees[0].label, "one");
    }

    #[test]
    fn label_falls_back_to_full_name() {
        assert_eq!(worktree_label("app", "app"), "app");
        assert_eq!(worktree_label("app", "app--"), "app--");
        assert_eq!(worktree_label("app", "other"), "other");
        assert_eq!(worktree_label("app", "app.feature"), "feature");
    }
}
