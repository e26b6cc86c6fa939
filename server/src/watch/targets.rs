//! Directories observed for a root and the PRD matcher for each.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::git;
use crate::paths::is_safe_prd_id;
use crate::roots::Root;
use crate::tasks::worktree_prd_id;

/// A directory that must be watched on behalf of a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    /// Tasks directory (canonical when it exists).
    pub path: PathBuf,
    /// Set for worktree targets; reported PRD ids get the `wt:` prefix.
    pub worktree_id: Option<String>,
}

impl WatchTarget {
    /// Maps a path relative to this target onto a PRD id.
    ///
    /// The first path segment is the PRD directory name. Returns `None`
    /// (ambiguous) when that segment is not a safe PRD id, e.g. for events
    /// on the tasks directory itself.
    pub fn prd_id_for(&self, relative: &str) -> Option<String> {
        let normalized = relative.replace('\\', "/");
        let first = normalized.trim().split('/').next()?;
        if !is_safe_prd_id(first) {
            return None;
        }
        Some(match &self.worktree_id {
            Some(worktree_id) => worktree_prd_id(worktree_id, first),
            None => first.to_string(),
        })
    }

    /// Expresses an absolute event path relative to this target.
    ///
    /// Returns `None` for paths outside the target.
    pub fn relative_path(&self, absolute: &Path) -> Option<String> {
        let relative = absolute.strip_prefix(&self.path).ok()?;
        Some(relative.to_string_lossy().replace('\\', "/"))
    }
}

/// Resolves the watch targets for `root`: its tasks directory plus, for a
/// primary git checkout, the tasks directory of every linked worktree.
pub fn resolve_watch_targets(root: &Root) -> Vec<WatchTarget> {
    let mut targets = vec![WatchTarget {
        path: canonical_or_self(root.tasks_path()),
        worktree_id: None,
    }];

    for worktree in git::discover_worktrees(&root.path) {
        targets.push(WatchTarget {
            path: canonical_or_self(worktree.path.join(&root.tasks_dir)),
            worktree_id: Some(worktree.id),
        });
    }

    debug!(
        root_id = %root.id,
        target_count = targets.len(),
        "Resolved watch targets"
    );
    targets
}

fn canonical_or_self(path: PathBuf) -> PathBuf {
    fs::canonicalize(&path).unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn target(worktree_id: Option<&str>) -> WatchTarget {
        WatchTarget {
            path: PathBuf::from("/srv/app/.tasks"),
            worktree_id: worktree_id.map(str::to_string),
        }
    }

    #[test]
    fn first_segment_is_the_prd() {
        let target = target(None);
        assert_eq!(target.prd_id_for("alpha/plan.json").as_deref(), Some("alpha"));
        assert_eq!(target.prd_id_for("alpha").as_deref(), Some("alpha"));
        assert_eq!(target.prd_id_for("alpha\\notes.md").as_deref(), Some("alpha"));
    }

    #[test]
    fn unsafe_or_empty_segments_are_ambiguous() {
        let target = target(None);
        assert_eq!(target.prd_id_for(""), None);
        assert_eq!(target.prd_id_for("/alpha"), None);
        assert_eq!(target.prd_id_for("../alpha"), None);
        assert_eq!(target.prd_id_for("con/plan.md"), None);
    }

    #[test]
    fn worktree_targets_prefix_ids() {
        let target = target(Some("0123456789ab"));
        assert_eq!(
            target.prd_id_for("alpha/plan.md").as_deref(),
            Some("wt:0123456789ab:alpha")
        );
    }

    #[test]
    fn relative_path_strips_target() {
        let target = target(None);
        assert_eq!(
            target.relative_path(Path::new("/srv/app/.tasks/alpha/plan.md")).as_deref(),
            Some("alpha/plan.md")
        );
        assert_eq!(target.relative_path(Path::new("/srv/app/.tasks")).as_deref(), Some(""));
        assert_eq!(target.relative_path(Path::new("/srv/other")), None);
    }

    #[test]
    fn plain_root_has_one_target() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join(".tasks")).unwrap();
        let root = Root {
            id: "0123456789ab".into(),
            path: tmp.path().to_path_buf(),
            tasks_dir: ".tasks".into(),
        };

        let targets = resolve_watch_targets(&root);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].path, fs::canonicalize(tmp.path().join(".tasks")).unwrap());
        assert!(targets[0].worktree_id.is_none());
    }
}
