//! PRD listing and document access.
//!
//! A tasks directory holds one subdirectory per PRD. A subdirectory counts
//! as a PRD only when it directly contains both `plan.md` and `plan.json`,
//! neither being a symlink nor a multiply-hardlinked file. Other `*.md`
//! files next to the plan pair are the PRD's documents.
//!
//! Roots that are primary git checkouts also list the PRDs of each linked
//! worktree. Those PRDs are addressed as `wt:<worktreeId>:<prdId>` and are
//! resolved against current git state on every request.
//!
//! All functions here are blocking and side-effect free; the HTTP layer runs
//! them on the blocking thread pool.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs::{self, DirEntry};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::TasksError;
use crate::git::{self, Worktree};
use crate::paths::{contain_in_root, is_safe_doc_id, is_safe_prd_id};
use crate::roots::Root;
use crate::secure_read::{is_exclusive_regular_file, read_text_within};
use crate::types::{
    ListingMeta, MarkdownDocument, PlanDocument, PrdListing, PrdSummary, Progress, RootListing,
    RootsListing, SortDirection, WorktreeTag,
};
use crate::utils::{is_short_id, label_cmp};

/// Plan markdown file name.
pub const PLAN_MARKDOWN_FILE: &str = "plan.md";

/// Plan data file name.
pub const PLAN_DATA_FILE: &str = "plan.json";

/// Prefix of worktree-qualified PRD ids.
pub const WORKTREE_PREFIX: &str = "wt:";

/// Builds the qualified id of a PRD living in a linked worktree.
pub fn worktree_prd_id(worktree_id: &str, prd_id: &str) -> String {
    format!("{WORKTREE_PREFIX}{worktree_id}:{prd_id}")
}

/// Splits a `wt:<worktreeId>:<prdId>` id.
///
/// Returns `Ok(None)` for plain ids. A `wt:` id whose worktree part is not a
/// 12-character lowercase hex id is [`TasksError::InvalidPrd`].
pub fn parse_worktree_prd_id(prd_id: &str) -> Result<Option<(&str, &str)>, TasksError> {
    let Some(rest) = prd_id.strip_prefix(WORKTREE_PREFIX) else {
        return Ok(None);
    };
    match rest.split_once(':') {
        Some((worktree_id, inner)) if is_short_id(worktree_id) => Ok(Some((worktree_id, inner))),
        _ => Err(TasksError::InvalidPrd),
    }
}

/// Derives progress from the text of `plan.json`.
///
/// `done` when every task passes and there is at least one task,
/// `not_started` when none passes (or the file has no usable task list),
/// otherwise `in_progress`. A task passes only if it is an object whose
/// `passes` field is the JSON boolean `true`.
pub fn compute_progress(plan_json_text: &str) -> Progress {
    let Ok(parsed) = serde_json::from_str::<Value>(plan_json_text) else {
        return Progress::NotStarted;
    };
    let Some(tasks) = parsed.get("tasks").and_then(Value::as_array) else {
        return Progress::NotStarted;
    };
    if tasks.is_empty() {
        return Progress::NotStarted;
    }

    let passing = tasks
        .iter()
        .filter(|task| task.get("passes") == Some(&Value::Bool(true)))
        .count();

    if passing == tasks.len() {
        Progress::Done
    } else if passing == 0 {
        Progress::NotStarted
    } else {
        Progress::InProgress
    }
}

/// Lists the PRDs directly under `tasks_root`.
///
/// A missing tasks directory lists as empty.
///
/// # Errors
///
/// Returns [`TasksError::Io`] if a directory exists but cannot be read.
pub fn list_prds(tasks_root: &Path) -> Result<PrdListing, TasksError> {
    let root_real = canonical_or_absolute(tasks_root);
    let project_root = root_real
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root_real.clone());

    let meta = ListingMeta {
        root_label: root_label(&project_root),
        git_branch: git::resolve_branch(&project_root),
        root_path: project_root.display().to_string(),
    };

    let mut prds = Vec::new();
    for entry in read_dir_entries(&root_real)? {
        let Some(name) = entry_dir_name(&entry) else {
            continue;
        };
        if !is_safe_prd_id(&name) {
            continue;
        }
        let Ok(prd_real) = fs::canonicalize(root_real.join(&name)) else {
            continue;
        };
        if !contain_in_root(&prd_real, &root_real) || !has_plan_pair(&prd_real) {
            continue;
        }

        let progress = read_text_within(&prd_real, PLAN_DATA_FILE)
            .map(|text| compute_progress(&text))
            .unwrap_or(Progress::NotStarted);
        let docs = collect_docs(&prd_real)?;

        prds.push(PrdSummary {
            id: name.clone(),
            label: name,
            docs,
            progress,
            worktree: None,
        });
    }

    prds.sort_by(|a, b| label_cmp(&a.label, &b.label));
    debug!(
        tasks_root = %root_real.display(),
        prd_count = prds.len(),
        "Listed PRDs"
    );
    Ok(PrdListing { meta, prds })
}

/// Lists every configured root with its own and its worktrees' PRDs.
pub fn list_roots(roots: &[Root], direction: SortDirection) -> Result<RootsListing, TasksError> {
    let mut listings = Vec::with_capacity(roots.len());

    for root in roots {
        let own = list_prds(&root.tasks_path())?;
        let mut prds = own.prds;

        for worktree in git::discover_worktrees(&root.path) {
            let tasks_root = worktree.path.join(&root.tasks_dir);
            match list_prds(&tasks_root) {
                Ok(listing) => prds.extend(
                    listing
                        .prds
                        .into_iter()
                        .map(|prd| tag_worktree_prd(prd, &worktree)),
                ),
                Err(err) => warn!(
                    root_id = %root.id,
                    worktree = %worktree.path.display(),
                    error = %err,
                    "Skipping unreadable worktree tasks directory"
                ),
            }
        }

        sort_prds(&mut prds, direction);
        listings.push(RootListing {
            id: root.id.clone(),
            path: root.path.display().to_string(),
            tasks_dir: root.tasks_dir.clone(),
            meta: own.meta,
            prds,
        });
    }

    Ok(RootsListing { roots: listings })
}

/// Reads the plan pair of a PRD under `tasks_root`.
pub fn read_plan(tasks_root: &Path, prd_id: &str) -> Result<PlanDocument, TasksError> {
    let prd_dir = resolve_prd_dir(tasks_root, prd_id)?;
    Ok(PlanDocument {
        plan_markdown: read_text_within(&prd_dir, PLAN_MARKDOWN_FILE)?,
        plan_json_text: read_text_within(&prd_dir, PLAN_DATA_FILE)?,
        prd_path: prd_dir.display().to_string(),
    })
}

/// Reads one markdown document of a PRD under `tasks_root`.
pub fn read_markdown(
    tasks_root: &Path,
    prd_id: &str,
    doc_id: &str,
) -> Result<MarkdownDocument, TasksError> {
    let prd_dir = resolve_prd_dir(tasks_root, prd_id)?;
    if !is_safe_doc_id(doc_id) {
        return Err(TasksError::InvalidDoc);
    }
    Ok(MarkdownDocument {
        markdown: read_text_within(&prd_dir, &format!("{doc_id}.md"))?,
    })
}

/// [`read_plan`] addressed by root id and (possibly qualified) PRD id.
pub fn read_plan_by_root(
    roots: &[Root],
    root_id: &str,
    prd_id: &str,
) -> Result<PlanDocument, TasksError> {
    let (tasks_root, prd) = resolve_effective_root(roots, root_id, prd_id)?;
    read_plan(&tasks_root, prd)
}

/// [`read_markdown`] addressed by root id and (possibly qualified) PRD id.
pub fn read_markdown_by_root(
    roots: &[Root],
    root_id: &str,
    prd_id: &str,
    doc_id: &str,
) -> Result<MarkdownDocument, TasksError> {
    let (tasks_root, prd) = resolve_effective_root(roots, root_id, prd_id)?;
    read_markdown(&tasks_root, prd, doc_id)
}

fn resolve_effective_root<'a>(
    roots: &[Root],
    root_id: &str,
    prd_id: &'a str,
) -> Result<(PathBuf, &'a str), TasksError> {
    let root = roots
        .iter()
        .find(|root| root.id == root_id)
        .ok_or(TasksError::InvalidRoot)?;

    match parse_worktree_prd_id(prd_id)? {
        None => Ok((root.tasks_path(), prd_id)),
        Some((worktree_id, inner)) => {
            let worktree = git::discover_worktrees(&root.path)
                .into_iter()
                .find(|worktree| worktree.id == worktree_id)
                .ok_or(TasksError::NotFound("Worktree not found"))?;
            Ok((worktree.path.join(&root.tasks_dir), inner))
        }
    }
}

fn resolve_prd_dir(tasks_root: &Path, prd_id: &str) -> Result<PathBuf, TasksError> {
    if !is_safe_prd_id(prd_id) {
        return Err(TasksError::InvalidPrd);
    }

    let root_real = canonical_or_absolute(tasks_root);
    let prd_dir = root_real.join(prd_id);
    if !contain_in_root(&prd_dir, &root_real) {
        return Err(TasksError::InvalidPrd);
    }

    let meta = fs::symlink_metadata(&prd_dir).map_err(|_| TasksError::NotFound("PRD not found"))?;
    if meta.file_type().is_symlink() || !meta.is_dir() {
        return Err(TasksError::NotFound("PRD not found"));
    }

    let prd_real = fs::canonicalize(&prd_dir).map_err(|_| TasksError::InvalidPrd)?;
    if !contain_in_root(&prd_real, &root_real) {
        return Err(TasksError::InvalidPrd);
    }
    Ok(prd_real)
}

fn tag_worktree_prd(prd: PrdSummary, worktree: &Worktree) -> PrdSummary {
    PrdSummary {
        id: worktree_prd_id(&worktree.id, &prd.id),
        worktree: Some(WorktreeTag {
            id: worktree.id.clone(),
            label: worktree.label.clone(),
        }),
        ..prd
    }
}

fn sort_prds(prds: &mut [PrdSummary], direction: SortDirection) {
    prds.sort_by(|a, b| {
        let ordering = label_cmp(&a.label, &b.label)
            .then_with(|| compare_worktrees(a.worktree.as_ref(), b.worktree.as_ref()));
        match direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    });
}

fn compare_worktrees(a: Option<&WorktreeTag>, b: Option<&WorktreeTag>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => label_cmp(&a.label, &b.label).then_with(|| a.id.cmp(&b.id)),
    }
}

fn collect_docs(prd_dir: &Path) -> Result<Vec<String>, TasksError> {
    let mut docs = Vec::new();
    for entry in read_dir_entries(prd_dir)? {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let Some(doc_id) = strip_markdown_extension(name) else {
            continue;
        };
        if !is_safe_doc_id(doc_id) || !is_exclusive_regular_file(&prd_dir.join(name)) {
            continue;
        }
        docs.push(doc_id.to_string());
    }

    docs.sort_by(|a, b| label_cmp(a, b));
    let mut seen = HashSet::new();
    docs.retain(|doc| seen.insert(doc.to_lowercase()));
    Ok(docs)
}

fn strip_markdown_extension(name: &str) -> Option<&str> {
    let split = name.len().checked_sub(3)?;
    let (stem, extension) = (name.get(..split)?, name.get(split..)?);
    if extension.eq_ignore_ascii_case(".md") {
        Some(stem)
    } else {
        None
    }
}

fn has_plan_pair(prd_dir: &Path) -> bool {
    is_exclusive_regular_file(&prd_dir.join(PLAN_MARKDOWN_FILE))
        && is_exclusive_regular_file(&prd_dir.join(PLAN_DATA_FILE))
}

fn entry_dir_name(entry: &DirEntry) -> Option<String> {
    let file_type = entry.file_type().ok()?;
    if !file_type.is_dir() {
        return None;
    }
    entry.file_name().to_str().map(str::to_owned)
}

fn read_dir_entries(dir: &Path) -> Result<Vec<DirEntry>, TasksError> {
    match fs::read_dir(dir) {
        Ok(entries) => Ok(entries.flatten().collect()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(TasksError::io(
            format!("Failed to read directory {}", dir.display()),
            err,
        )),
    }
}

fn canonical_or_absolute(path: &Path) -> PathBuf {
    fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn root_label(project_root: &Path) -> String {
    project_root
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "root".to_string())
}
