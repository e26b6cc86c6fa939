//! Wire types for the PiggyChick server.
//!
//! Everything here is serialized as camelCase JSON for the browser client.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Completion state of a PRD derived from its `plan.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Progress {
    NotStarted,
    InProgress,
    Done,
}

/// Worktree tag attached to PRDs that live in a linked worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeTag {
    pub id: String,
    pub label: String,
}

/// One PRD in a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrdSummary {
    pub id: String,
    pub label: String,
    pub docs: Vec<String>,
    pub progress: Progress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<WorktreeTag>,
}

/// Project-level metadata shown next to a root's PRDs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingMeta {
    pub root_label: String,
    pub git_branch: Option<String>,
    pub root_path: String,
}

/// PRDs found directly under one tasks directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrdListing {
    pub meta: ListingMeta,
    pub prds: Vec<PrdSummary>,
}

/// A configured root with its PRDs (worktree PRDs included).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootListing {
    pub id: String,
    pub path: String,
    pub tasks_dir: String,
    pub meta: ListingMeta,
    pub prds: Vec<PrdSummary>,
}

/// Response body of `GET /api/roots`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootsListing {
    pub roots: Vec<RootListing>,
}

/// The plan pair of a PRD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDocument {
    pub plan_markdown: String,
    pub plan_json_text: String,
    pub prd_path: String,
}

/// A supporting markdown document of a PRD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkdownDocument {
    pub markdown: String,
}

/// Kind of a streamed change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Changed,
}

/// Coalesced change notification for one root.
///
/// `prd_id` is set only when every relevant filesystem event since the last
/// flush mapped to the same single PRD; otherwise it is `null` and clients
/// refresh the whole root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub root_id: String,
    pub prd_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Creates a change event stamped with the current time.
    pub fn changed(root_id: impl Into<String>, prd_id: Option<String>) -> Self {
        Self {
            kind: ChangeKind::Changed,
            root_id: root_id.into(),
            prd_id,
            at: Utc::now(),
        }
    }
}

/// Ordering applied to combined PRD listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    /// Parses `asc`/`desc` leniently; anything else is ascending.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "desc" => Self::Desc,
            _ => Self::Asc,
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asc => write!(f, "asc"),
            Self::Desc => write!(f, "desc"),
        }
    }
}
