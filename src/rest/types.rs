//! Wire types for the merge-request host's REST surface (§3 DATA MODEL).

use serde::{Deserialize, Serialize};

/// GitLab-style numeric access levels. Ordered so `project.access_level <
/// AccessLevel::Reporter` reads naturally (mirrors
/// `marge/bot.py`'s `AccessLevel.reporter` gate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[repr(u8)]
pub enum AccessLevel {
    Guest = 10,
    Reporter = 20,
    Developer = 30,
    Maintainer = 40,
    Owner = 50,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    Merge,
    RebaseMerge,
    #[serde(rename = "ff")]
    FfOnly,
}

impl MergeMethod {
    /// The name this method is spelled with in `merge.allow_merge_strategies`
    /// (GitLab's own wire value: `"ff"`, not `"ff_only"`).
    pub fn config_name(self) -> &'static str {
        match self {
            MergeMethod::Merge => "merge",
            MergeMethod::RebaseMerge => "rebase_merge",
            MergeMethod::FfOnly => "ff",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct User {
    pub id: u64,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Project {
    pub id: u64,
    pub path_with_namespace: String,
    pub access_level: AccessLevel,
    pub merge_method: MergeMethod,
    #[serde(default)]
    pub only_allow_merge_if_pipeline_succeeds: bool,
    #[serde(default)]
    pub merge_commit_template: Option<String>,
}

/// The set of user ids who approved the merge request's current head.
/// Invalidated whenever the head SHA changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Approval {
    pub approved_by: Vec<u64>,
}

impl Approval {
    pub fn contains(&self, user_id: u64) -> bool {
        self.approved_by.contains(&user_id)
    }

    pub fn len(&self) -> usize {
        self.approved_by.len()
    }

    pub fn is_empty(&self) -> bool {
        self.approved_by.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Created,
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
    Skipped,
    Manual,
}

impl PipelineStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineStatus::Success
                | PipelineStatus::Failed
                | PipelineStatus::Canceled
                | PipelineStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Pipeline {
    pub id: u64,
    pub project_id: u64,
    pub sha: String,
    #[serde(rename = "ref")]
    pub ref_: String,
    pub status: PipelineStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MergeRequest {
    pub project_id: u64,
    pub iid: u64,
    pub source_branch: String,
    pub target_branch: String,
    /// The project the source branch lives in. Differs from `project_id`
    /// for a forked merge request (I4).
    pub source_project_id: u64,
    /// SHA of the current tip. This is a point-in-time read (§3): any
    /// decision depending on freshness must refetch first.
    pub sha: String,
    #[serde(default)]
    pub assignee_id: Option<u64>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub approvals: Approval,
    #[serde(default)]
    pub work_in_progress: bool,
    #[serde(default)]
    pub squash: bool,
    pub web_url: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub state: MergeRequestState,
    /// True once every blocking discussion thread is resolved, or the
    /// project doesn't require resolution at all (§4.5 VALIDATE: "no
    /// unresolved discussions, if required").
    #[serde(default = "default_true")]
    pub blocking_discussions_resolved: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRequestState {
    #[default]
    Opened,
    Closed,
    Locked,
    Merged,
}

impl MergeRequest {
    pub fn is_open(&self) -> bool {
        self.state == MergeRequestState::Opened
    }
}

/// A commit belonging to a merge request's diff, as returned by
/// get-MR-commits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CommitRef {
    pub id: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOrder {
    AssignedAt,
    CreatedAt,
}

#[derive(Debug, Clone)]
pub struct AcceptParams {
    /// The exact SHA the caller observed CI pass for (I1).
    pub sha: String,
    pub should_remove_source_branch: bool,
    pub squash: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    Merged { merge_commit_sha: String },
    /// HTTP 409: ambiguous between "already merged by someone else" and "sha
    /// mismatch" (Design Notes §9, Open Question a). Callers must follow up
    /// with a GET to classify.
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebaseStatus {
    InProgress,
    Finished,
    Failed,
}
