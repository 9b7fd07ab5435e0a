//! The merge-request host's REST surface (§6), abstracted behind a trait so
//! jobs and the driver depend on `&dyn GitHostClient` the way the teacher's
//! supervisor depends on `&dyn AgentAdapter` rather than a concrete HTTP
//! client.

pub mod client;
pub mod types;

use crate::errors::Result;
pub use types::{
    AcceptOutcome, AcceptParams, AccessLevel, Approval, CommitRef, MergeMethod, MergeOrder,
    MergeRequest, MergeRequestState, Pipeline, PipelineStatus, Project, RebaseStatus, User,
};

/// Every operation named in §6's "Upstream service REST surface" list.
/// Implementations are responsible for pagination and for classifying
/// retryable failures as [`crate::errors::Error::TransientApi`] with their
/// own bounded backoff (§7).
pub trait GitHostClient: Send + Sync {
    fn list_my_projects(&self) -> Result<Vec<Project>>;

    fn list_open_mrs_assigned_to_user(
        &self,
        project_id: u64,
        user_id: u64,
        order: MergeOrder,
    ) -> Result<Vec<MergeRequest>>;

    fn get_mr(&self, project_id: u64, iid: u64) -> Result<MergeRequest>;

    /// Resolve a bare project id to its path (needed to build a clone URL
    /// for a forked MR's source project, which `list_my_projects` won't
    /// surface if the bot has no membership there).
    fn get_project(&self, project_id: u64) -> Result<Project>;

    fn get_mr_commits(&self, project_id: u64, iid: u64) -> Result<Vec<CommitRef>>;

    fn get_pipelines_for_sha(&self, project_id: u64, sha: &str) -> Result<Vec<Pipeline>>;

    fn accept_mr(&self, project_id: u64, iid: u64, params: AcceptParams) -> Result<AcceptOutcome>;

    fn rebase_mr(&self, project_id: u64, iid: u64) -> Result<()>;

    fn get_mr_rebase_status(&self, project_id: u64, iid: u64) -> Result<RebaseStatus>;

    /// Approve as `as_user`. Requires [`GitHostClient::has_admin_capability`]
    /// (Design Notes §9: impersonation is a capability on the client, not an
    /// ad hoc check scattered through the jobs).
    fn approve_mr_as(&self, project_id: u64, iid: u64, as_user: u64) -> Result<()>;

    fn unassign_mr(&self, project_id: u64, iid: u64) -> Result<()>;

    fn post_note_on_mr(&self, project_id: u64, iid: u64, body: &str) -> Result<()>;

    fn get_user_by_id(&self, id: u64) -> Result<User>;

    fn get_user_by_username(&self, username: &str) -> Result<User>;

    /// True if this client holds an admin token and can impersonate other
    /// users for re-approval and email lookup.
    fn has_admin_capability(&self) -> bool;
}
