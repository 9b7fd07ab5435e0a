//! Approvals gate (C2, §4.2): snapshot approvers before any rewrite,
//! re-approve as each of them afterwards when the service reset approvals
//! and impersonation is available.

use tracing::{info, warn};

use crate::errors::Result;
use crate::rest::{Approval, GitHostClient, User};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalSnapshot {
    approver_ids: Vec<u64>,
}

impl ApprovalSnapshot {
    pub fn capture(approval: &Approval) -> Self {
        let mut approver_ids = approval.approved_by.clone();
        approver_ids.sort_unstable();
        Self { approver_ids }
    }

    pub fn is_empty(&self) -> bool {
        self.approver_ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.approver_ids.len()
    }

    /// True if `after` is missing an approver that was present in `self`,
    /// i.e. the service reset approvals on rewrite (§4.2).
    pub fn was_reset_by(&self, after: &Approval) -> bool {
        !self.is_empty() && self.approver_ids.iter().any(|id| !after.contains(*id))
    }
}

/// What to do once a rewrite's approval fallout has been observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReapproveOutcome {
    /// Nothing to do: approvals survived the rewrite, or there were none.
    Unchanged,
    /// Approvals were reset and successfully restored via impersonation.
    Reapproved { restored: Vec<u64> },
    /// Approvals were reset but the bot has no impersonation capability;
    /// tolerated because the project does not require approvals to merge.
    ToleratedWithoutApprovals,
}

/// Requires [`GitHostClient::has_admin_capability`] to actually reapprove
/// (Design Notes §9: "model as a capability held by the REST client ...
/// do not sprinkle admin checks in every state").
pub struct ApprovalsGate<'a> {
    client: &'a dyn GitHostClient,
    reapprove_enabled: bool,
    approvals_required_for_merge: bool,
}

impl<'a> ApprovalsGate<'a> {
    pub fn new(
        client: &'a dyn GitHostClient,
        reapprove_enabled: bool,
        approvals_required_for_merge: bool,
    ) -> Self {
        Self {
            client,
            reapprove_enabled,
            approvals_required_for_merge,
        }
    }

    pub fn snapshot(&self, approval: &Approval) -> ApprovalSnapshot {
        ApprovalSnapshot::capture(approval)
    }

    /// Restore approvals after a rewrite, following §4.2: only act if the
    /// service actually reset them; re-approve via impersonation if enabled
    /// and available, otherwise tolerate the loss only when the project
    /// does not gate merge on approval count.
    pub fn restore_after_rewrite(
        &self,
        project_id: u64,
        iid: u64,
        before: &ApprovalSnapshot,
        after: &Approval,
    ) -> Result<ReapproveOutcome> {
        if !before.was_reset_by(after) {
            return Ok(ReapproveOutcome::Unchanged);
        }

        if self.reapprove_enabled && self.client.has_admin_capability() {
            let mut restored = Vec::new();
            for &user_id in &before.approver_ids {
                self.client.approve_mr_as(project_id, iid, user_id)?;
                restored.push(user_id);
            }
            info!(project_id, iid, count = restored.len(), "reapproved after rewrite");
            return Ok(ReapproveOutcome::Reapproved { restored });
        }

        if self.approvals_required_for_merge {
            return Err(crate::errors::Error::cannot_merge(
                "approvals were reset by the rewrite and cannot be restored",
            ));
        }

        warn!(project_id, iid, "approvals reset and not restored; merge does not require them");
        Ok(ReapproveOutcome::ToleratedWithoutApprovals)
    }
}

/// Resolve approver emails for [`crate::trailer::build_trailers`], best
/// effort: omits an approver whose email cannot be resolved rather than
/// failing the whole gate (§4.1: "omitted otherwise").
pub fn resolve_approver_users(client: &dyn GitHostClient, snapshot: &ApprovalSnapshot) -> Vec<User> {
    snapshot
        .approver_ids
        .iter()
        .filter_map(|&id| client.get_user_by_id(id).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use crate::rest::{
        AcceptOutcome, AcceptParams, CommitRef, MergeOrder, MergeRequest, Pipeline, Project,
        RebaseStatus,
    };
    use std::sync::Mutex;

    struct FakeClient {
        admin: bool,
        approved_as: Mutex<Vec<u64>>,
    }

    impl GitHostClient for FakeClient {
        fn list_my_projects(&self) -> Result<Vec<Project>> {
            unimplemented!()
        }
        fn list_open_mrs_assigned_to_user(
            &self,
            _project_id: u64,
            _user_id: u64,
            _order: MergeOrder,
        ) -> Result<Vec<MergeRequest>> {
            unimplemented!()
        }
        fn get_mr(&self, _project_id: u64, _iid: u64) -> Result<MergeRequest> {
            unimplemented!()
        }
        fn get_project(&self, _project_id: u64) -> Result<Project> {
            unimplemented!()
        }
        fn get_mr_commits(&self, _project_id: u64, _iid: u64) -> Result<Vec<CommitRef>> {
            unimplemented!()
        }
        fn get_pipelines_for_sha(&self, _project_id: u64, _sha: &str) -> Result<Vec<Pipeline>> {
            unimplemented!()
        }
        fn accept_mr(
            &self,
            _project_id: u64,
            _iid: u64,
            _params: AcceptParams,
        ) -> Result<AcceptOutcome> {
            unimplemented!()
        }
        fn rebase_mr(&self, _project_id: u64, _iid: u64) -> Result<()> {
            unimplemented!()
        }
        fn get_mr_rebase_status(&self, _project_id: u64, _iid: u64) -> Result<RebaseStatus> {
            unimplemented!()
        }
        fn approve_mr_as(&self, _project_id: u64, _iid: u64, as_user: u64) -> Result<()> {
            self.approved_as.lock().unwrap().push(as_user);
            Ok(())
        }
        fn unassign_mr(&self, _project_id: u64, _iid: u64) -> Result<()> {
            unimplemented!()
        }
        fn post_note_on_mr(&self, _project_id: u64, _iid: u64, _body: &str) -> Result<()> {
            unimplemented!()
        }
        fn get_user_by_id(&self, _id: u64) -> Result<User> {
            unimplemented!()
        }
        fn get_user_by_username(&self, _username: &str) -> Result<User> {
            unimplemented!()
        }
        fn has_admin_capability(&self) -> bool {
            self.admin
        }
    }

    #[test]
    fn unchanged_when_approvals_survive() {
        let client = FakeClient {
            admin: true,
            approved_as: Mutex::new(vec![]),
        };
        let gate = ApprovalsGate::new(&client, true, true);
        let before = ApprovalSnapshot {
            approver_ids: vec![1, 2],
        };
        let after = Approval {
            approved_by: vec![1, 2],
        };
        let outcome = gate.restore_after_rewrite(1, 1, &before, &after).unwrap();
        assert_eq!(outcome, ReapproveOutcome::Unchanged);
        assert!(client.approved_as.lock().unwrap().is_empty());
    }

    #[test]
    fn reapproves_each_snapshotted_user_when_admin_and_enabled() {
        let client = FakeClient {
            admin: true,
            approved_as: Mutex::new(vec![]),
        };
        let gate = ApprovalsGate::new(&client, true, true);
        let before = ApprovalSnapshot {
            approver_ids: vec![1, 2],
        };
        let after = Approval { approved_by: vec![] };
        let outcome = gate.restore_after_rewrite(1, 1, &before, &after).unwrap();
        assert_eq!(
            outcome,
            ReapproveOutcome::Reapproved {
                restored: vec![1, 2]
            }
        );
        assert_eq!(*client.approved_as.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn tolerates_loss_when_not_required_and_not_admin() {
        let client = FakeClient {
            admin: false,
            approved_as: Mutex::new(vec![]),
        };
        let gate = ApprovalsGate::new(&client, true, false);
        let before = ApprovalSnapshot {
            approver_ids: vec![1],
        };
        let after = Approval { approved_by: vec![] };
        let outcome = gate.restore_after_rewrite(1, 1, &before, &after).unwrap();
        assert_eq!(outcome, ReapproveOutcome::ToleratedWithoutApprovals);
    }

    #[test]
    fn fails_when_required_and_cannot_reapprove() {
        let client = FakeClient {
            admin: false,
            approved_as: Mutex::new(vec![]),
        };
        let gate = ApprovalsGate::new(&client, false, true);
        let before = ApprovalSnapshot {
            approver_ids: vec![1],
        };
        let after = Approval { approved_by: vec![] };
        let result = gate.restore_after_rewrite(1, 1, &before, &after);
        assert!(matches!(result, Err(Error::CannotMerge(_))));
    }
}
