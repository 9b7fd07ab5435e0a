//! Single merge job (C5, §4.5): the merge-request state machine expressed
//! as an explicit tagged enumeration with transition functions, per Design
//! Notes §9 ("avoid deep exception chains").

use std::path::Path;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::approvals::ApprovalSnapshot;
use crate::ci::{CiOutcome, CiWaiter};
use crate::errors::{Error, RetryBudget, Result};
use crate::fusion::Fusion;
use crate::job::{validate, ValidationFailure};
use crate::rest::{AcceptOutcome, AcceptParams, GitHostClient};
use crate::trailer::TrailerOptions;

/// `JobState` names every node in the §4.5 transition table. `Done` and
/// `CannotMerge` are the two terminal states; every other state loops back
/// through the machine until one of those is reached or the retry budget
/// for an edge is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Init,
    Refetch,
    Validate,
    Update,
    Push {
        new_sha: String,
        expected_remote_sha: String,
        source_branch: String,
        approval_snapshot: ApprovalSnapshot,
    },
    AwaitCi { sha: String },
    Accept { sha: String },
    Done { merge_commit_sha: String },
    /// Carries the reason and whether the assignment-removal should carry a
    /// user-visible comment (soft failure) or not (hard failure, §4.5).
    CannotMerge { reason: String, comment: bool },
    /// Outside the allowed weekly interval (§8 Scenario 6): terminal, but
    /// unlike `CannotMerge` it leaves the MR assigned and untouched.
    Waiting { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Merged { merge_commit_sha: String },
    Unassigned { comment: Option<String> },
    /// Left assigned, no action taken; the bot will look at it again on the
    /// next scan once the weekly window reopens.
    Waiting { reason: String },
}

pub struct SingleJobConfig {
    pub bot_user_id: u64,
    pub blocking_labels: Vec<String>,
    pub should_remove_source_branch: bool,
    pub squash: bool,
    pub approvals_required_for_merge: bool,
    pub reapprove_enabled: bool,
    pub require_discussions_resolved: bool,
    pub merge_method_allowed: bool,
    pub max_retries_per_edge: u32,
    pub ci_poll_interval: Duration,
    pub ci_deadline: Duration,
}

pub struct SingleJob<'a> {
    client: &'a dyn GitHostClient,
    fusion: Fusion<'a>,
    repo_path: &'a Path,
    target_branch: &'a str,
    trailer_opts: &'a TrailerOptions,
    manual_policy: crate::ci::ManualPipelinePolicy,
    config: SingleJobConfig,
}

impl<'a> SingleJob<'a> {
    pub fn new(
        client: &'a dyn GitHostClient,
        fusion: Fusion<'a>,
        repo_path: &'a Path,
        target_branch: &'a str,
        trailer_opts: &'a TrailerOptions,
        manual_policy: crate::ci::ManualPipelinePolicy,
        config: SingleJobConfig,
    ) -> Self {
        Self {
            client,
            fusion,
            repo_path,
            target_branch,
            trailer_opts,
            manual_policy,
            config,
        }
    }

    /// Drive `(project_id, iid)` through the full state machine, inside
    /// `inside_allowed_interval`'s current value (recomputed on every
    /// REFETCH since the clock moves while the job runs).
    pub async fn run(
        &self,
        project_id: u64,
        iid: u64,
        is_fork: bool,
        has_fork_push_access: bool,
        mut inside_allowed_interval: impl FnMut() -> bool,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JobOutcome> {
        let mut state = JobState::Init;
        let mut refetch_retries = RetryBudget::new(self.config.max_retries_per_edge);
        let mut push_retries = RetryBudget::new(self.config.max_retries_per_edge);
        let mut accept_retries = RetryBudget::new(self.config.max_retries_per_edge);

        loop {
            state = match state {
                JobState::Init => JobState::Refetch,

                JobState::Refetch => {
                    if !refetch_retries.record_attempt() {
                        JobState::CannotMerge {
                            reason: "exceeded retry budget refetching the merge request".to_string(),
                            comment: true,
                        }
                    } else {
                        JobState::Validate
                    }
                }

                JobState::Validate => {
                    let mr = self.client.get_mr(project_id, iid)?;
                    let approval_snapshot = ApprovalSnapshot::capture(&mr.approvals);
                    let approvals_sufficient =
                        !self.config.approvals_required_for_merge || !approval_snapshot.is_empty();

                    match validate(
                        &mr,
                        self.config.bot_user_id,
                        &self.config.blocking_labels,
                        inside_allowed_interval(),
                        approvals_sufficient,
                        self.config.require_discussions_resolved,
                        self.config.merge_method_allowed,
                    ) {
                        Some(ValidationFailure::Hard) => JobState::CannotMerge {
                            reason: "merge request closed or no longer assigned to the bot".to_string(),
                            comment: false,
                        },
                        Some(ValidationFailure::Soft(reason)) => {
                            JobState::CannotMerge { reason, comment: true }
                        }
                        Some(ValidationFailure::Waiting(reason)) => JobState::Waiting { reason },
                        None => JobState::Update,
                    }
                }

                JobState::Update => {
                    let mr = self.client.get_mr(project_id, iid)?;
                    let approval_snapshot = ApprovalSnapshot::capture(&mr.approvals);
                    let reviewers =
                        crate::approvals::resolve_approver_users(self.client, &approval_snapshot);

                    let fused = self
                        .fusion
                        .fuse(
                            self.repo_path,
                            self.target_branch,
                            &mr.source_branch,
                            self.trailer_opts,
                            &reviewers,
                            mr.iid,
                            &mr.web_url,
                            is_fork,
                            has_fork_push_access,
                            project_id,
                            self.config.ci_poll_interval,
                            shutdown.clone(),
                        )
                        .await?;

                    JobState::Push {
                        new_sha: fused.sha,
                        expected_remote_sha: mr.sha,
                        source_branch: mr.source_branch,
                        approval_snapshot,
                    }
                }

                JobState::Push {
                    new_sha,
                    expected_remote_sha,
                    source_branch,
                    approval_snapshot,
                } => {
                    // I2: rewriting history can take long enough (a slow
                    // rebase, a slow gitlab-rebase poll) that assignment or
                    // approvals change underneath it. Re-confirm both
                    // before pushing, not after.
                    let before_push = self.client.get_mr(project_id, iid)?;
                    let current_approvals = ApprovalSnapshot::capture(&before_push.approvals);
                    let approvals_still_sufficient = !self.config.approvals_required_for_merge
                        || !current_approvals.is_empty();

                    if before_push.assignee_id != Some(self.config.bot_user_id) {
                        JobState::CannotMerge {
                            reason: "reassigned away from the bot while rewriting history".to_string(),
                            comment: false,
                        }
                    } else if !approvals_still_sufficient {
                        JobState::CannotMerge {
                            reason: "approvals were withdrawn while rewriting history".to_string(),
                            comment: true,
                        }
                    } else {
                        // gitlab-rebase pushes server-side; there is nothing local to lease.
                        let remote = if is_fork { "source" } else { "origin" };
                        let pushed = self.fusion.strategy() == crate::fusion::FusionStrategy::GitlabRebase
                            || self.fusion.git().push_force_with_lease(
                                self.repo_path,
                                remote,
                                &source_branch,
                                &expected_remote_sha,
                            )?;

                        if pushed {
                            let after = self.client.get_mr(project_id, iid)?;
                            let gate = crate::approvals::ApprovalsGate::new(
                                self.client,
                                self.config.reapprove_enabled,
                                self.config.approvals_required_for_merge,
                            );
                            gate.restore_after_rewrite(
                                project_id,
                                iid,
                                &approval_snapshot,
                                &after.approvals,
                            )?;
                            JobState::AwaitCi { sha: new_sha }
                        } else if push_retries.record_attempt() {
                            warn!(project_id, iid, "push rejected by lease, retrying");
                            JobState::Refetch
                        } else {
                            JobState::CannotMerge {
                                reason: "exceeded retry budget on push race".to_string(),
                                comment: true,
                            }
                        }
                    }
                }

                JobState::AwaitCi { sha } => {
                    let waiter = CiWaiter::new(
                        self.client,
                        self.config.ci_poll_interval,
                        self.config.ci_deadline,
                        self.manual_policy,
                    );
                    let outcome = waiter
                        .wait(
                            project_id,
                            self.target_branch,
                            &sha,
                            || Ok(self.client.get_mr(project_id, iid)?.sha),
                            shutdown.clone(),
                        )
                        .await?;

                    match outcome {
                        CiOutcome::Ok { .. } => JobState::Accept { sha },
                        CiOutcome::Superseded => JobState::Refetch,
                        CiOutcome::Failed { reason } => JobState::CannotMerge {
                            reason: format!("pipeline failed on rebased commit {sha}: {reason}"),
                            comment: true,
                        },
                        CiOutcome::Timeout => JobState::CannotMerge {
                            reason: format!("CI wait deadline exceeded for commit {sha}"),
                            comment: true,
                        },
                    }
                }

                JobState::Accept { sha } => {
                    let outcome = self.client.accept_mr(
                        project_id,
                        iid,
                        AcceptParams {
                            sha: sha.clone(),
                            should_remove_source_branch: self.config.should_remove_source_branch,
                            squash: self.config.squash,
                        },
                    )?;

                    match outcome {
                        AcceptOutcome::Merged { merge_commit_sha } => {
                            JobState::Done { merge_commit_sha }
                        }
                        AcceptOutcome::Conflict => {
                            // Open Question a: classify with a follow-up GET instead of guessing.
                            let mr = self.client.get_mr(project_id, iid)?;
                            if !mr.is_open() {
                                JobState::Done {
                                    merge_commit_sha: mr.sha,
                                }
                            } else if accept_retries.record_attempt() {
                                JobState::Refetch
                            } else {
                                JobState::CannotMerge {
                                    reason: "exceeded retry budget on accept conflict".to_string(),
                                    comment: true,
                                }
                            }
                        }
                    }
                }

                JobState::Done { merge_commit_sha } => {
                    info!(project_id, iid, %merge_commit_sha, "merge request merged");
                    return Ok(JobOutcome::Merged { merge_commit_sha });
                }

                JobState::CannotMerge { reason, comment } => {
                    if comment {
                        let _ = self.client.post_note_on_mr(project_id, iid, &reason);
                    }
                    let _ = self.client.unassign_mr(project_id, iid);
                    return Ok(JobOutcome::Unassigned {
                        comment: comment.then_some(reason),
                    });
                }

                JobState::Waiting { reason } => {
                    info!(project_id, iid, reason = %reason, "left assigned, waiting for interval");
                    return Ok(JobOutcome::Waiting { reason });
                }
            };

            if *shutdown.borrow() {
                return Err(Error::cannot_merge("shutdown requested before job completed"));
            }
        }
    }
}
