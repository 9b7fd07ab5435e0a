//! Batch merge job (C6, §4.6): amortize CI cost by speculatively chaining
//! several merge requests onto one integration branch `batch/<target>`
//! before waiting for CI once.

use std::path::Path;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::approvals::ApprovalSnapshot;
use crate::ci::{CiOutcome, CiWaiter};
use crate::errors::{Error, Result};
use crate::fusion::Fusion;
use crate::rest::{AcceptOutcome, AcceptParams, GitHostClient, MergeRequest};
use crate::trailer::TrailerOptions;

pub struct BatchJobConfig {
    pub should_remove_source_branch: bool,
    pub squash: bool,
    pub ci_poll_interval: Duration,
    pub ci_deadline: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every fused MR in the prefix was accepted, in order.
    Accepted { merged: Vec<(u64, String)> },
    /// CI failed (or the batch tip was superseded); caller falls through to
    /// single-job on `fall_through_to`.
    Failed {
        fall_through_to: u64,
        reason: String,
    },
}

/// Candidate merge requests the caller has already deemed individually
/// eligible to be part of a batch (open, assigned, not WIP, no fork-access
/// problem for fork candidates beyond this module's own push-access check).
pub struct BatchJob<'a> {
    client: &'a dyn GitHostClient,
    fusion: Fusion<'a>,
    repo_path: &'a Path,
    target_branch: &'a str,
    trailer_opts: &'a TrailerOptions,
    manual_policy: crate::ci::ManualPipelinePolicy,
    config: BatchJobConfig,
}

impl<'a> BatchJob<'a> {
    pub fn new(
        client: &'a dyn GitHostClient,
        fusion: Fusion<'a>,
        repo_path: &'a Path,
        target_branch: &'a str,
        trailer_opts: &'a TrailerOptions,
        manual_policy: crate::ci::ManualPipelinePolicy,
        config: BatchJobConfig,
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

    /// Run the §4.6 algorithm over `candidates`, which must already be
    /// ordered per the configured `merge_order`. `can_push_source` answers
    /// whether the bot has push access to fuse `mr`'s source branch
    /// in-place (always true for same-project MRs, I4 for forks).
    pub async fn run(
        &self,
        candidates: &[MergeRequest],
        mut can_push_source: impl FnMut(&MergeRequest) -> bool,
        shutdown: watch::Receiver<bool>,
    ) -> Result<BatchOutcome> {
        if candidates.is_empty() {
            return Err(Error::cannot_batch("no candidates"));
        }
        if self.fusion.strategy() == crate::fusion::FusionStrategy::GitlabRebase {
            return Err(Error::cannot_batch(
                "batch mode requires a local integration branch",
            ));
        }

        let batch_branch = format!("batch/{}", self.target_branch);
        let target_ref = format!("origin/{}", self.target_branch);
        self.git()
            .fetch(self.repo_path, "origin", self.target_branch)?;
        self.git()
            .checkout_reset(self.repo_path, &batch_branch, &target_ref)?;

        let mut prefix = Vec::new();
        for (i, mr) in candidates.iter().enumerate() {
            if !can_push_source(mr) {
                if i == 0 {
                    return Err(Error::cannot_batch(format!(
                        "MR !{} is a fork without push access",
                        mr.iid
                    )));
                }
                break;
            }

            let reviewers = crate::approvals::resolve_approver_users(
                self.client,
                &ApprovalSnapshot::capture(&mr.approvals),
            );

            match self.fuse_onto_batch(mr, &target_ref, &reviewers) {
                Ok(sha) => prefix.push((mr.clone(), sha)),
                Err(_) if i == 0 => {
                    return Err(Error::cannot_batch(format!(
                        "MR !{} conflicts fusing onto the target branch",
                        mr.iid
                    )));
                }
                Err(_) => {
                    warn!(iid = mr.iid, "dropping MR from batch, conflicts with prefix");
                    break;
                }
            }
        }

        if prefix.is_empty() {
            return Err(Error::cannot_batch("no MR in the candidate set could be fused"));
        }

        let batch_tip = self.git().rev_parse(self.repo_path, &batch_branch)?;
        self.git()
            .push(self.repo_path, "origin", &format!("{batch_branch}:{batch_branch}"))?;

        let waiter = CiWaiter::new(
            self.client,
            self.config.ci_poll_interval,
            self.config.ci_deadline,
            self.manual_policy,
        );
        let project_id = prefix[0].0.project_id;
        let outcome = waiter
            .wait(
                project_id,
                &batch_branch,
                &batch_tip,
                || Ok(batch_tip.clone()),
                shutdown,
            )
            .await?;

        match outcome {
            CiOutcome::Ok { .. } => self.accept_prefix(&prefix),
            CiOutcome::Failed { reason } => Ok(BatchOutcome::Failed {
                fall_through_to: prefix[0].0.iid,
                reason,
            }),
            CiOutcome::Timeout => Ok(BatchOutcome::Failed {
                fall_through_to: prefix[0].0.iid,
                reason: "CI wait deadline exceeded".to_string(),
            }),
            CiOutcome::Superseded => Ok(BatchOutcome::Failed {
                fall_through_to: prefix[0].0.iid,
                reason: "batch tip superseded".to_string(),
            }),
        }
    }

    /// Fetch `mr`'s source branch, cherry-pick the commits it contributes
    /// beyond `original_target_ref` onto the current `HEAD` (the batch
    /// branch as fused so far), rewriting trailers as each lands. Returns
    /// the new batch tip SHA.
    fn fuse_onto_batch(
        &self,
        mr: &MergeRequest,
        original_target_ref: &str,
        reviewers: &[crate::rest::User],
    ) -> Result<String> {
        let remote = if mr.source_project_id != mr.project_id { "source" } else { "origin" };
        self.git().fetch(self.repo_path, remote, &mr.source_branch)?;
        let source_ref = format!("{remote}/{}", mr.source_branch);

        let commits = self
            .git()
            .rev_list(self.repo_path, &format!("{original_target_ref}..{source_ref}"))?;
        if commits.is_empty() {
            return Err(Error::cannot_merge(format!("MR !{} has no new commits", mr.iid)));
        }

        for (i, rev) in commits.iter().enumerate() {
            self.git().cherry_pick(self.repo_path, rev).and_then(|outcome| {
                match outcome {
                    crate::git::RebaseOutcome::Success => Ok(()),
                    crate::git::RebaseOutcome::Conflict => Err(Error::cannot_merge(format!(
                        "cherry-pick of {rev} onto the batch branch conflicts"
                    ))),
                }
            })?;

            let position = if i + 1 == commits.len() {
                crate::trailer::CommitPosition::Last
            } else {
                crate::trailer::CommitPosition::Middle
            };
            let message = self.git().commit_message(self.repo_path, "HEAD")?;
            let trailers = crate::trailer::build_trailers(
                self.trailer_opts,
                reviewers,
                mr.iid,
                &mr.web_url,
                position,
                Some(rev),
            );
            let rewritten = crate::trailer::apply_trailers(&message, &trailers);
            self.git().commit_amend_message(self.repo_path, &rewritten)?;
        }

        self.git().rev_parse(self.repo_path, "HEAD")
    }

    /// §4.6 step 4: update each MR's source branch to its prefix SHA and
    /// accept in order, stopping (not erroring) on the first accept
    /// failure so the remainder is retried next iteration against an
    /// already-updated target.
    fn accept_prefix(&self, prefix: &[(MergeRequest, String)]) -> Result<BatchOutcome> {
        let mut merged = Vec::new();
        for (mr, sha) in prefix {
            let remote = if mr.source_project_id != mr.project_id { "source" } else { "origin" };
            let pushed = self.git().push_force_with_lease(
                self.repo_path,
                remote,
                &mr.source_branch,
                &mr.sha,
            )?;
            if !pushed {
                break;
            }

            let outcome = self.client.accept_mr(
                mr.project_id,
                mr.iid,
                AcceptParams {
                    sha: sha.clone(),
                    should_remove_source_branch: self.config.should_remove_source_branch,
                    squash: self.config.squash,
                },
            )?;

            match outcome {
                AcceptOutcome::Merged { merge_commit_sha } => {
                    info!(iid = mr.iid, %merge_commit_sha, "batch member merged");
                    merged.push((mr.iid, merge_commit_sha));
                }
                AcceptOutcome::Conflict => break,
            }
        }
        Ok(BatchOutcome::Accepted { merged })
    }

    fn git(&self) -> &'a dyn crate::git::GitRunner {
        self.fusion.git()
    }
}
