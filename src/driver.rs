//! Driver — the top-level scan loop (§5, §6.8).
//!
//! Single-process, cooperative: one project at a time, one MR (or one batch)
//! at a time within a project. Grounded on the teacher's
//! `orchestrator::run_orchestrated` shape (a config struct plus one function
//! that owns the loop and checks a shutdown flag each iteration) but driving
//! merge-request jobs instead of a tmux-supervised agent session.

use std::collections::HashMap;
use std::time::Duration;

use regex::Regex;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::ci::ManualPipelinePolicy;
use crate::errors::Result;
use crate::fusion::{Fusion, FusionStrategy};
use crate::git::ProcessGitRunner;
use crate::interval::IntervalUnion;
use crate::job::batch::{BatchJob, BatchJobConfig, BatchOutcome};
use crate::job::single::{JobOutcome, SingleJob, SingleJobConfig};
use crate::rest::{AccessLevel, GitHostClient, MergeOrder, MergeRequest, Project};
use crate::repo::RepoManager;
use crate::trailer::TrailerOptions;

/// Everything the driver needs that doesn't change across scans. One
/// instance is built from the loaded configuration at startup.
pub struct DriverConfig {
    pub bot_user_id: u64,
    pub merge_order: MergeOrder,
    pub fusion_strategy: FusionStrategy,
    pub allowed_interval: IntervalUnion,
    pub blocking_labels: Vec<String>,
    /// §6.3 `merge.allow_merge_strategies`: a project whose `merge_method`
    /// isn't in this set is soft-failed in VALIDATE rather than silently
    /// merged with a method nobody configured for it.
    pub allowed_merge_strategies: Vec<String>,
    pub batch_enabled: bool,
    pub trailer_opts: TrailerOptions,
    pub manual_pipeline_policy: ManualPipelinePolicy,
    pub single: SingleJobConfigTemplate,
    pub batch: BatchJobConfigTemplate,
    /// §6.8: only projects whose path matches are scanned.
    pub project_regexp: Option<Regex>,
    /// §6.8: only MRs whose target branch matches are candidates.
    pub branch_regexp: Option<Regex>,
    /// §6.8: only MRs whose source branch matches are candidates.
    pub source_branch_regexp: Option<Regex>,
    /// Inter-project sleep between scanning each project in the membership
    /// list (§5: "≈1s").
    pub inter_project_delay: Duration,
    /// Sleep after a scan finds nothing to do in any project (§5: "≈30s
    /// minus cumulative small sleeps").
    pub idle_delay: Duration,
}

/// The parts of [`SingleJobConfig`] that don't depend on a specific project.
pub struct SingleJobConfigTemplate {
    pub should_remove_source_branch: bool,
    pub squash: bool,
    pub approvals_required_for_merge: bool,
    pub reapprove_enabled: bool,
    pub require_discussions_resolved: bool,
    pub max_retries_per_edge: u32,
    pub ci_poll_interval: Duration,
    pub ci_deadline: Duration,
}

pub struct BatchJobConfigTemplate {
    pub should_remove_source_branch: bool,
    pub squash: bool,
    pub ci_poll_interval: Duration,
    pub ci_deadline: Duration,
}

/// Drives one continuous run: scan every project the bot has membership in,
/// process eligible merge requests project by project, sleep, repeat, until
/// `shutdown` fires.
pub struct Driver<'a> {
    client: &'a dyn GitHostClient,
    repos: &'a RepoManager,
    config: &'a DriverConfig,
    projects: HashMap<u64, Project>,
}

impl<'a> Driver<'a> {
    pub fn new(client: &'a dyn GitHostClient, repos: &'a RepoManager, config: &'a DriverConfig) -> Self {
        Self {
            client,
            repos,
            config,
            projects: HashMap::new(),
        }
    }

    /// Run until `shutdown` is set. Returns once the current REST call or
    /// job in flight finishes (§5: "SIGINT/shutdown: finish current REST
    /// call, abandon current MR without accepting").
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let did_work = self.scan_once(shutdown.clone()).await?;

            let delay = if did_work {
                self.config.inter_project_delay
            } else {
                self.config.idle_delay
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    /// §6.5 `Once`: process every eligible project a single time and return
    /// (no inter-scan sleep, no looping).
    pub async fn run_once(&mut self, shutdown: watch::Receiver<bool>) -> Result<bool> {
        self.scan_once(shutdown).await
    }

    /// One pass over every project the bot is a member of. Returns whether
    /// any merge request was processed (merged, batched, or unassigned).
    async fn scan_once(&mut self, shutdown: watch::Receiver<bool>) -> Result<bool> {
        let projects = self.client.list_my_projects()?;
        self.projects = projects.iter().map(|p| (p.id, p.clone())).collect();

        let mut did_work = false;
        for project in &projects {
            if *shutdown.borrow() {
                return Ok(did_work);
            }
            // Mirrors `marge/bot.py`'s `AccessLevel.reporter` gate: a
            // project the bot can't even read merge requests on is skipped
            // before the list-MRs call is made at all.
            if project.access_level < AccessLevel::Reporter {
                continue;
            }
            if let Some(re) = &self.config.project_regexp {
                if !re.is_match(&project.path_with_namespace) {
                    continue;
                }
            }

            let mut candidates = self.client.list_open_mrs_assigned_to_user(
                project.id,
                self.config.bot_user_id,
                self.config.merge_order,
            )?;
            if let Some(re) = &self.config.branch_regexp {
                candidates.retain(|mr| re.is_match(&mr.target_branch));
            }
            if let Some(re) = &self.config.source_branch_regexp {
                candidates.retain(|mr| re.is_match(&mr.source_branch));
            }
            if candidates.is_empty() {
                continue;
            }

            did_work |= self
                .process_project(project.id, &candidates, shutdown.clone())
                .await?;

            let mut next = shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(self.config.inter_project_delay) => {}
                _ = next.changed() => {}
            }
        }
        Ok(did_work)
    }

    /// §4.6: try the batch job over the whole candidate list first (when
    /// enabled and the repo manager has a local clone); on any
    /// [`crate::errors::Error::CannotBatch`] or a CI-level batch failure,
    /// fall back to single-job processing starting at the named MR.
    async fn process_project(
        &self,
        project_id: u64,
        candidates: &[MergeRequest],
        shutdown: watch::Receiver<bool>,
    ) -> Result<bool> {
        if self.config.batch_enabled && !self.repos.transport_is_api_only() && candidates.len() > 1 {
            match self
                .try_batch(project_id, candidates, shutdown.clone())
                .await
            {
                Ok(Some(resume_from)) => {
                    return self
                        .run_single_from(project_id, candidates, resume_from, shutdown)
                        .await;
                }
                Ok(None) => return Ok(true),
                Err(e) => {
                    warn!(project_id, error = %e, "batch attempt failed structurally, falling back to single-job");
                }
            }
        }

        self.run_single_from(project_id, candidates, candidates[0].iid, shutdown)
            .await
    }

    /// Returns `Ok(None)` if the whole candidate set merged via batch,
    /// `Ok(Some(iid))` if the caller should resume single-job processing
    /// starting at `iid` (§4.6: "falls through to single-job on MR[0]" or on
    /// the batch's own CI failure).
    async fn try_batch(
        &self,
        project_id: u64,
        candidates: &[MergeRequest],
        shutdown: watch::Receiver<bool>,
    ) -> Result<Option<u64>> {
        let target_branch = candidates[0].target_branch.clone();
        let ctx = self.repo_context(project_id, &candidates[0])?;
        let runner = self.repos.runner();
        let fusion = self.strategy_fusion(runner);

        let job = BatchJob::new(
            self.client,
            fusion,
            &ctx.path,
            &target_branch,
            &self.config.trailer_opts,
            self.config.manual_pipeline_policy,
            BatchJobConfig {
                should_remove_source_branch: self.config.batch.should_remove_source_branch,
                squash: self.config.batch.squash,
                ci_poll_interval: self.config.batch.ci_poll_interval,
                ci_deadline: self.config.batch.ci_deadline,
            },
        );

        // The batch's single working tree only has `ctx.source_project_id`
        // cloned/remoted; a candidate from a different fork can't be fused
        // into it and is dropped from the batch like a no-push-access fork.
        let outcome = job
            .run(
                candidates,
                |mr| {
                    let is_fork = mr.source_project_id != mr.project_id;
                    mr.source_project_id == ctx.source_project_id
                        && (!is_fork || ctx.has_push_access(is_fork))
                },
                shutdown,
            )
            .await?;

        match outcome {
            BatchOutcome::Accepted { merged } => {
                for (iid, sha) in &merged {
                    info!(project_id, iid, merge_commit_sha = %sha, "batch member merged");
                }
                Ok(None)
            }
            BatchOutcome::Failed {
                fall_through_to,
                reason,
            } => {
                warn!(project_id, fall_through_to, reason, "batch CI outcome, falling through to single-job");
                Ok(Some(fall_through_to))
            }
        }
    }

    /// Process `candidates` one at a time in order, starting at `from_iid`,
    /// stopping at the first [`crate::errors::Error::is_fatal`] error.
    async fn run_single_from(
        &self,
        project_id: u64,
        candidates: &[MergeRequest],
        from_iid: u64,
        shutdown: watch::Receiver<bool>,
    ) -> Result<bool> {
        let start = candidates.iter().position(|mr| mr.iid == from_iid).unwrap_or(0);
        let mut did_work = false;

        for mr in &candidates[start..] {
            if *shutdown.borrow() {
                break;
            }

            let ctx = self.repo_context(project_id, mr)?;
            let is_fork = mr.source_project_id != mr.project_id;
            let runner = self.repos.runner();
            let fusion = self.strategy_fusion(runner);
            let merge_method_allowed = self.merge_method_allowed(project_id);

            let job = SingleJob::new(
                self.client,
                fusion,
                &ctx.path,
                &mr.target_branch,
                &self.config.trailer_opts,
                self.config.manual_pipeline_policy,
                SingleJobConfig {
                    bot_user_id: self.config.bot_user_id,
                    blocking_labels: self.config.blocking_labels.clone(),
                    should_remove_source_branch: self.config.single.should_remove_source_branch,
                    squash: self.config.single.squash,
                    approvals_required_for_merge: self.config.single.approvals_required_for_merge,
                    reapprove_enabled: self.config.single.reapprove_enabled,
                    require_discussions_resolved: self.config.single.require_discussions_resolved,
                    merge_method_allowed,
                    max_retries_per_edge: self.config.single.max_retries_per_edge,
                    ci_poll_interval: self.config.single.ci_poll_interval,
                    ci_deadline: self.config.single.ci_deadline,
                },
            );

            let allowed = self.config.allowed_interval.clone();
            let outcome = job
                .run(
                    project_id,
                    mr.iid,
                    is_fork,
                    ctx.has_push_access(is_fork),
                    || allowed.covers(now()),
                    shutdown.clone(),
                )
                .await;

            match outcome {
                Ok(JobOutcome::Merged { merge_commit_sha }) => {
                    info!(project_id, iid = mr.iid, %merge_commit_sha, "merged");
                    did_work = true;
                }
                Ok(JobOutcome::Unassigned { comment }) => {
                    info!(project_id, iid = mr.iid, comment = ?comment, "unassigned");
                    did_work = true;
                }
                Ok(JobOutcome::Waiting { reason }) => {
                    info!(project_id, iid = mr.iid, reason = %reason, "left assigned, waiting for interval");
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(project_id, iid = mr.iid, error = %e, "job failed, continuing with next candidate");
                }
            }
        }
        Ok(did_work)
    }

    fn strategy_fusion(&self, runner: &'a ProcessGitRunner) -> Fusion<'a> {
        Fusion::new(runner, self.client, self.fusion_strategy())
    }

    fn fusion_strategy(&self) -> FusionStrategy {
        self.config.fusion_strategy
    }

    /// §6.3 `merge.allow_merge_strategies`: `true` when the project's
    /// `merge_method` isn't configured at all (fail open if we somehow
    /// don't have the project cached) or is in the allowed set.
    fn merge_method_allowed(&self, project_id: u64) -> bool {
        self.projects
            .get(&project_id)
            .map(|p| {
                self.config
                    .allowed_merge_strategies
                    .iter()
                    .any(|s| s == p.merge_method.config_name())
            })
            .unwrap_or(true)
    }

    fn repo_context(&self, origin_project_id: u64, mr: &MergeRequest) -> Result<crate::repo::RepoContext> {
        let origin_path = self
            .projects
            .get(&origin_project_id)
            .map(|p| p.path_with_namespace.clone())
            .ok_or_else(|| crate::errors::Error::fatal("unknown origin project path"))?;
        let source_path = if mr.source_project_id == origin_project_id {
            origin_path.clone()
        } else {
            self.client.get_project(mr.source_project_id)?.path_with_namespace
        };
        self.repos.repo_for_project(
            &origin_path,
            origin_project_id,
            &source_path,
            mr.source_project_id,
            true,
        )
    }
}

/// Placeholder for "now" used by the allowed-interval check; kept as a
/// function so tests can be written against [`IntervalUnion::covers`]
/// directly without needing to freeze wall-clock time here.
fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}
