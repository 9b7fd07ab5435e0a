//! Fusion strategy (C4, §4.4): produce a new source-branch tip that
//! integrates the target branch, by one of {merge, rebase, gitlab-rebase}.
//! Consumes the [`crate::git::GitRunner`] and [`crate::rest::GitHostClient`]
//! capabilities the way the teacher's collaborators consume `&dyn
//! AgentAdapter` — fusion itself holds no state beyond the chosen strategy.

use std::path::Path;
use std::time::Duration;

use tokio::sync::watch;

use crate::errors::{Error, Result};
use crate::git::{GitRunner, RebaseOutcome};
use crate::rest::{GitHostClient, RebaseStatus};
use crate::trailer::{self, CommitPosition, TrailerOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FusionStrategy {
    Merge,
    #[default]
    Rebase,
    GitlabRebase,
}

impl FusionStrategy {
    pub fn from_config(name: &str) -> Option<Self> {
        match name {
            "merge" => Some(Self::Merge),
            "rebase" => Some(Self::Rebase),
            "gitlab-rebase" | "gitlab_rebase" => Some(Self::GitlabRebase),
            _ => None,
        }
    }
}

/// The new tip produced by a fusion pass, ready to push with
/// force-with-lease (local strategies) or already pushed by the service
/// (gitlab-rebase).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusedTip {
    pub sha: String,
}

/// Fetches `target`, integrates it into `branch` according to `strategy`,
/// and rewrites commit trailers on the result (§4.1: "Merge-commits are
/// skipped in rewriting for rebase strategies; for merge strategies, only
/// the produced merge commit is rewritten").
pub struct Fusion<'a> {
    git: &'a dyn GitRunner,
    client: &'a dyn GitHostClient,
    strategy: FusionStrategy,
}

impl<'a> Fusion<'a> {
    pub fn new(git: &'a dyn GitRunner, client: &'a dyn GitHostClient, strategy: FusionStrategy) -> Self {
        Self {
            git,
            client,
            strategy,
        }
    }

    /// Exposes the underlying runner for steps the fusion pass doesn't own
    /// itself, such as the single job's post-fusion push (§4.5 UPDATE→PUSH).
    pub fn git(&self) -> &'a dyn GitRunner {
        self.git
    }

    pub fn strategy(&self) -> FusionStrategy {
        self.strategy
    }

    /// Fuse `branch` (source) with `target`, having push access to the repo
    /// that `repo_path` points at. `has_fork_push_access` gates whether
    /// `Rebase` is even attempted for a forked MR (I4).
    pub async fn fuse(
        &self,
        repo_path: &Path,
        target: &str,
        branch: &str,
        trailer_opts: &TrailerOptions,
        reviewers: &[crate::rest::User],
        mr_iid: u64,
        mr_web_url: &str,
        is_fork: bool,
        has_fork_push_access: bool,
        project_id: u64,
        poll_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Result<FusedTip> {
        match self.strategy {
            FusionStrategy::Merge => self.fuse_merge(repo_path, target, branch, trailer_opts, reviewers, mr_iid, mr_web_url),
            FusionStrategy::Rebase => {
                if is_fork && !has_fork_push_access {
                    return Err(Error::cannot_merge("no fork push"));
                }
                self.fuse_rebase(repo_path, target, branch, trailer_opts, reviewers, mr_iid, mr_web_url)
            }
            FusionStrategy::GitlabRebase => {
                self.fuse_gitlab_rebase(project_id, mr_iid, poll_interval, shutdown)
                    .await
            }
        }
    }

    fn fuse_rebase(
        &self,
        repo_path: &Path,
        target: &str,
        branch: &str,
        trailer_opts: &TrailerOptions,
        reviewers: &[crate::rest::User],
        mr_iid: u64,
        mr_web_url: &str,
    ) -> Result<FusedTip> {
        self.git.fetch(repo_path, "origin", target)?;
        self.git.checkout(repo_path, branch)?;

        let target_ref = format!("origin/{target}");
        let original_commits = self
            .git
            .rev_list(repo_path, &format!("{target_ref}..{branch}"))?;
        if original_commits.is_empty() {
            return Err(Error::cannot_merge("no commits to integrate"));
        }

        // Rebase by reset + cherry-pick rather than `git rebase --onto` so each
        // commit can be amended with trailers as it lands (§4.1's cherry-pick
        // footer) instead of a separate pass over already-moved history.
        self.git.reset_hard(repo_path, &target_ref)?;

        for (i, rev) in original_commits.iter().enumerate() {
            match self.git.cherry_pick(repo_path, rev)? {
                RebaseOutcome::Conflict => {
                    return Err(Error::cannot_merge(format!(
                        "rebase of {branch} onto {target} conflicts at {rev}"
                    )));
                }
                RebaseOutcome::Success => {}
            }

            let position = if i + 1 == original_commits.len() {
                CommitPosition::Last
            } else {
                CommitPosition::Middle
            };
            let message = self.git.commit_message(repo_path, "HEAD")?;
            let trailers =
                trailer::build_trailers(trailer_opts, reviewers, mr_iid, mr_web_url, position, Some(rev));
            let rewritten = trailer::apply_trailers(&message, &trailers);
            self.git.commit_amend_message(repo_path, &rewritten)?;
        }

        let sha = self.git.rev_parse(repo_path, branch)?;
        Ok(FusedTip { sha })
    }

    fn fuse_merge(
        &self,
        repo_path: &Path,
        target: &str,
        branch: &str,
        trailer_opts: &TrailerOptions,
        reviewers: &[crate::rest::User],
        mr_iid: u64,
        mr_web_url: &str,
    ) -> Result<FusedTip> {
        self.git.fetch(repo_path, "origin", target)?;
        self.git.checkout(repo_path, branch)?;

        let message = format!("Merge branch '{target}' into {branch}");
        match self
            .git
            .merge_no_ff(repo_path, &format!("origin/{target}"), &message)?
        {
            RebaseOutcome::Conflict => {
                return Err(Error::cannot_merge(format!(
                    "merge of {target} into {branch} conflicts"
                )));
            }
            RebaseOutcome::Success => {}
        }

        // only the produced merge commit is rewritten for merge strategies (§4.1)
        let message = self.git.commit_message(repo_path, "HEAD")?;
        let trailers = trailer::build_trailers(
            trailer_opts,
            reviewers,
            mr_iid,
            mr_web_url,
            CommitPosition::Last,
            None,
        );
        let rewritten = trailer::apply_trailers(&message, &trailers);
        self.git.commit_amend_message(repo_path, &rewritten)?;

        let sha = self.git.rev_parse(repo_path, branch)?;
        Ok(FusedTip { sha })
    }

    async fn fuse_gitlab_rebase(
        &self,
        project_id: u64,
        iid: u64,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<FusedTip> {
        self.client.rebase_mr(project_id, iid)?;
        loop {
            match self.client.get_mr_rebase_status(project_id, iid)? {
                RebaseStatus::Finished => {
                    let mr = self.client.get_mr(project_id, iid)?;
                    return Ok(FusedTip { sha: mr.sha });
                }
                RebaseStatus::Failed => {
                    return Err(Error::cannot_merge("gitlab-rebase endpoint reported failure"));
                }
                RebaseStatus::InProgress => {}
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {
                    return Err(Error::Superseded);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_parses_each_known_name() {
        assert_eq!(FusionStrategy::from_config("merge"), Some(FusionStrategy::Merge));
        assert_eq!(FusionStrategy::from_config("rebase"), Some(FusionStrategy::Rebase));
        assert_eq!(
            FusionStrategy::from_config("gitlab-rebase"),
            Some(FusionStrategy::GitlabRebase)
        );
        assert_eq!(FusionStrategy::from_config("bogus"), None);
    }

    #[test]
    fn default_strategy_is_rebase() {
        assert_eq!(FusionStrategy::default(), FusionStrategy::Rebase);
    }
}
