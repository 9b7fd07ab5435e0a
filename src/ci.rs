//! CI waiter (C3, §4.3): block until the pipeline for a given `(branch, sha)`
//! reaches a terminal state, classify the outcome. The only long suspension
//! point in a job (§5), so it uses `tokio::time::sleep` for cooperative
//! cancellation instead of a blocking loop (Design Notes §9: "use a
//! cooperative timer... the reference source uses blocking sleeps which
//! complicate shutdown").

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::errors::{Error, Result};
use crate::rest::{GitHostClient, Pipeline, PipelineStatus};

/// Manual-pipeline handling (Open Question b): underspecified upstream, so
/// surfaced as an explicit policy rather than hardcoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManualPipelinePolicy {
    /// A manual job left pending is treated as a CI failure.
    #[default]
    TreatAsFailure,
    /// Keep waiting; a human may still run the manual job before the
    /// deadline.
    Wait,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CiOutcome {
    Ok { pipeline_id: u64 },
    Failed { reason: String },
    Timeout,
    /// The MR's head moved to a different SHA while waiting (external
    /// push); the job must refetch and restart from REFETCH.
    Superseded,
}

pub struct CiWaiter<'a> {
    client: &'a dyn GitHostClient,
    poll_interval: Duration,
    deadline: Duration,
    manual_policy: ManualPipelinePolicy,
}

impl<'a> CiWaiter<'a> {
    pub fn new(
        client: &'a dyn GitHostClient,
        poll_interval: Duration,
        deadline: Duration,
        manual_policy: ManualPipelinePolicy,
    ) -> Self {
        Self {
            client,
            poll_interval,
            deadline,
            manual_policy,
        }
    }

    /// Poll pipelines for `sha` at a fixed cadence. `current_sha` is
    /// refetched each tick via `refetch_sha`; if it no longer equals `sha`
    /// the wait returns `Superseded` immediately (§4.3). `branch` is the
    /// ref the bot pushed; only a pipeline whose ref equals `branch` and
    /// whose SHA equals `sha` is authoritative.
    pub async fn wait(
        &self,
        project_id: u64,
        branch: &str,
        sha: &str,
        mut refetch_sha: impl FnMut() -> Result<String>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<CiOutcome> {
        let start = tokio::time::Instant::now();

        loop {
            if *shutdown.borrow() {
                return Ok(CiOutcome::Timeout);
            }

            let latest = refetch_sha()?;
            if latest != sha {
                return Ok(CiOutcome::Superseded);
            }

            let pipelines = self.client.get_pipelines_for_sha(project_id, sha)?;
            let mut authoritative: Vec<&Pipeline> = pipelines
                .iter()
                .filter(|p| p.ref_ == branch && p.sha == sha)
                .collect();
            authoritative.sort_by_key(|p| std::cmp::Reverse(p.id));

            if let Some(pipeline) = authoritative.first() {
                debug!(project_id, sha, status = ?pipeline.status, "polled pipeline");
                match self.classify(pipeline) {
                    Classification::Pending => {}
                    Classification::Terminal(outcome) => return Ok(outcome),
                }
            }

            if start.elapsed() >= self.deadline {
                info!(project_id, sha, "ci wait deadline exceeded");
                return Ok(CiOutcome::Timeout);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {
                    return Ok(CiOutcome::Timeout);
                }
            }
        }
    }

    fn classify(&self, pipeline: &Pipeline) -> Classification {
        match pipeline.status {
            PipelineStatus::Success => {
                Classification::Terminal(CiOutcome::Ok { pipeline_id: pipeline.id })
            }
            PipelineStatus::Failed | PipelineStatus::Canceled | PipelineStatus::Skipped => {
                Classification::Terminal(CiOutcome::Failed {
                    reason: format!("pipeline {} ended in {:?}", pipeline.id, pipeline.status),
                })
            }
            PipelineStatus::Manual => match self.manual_policy {
                ManualPipelinePolicy::TreatAsFailure => Classification::Terminal(CiOutcome::Failed {
                    reason: format!("pipeline {} is blocked on a manual job", pipeline.id),
                }),
                ManualPipelinePolicy::Wait => Classification::Pending,
            },
            PipelineStatus::Created | PipelineStatus::Pending | PipelineStatus::Running => {
                Classification::Pending
            }
        }
    }
}

enum Classification {
    Pending,
    Terminal(CiOutcome),
}

/// §7: a CI failure is a business condition, not a transient one — surface
/// it as `cannot-merge` with the user-visible reason from `§4.3`.
pub fn outcome_to_error(outcome: CiOutcome, sha: &str) -> Option<Error> {
    match outcome {
        CiOutcome::Ok { .. } => None,
        CiOutcome::Failed { reason } => Some(Error::cannot_merge(format!(
            "pipeline failed on rebased commit {sha}: {reason}"
        ))),
        CiOutcome::Timeout => Some(Error::cannot_merge(format!(
            "CI wait deadline exceeded for commit {sha}"
        ))),
        CiOutcome::Superseded => Some(Error::Superseded),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::{
        AcceptOutcome, AcceptParams, CommitRef, MergeOrder, MergeRequest, Project, RebaseStatus,
        User,
    };
    use std::sync::Mutex;

    struct FakeClient {
        pipelines: Mutex<Vec<Vec<Pipeline>>>,
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
            let mut pipelines = self.pipelines.lock().unwrap();
            if pipelines.len() > 1 {
                Ok(pipelines.remove(0))
            } else {
                Ok(pipelines.first().cloned().unwrap_or_default())
            }
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
        fn approve_mr_as(&self, _project_id: u64, _iid: u64, _as_user: u64) -> Result<()> {
            unimplemented!()
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
            false
        }
    }

    fn pipeline(status: PipelineStatus) -> Pipeline {
        Pipeline {
            id: 1,
            project_id: 1,
            sha: "abc123".to_string(),
            ref_: "mergetrain-batch".to_string(),
            status,
        }
    }

    #[tokio::test]
    async fn succeeds_when_pipeline_reaches_success() {
        let client = FakeClient {
            pipelines: Mutex::new(vec![
                vec![pipeline(PipelineStatus::Running)],
                vec![pipeline(PipelineStatus::Success)],
            ]),
        };
        let waiter = CiWaiter::new(
            &client,
            Duration::from_millis(1),
            Duration::from_secs(5),
            ManualPipelinePolicy::TreatAsFailure,
        );
        let (_tx, rx) = watch::channel(false);
        let outcome = waiter
            .wait(1, "mergetrain-batch", "abc123", || Ok("abc123".to_string()), rx)
            .await
            .unwrap();
        assert_eq!(outcome, CiOutcome::Ok { pipeline_id: 1 });
    }

    #[tokio::test]
    async fn superseded_when_head_moves() {
        let client = FakeClient {
            pipelines: Mutex::new(vec![vec![pipeline(PipelineStatus::Running)]]),
        };
        let waiter = CiWaiter::new(
            &client,
            Duration::from_millis(1),
            Duration::from_secs(5),
            ManualPipelinePolicy::TreatAsFailure,
        );
        let (_tx, rx) = watch::channel(false);
        let outcome = waiter
            .wait(1, "mergetrain-batch", "abc123", || Ok("def456".to_string()), rx)
            .await
            .unwrap();
        assert_eq!(outcome, CiOutcome::Superseded);
    }

    #[tokio::test]
    async fn manual_treated_as_failure_by_default() {
        let client = FakeClient {
            pipelines: Mutex::new(vec![vec![pipeline(PipelineStatus::Manual)]]),
        };
        let waiter = CiWaiter::new(
            &client,
            Duration::from_millis(1),
            Duration::from_secs(5),
            ManualPipelinePolicy::TreatAsFailure,
        );
        let (_tx, rx) = watch::channel(false);
        let outcome = waiter
            .wait(1, "mergetrain-batch", "abc123", || Ok("abc123".to_string()), rx)
            .await
            .unwrap();
        assert!(matches!(outcome, CiOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn times_out_when_deadline_exceeded() {
        let client = FakeClient {
            pipelines: Mutex::new(vec![vec![pipeline(PipelineStatus::Running)]]),
        };
        let waiter = CiWaiter::new(
            &client,
            Duration::from_millis(1),
            Duration::from_millis(5),
            ManualPipelinePolicy::TreatAsFailure,
        );
        let (_tx, rx) = watch::channel(false);
        let outcome = waiter
            .wait(1, "mergetrain-batch", "abc123", || Ok("abc123".to_string()), rx)
            .await
            .unwrap();
        assert_eq!(outcome, CiOutcome::Timeout);
    }
}
