//! Blocking HTTP implementation of [`GitHostClient`] over `ureq`, the same
//! HTTP crate the teacher uses for its Telegram Bot API client. Blocking by
//! design: callers invoke it from `tokio::task::spawn_blocking` so the
//! cooperative async suspension points stay limited to the CI waiter and the
//! inter-scan sleeps (§5).

use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::errors::{Error, Result};

use super::{
    AcceptOutcome, AcceptParams, GitHostClient, MergeOrder, MergeRequest, Pipeline, Project,
    RebaseStatus, User,
    types::CommitRef,
};

const MAX_RETRIES: u32 = 4;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

pub struct HttpGitHostClient {
    base_url: String,
    token: String,
    admin: bool,
    agent: ureq::Agent,
}

impl HttpGitHostClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, admin: bool) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            admin,
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(30))
                .build(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Perform one request with bounded exponential backoff on 429/5xx,
    /// classified as [`Error::TransientApi`] once the budget is exhausted
    /// (§7).
    fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
        sudo: Option<u64>,
    ) -> Result<ureq::Response> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut req = self
                .agent
                .request(method, &self.url(path))
                .set("PRIVATE-TOKEN", &self.token);
            if let Some(user_id) = sudo {
                req = req.set("Sudo", &user_id.to_string());
            }

            let result = match &body {
                Some(payload) => req.send_json(payload.clone()),
                None => req.call(),
            };

            match result {
                Ok(response) => return Ok(response),
                Err(ureq::Error::Status(code, response)) => {
                    if code == 409 {
                        // Caller classifies 409s itself (Open Question a).
                        return Ok(response);
                    }
                    let retryable = code == 429 || (500..600).contains(&code);
                    if retryable && attempt <= MAX_RETRIES {
                        thread::sleep(BACKOFF_BASE * 2u32.pow(attempt - 1));
                        continue;
                    }
                    return Err(Error::transient(
                        anyhow::anyhow!("HTTP {code} from {method} {path}"),
                        attempt,
                    ));
                }
                Err(err @ ureq::Error::Transport(_)) => {
                    if attempt <= MAX_RETRIES {
                        thread::sleep(BACKOFF_BASE * 2u32.pow(attempt - 1));
                        continue;
                    }
                    return Err(Error::transient(anyhow::anyhow!(err), attempt));
                }
            }
        }
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.request("GET", path, None, None)?;
        response
            .into_json()
            .map_err(|e| Error::transient(anyhow::anyhow!(e), 1))
    }

    /// Follow GitLab-style `x-next-page` pagination until exhausted.
    fn get_all_pages<T: DeserializeOwned>(&self, base_path: &str) -> Result<Vec<T>> {
        let mut page = 1u32;
        let mut items = Vec::new();
        loop {
            let sep = if base_path.contains('?') { '&' } else { '?' };
            let path = format!("{base_path}{sep}page={page}&per_page=100");
            let response = self.request("GET", &path, None, None)?;
            let next_page = response
                .header("x-next-page")
                .and_then(|h| h.parse::<u32>().ok());
            let mut page_items: Vec<T> = response
                .into_json()
                .map_err(|e| Error::transient(anyhow::anyhow!(e), 1))?;
            items.append(&mut page_items);

            match next_page {
                Some(next) if next != 0 => page = next,
                _ => break,
            }
        }
        Ok(items)
    }
}

impl GitHostClient for HttpGitHostClient {
    fn list_my_projects(&self) -> Result<Vec<Project>> {
        self.get_all_pages("/projects?membership=true")
    }

    fn list_open_mrs_assigned_to_user(
        &self,
        project_id: u64,
        user_id: u64,
        order: MergeOrder,
    ) -> Result<Vec<MergeRequest>> {
        let order_by = match order {
            MergeOrder::AssignedAt => "updated_at",
            MergeOrder::CreatedAt => "created_at",
        };
        self.get_all_pages(&format!(
            "/projects/{project_id}/merge_requests?state=opened&assignee_id={user_id}&order_by={order_by}&sort=asc"
        ))
    }

    fn get_mr(&self, project_id: u64, iid: u64) -> Result<MergeRequest> {
        self.get_json(&format!("/projects/{project_id}/merge_requests/{iid}"))
    }

    fn get_project(&self, project_id: u64) -> Result<Project> {
        self.get_json(&format!("/projects/{project_id}"))
    }

    fn get_mr_commits(&self, project_id: u64, iid: u64) -> Result<Vec<CommitRef>> {
        self.get_all_pages(&format!(
            "/projects/{project_id}/merge_requests/{iid}/commits"
        ))
    }

    fn get_pipelines_for_sha(&self, project_id: u64, sha: &str) -> Result<Vec<Pipeline>> {
        let pipelines: Vec<Pipeline> =
            self.get_all_pages(&format!("/projects/{project_id}/pipelines?sha={sha}"))?;
        Ok(pipelines.into_iter().filter(|p| p.sha == sha).collect())
    }

    fn accept_mr(&self, project_id: u64, iid: u64, params: AcceptParams) -> Result<AcceptOutcome> {
        let body = json!({
            "sha": params.sha,
            "should_remove_source_branch": params.should_remove_source_branch,
            "squash": params.squash,
        });
        let response = self.request(
            "PUT",
            &format!("/projects/{project_id}/merge_requests/{iid}/merge"),
            Some(body),
            None,
        )?;
        if response.status() == 409 {
            return Ok(AcceptOutcome::Conflict);
        }
        let value: Value = response
            .into_json()
            .map_err(|e| Error::transient(anyhow::anyhow!(e), 1))?;
        let merge_commit_sha = value
            .get("merge_commit_sha")
            .and_then(Value::as_str)
            .unwrap_or(&params.sha)
            .to_string();
        Ok(AcceptOutcome::Merged { merge_commit_sha })
    }

    fn rebase_mr(&self, project_id: u64, iid: u64) -> Result<()> {
        self.request(
            "PUT",
            &format!("/projects/{project_id}/merge_requests/{iid}/rebase"),
            None,
            None,
        )?;
        Ok(())
    }

    fn get_mr_rebase_status(&self, project_id: u64, iid: u64) -> Result<RebaseStatus> {
        let value: Value = self.get_json(&format!("/projects/{project_id}/merge_requests/{iid}"))?;
        let in_progress = value
            .get("rebase_in_progress")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if in_progress {
            return Ok(RebaseStatus::InProgress);
        }
        match value.get("merge_error").and_then(Value::as_str) {
            Some(msg) if !msg.is_empty() => Ok(RebaseStatus::Failed),
            _ => Ok(RebaseStatus::Finished),
        }
    }

    fn approve_mr_as(&self, project_id: u64, iid: u64, as_user: u64) -> Result<()> {
        if !self.admin {
            return Err(Error::fatal(
                "approve_mr_as requires admin impersonation capability",
            ));
        }
        self.request(
            "POST",
            &format!("/projects/{project_id}/merge_requests/{iid}/approve"),
            None,
            Some(as_user),
        )?;
        Ok(())
    }

    fn unassign_mr(&self, project_id: u64, iid: u64) -> Result<()> {
        self.request(
            "PUT",
            &format!("/projects/{project_id}/merge_requests/{iid}?assignee_ids[]=0"),
            None,
            None,
        )?;
        Ok(())
    }

    fn post_note_on_mr(&self, project_id: u64, iid: u64, body: &str) -> Result<()> {
        self.request(
            "POST",
            &format!("/projects/{project_id}/merge_requests/{iid}/notes"),
            Some(json!({ "body": body })),
            None,
        )?;
        Ok(())
    }

    fn get_user_by_id(&self, id: u64) -> Result<User> {
        self.get_json(&format!("/users/{id}"))
    }

    fn get_user_by_username(&self, username: &str) -> Result<User> {
        let users: Vec<User> = self.get_all_pages(&format!("/users?username={username}"))?;
        users
            .into_iter()
            .next()
            .ok_or_else(|| Error::cannot_merge(format!("no such user: {username}")))
    }

    fn has_admin_capability(&self) -> bool {
        self.admin
    }
}
