//! Raw git command wrapper (§6: "out of scope" but named). A trait so the
//! repo manager and fusion strategy depend on `&dyn GitRunner`, following the
//! same object-safe-collaborator shape as [`crate::rest::GitHostClient`].
//! The concrete implementation shells out the way the teacher's
//! `merge_queue.rs`/`worktree.rs` do, bounded by a wall-clock timeout using
//! `wait-timeout` the way `shaneholloman-worktrunk`'s `shell/utils.rs` bounds
//! its subprocess probes.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::errors::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebaseOutcome {
    Success,
    Conflict,
}

pub trait GitRunner: Send + Sync {
    fn fetch(&self, repo: &Path, remote: &str, refspec: &str) -> Result<()>;
    fn checkout(&self, repo: &Path, branch: &str) -> Result<()>;
    /// `git checkout -B branch start_point`: create-or-reset `branch` to
    /// `start_point` and switch to it in one step (§4.6 step 1: "Reset
    /// `batch` to the current target-branch tip").
    fn checkout_reset(&self, repo: &Path, branch: &str, start_point: &str) -> Result<()>;
    fn reset_hard(&self, repo: &Path, target: &str) -> Result<()>;
    fn rebase_onto(&self, repo: &Path, upstream: &str, branch: &str) -> Result<RebaseOutcome>;
    fn rebase_abort(&self, repo: &Path) -> Result<()>;
    fn cherry_pick(&self, repo: &Path, commit: &str) -> Result<RebaseOutcome>;
    fn cherry_pick_abort(&self, repo: &Path) -> Result<()>;
    fn commit_amend_message(&self, repo: &Path, message: &str) -> Result<()>;
    fn merge_no_ff(&self, repo: &Path, branch: &str, message: &str) -> Result<RebaseOutcome>;
    fn push_force_with_lease(
        &self,
        repo: &Path,
        remote: &str,
        branch: &str,
        expected_sha: &str,
    ) -> Result<bool>;
    fn push(&self, repo: &Path, remote: &str, refspec: &str) -> Result<()>;
    fn rev_parse(&self, repo: &Path, rev: &str) -> Result<String>;
    fn rev_list(&self, repo: &Path, range: &str) -> Result<Vec<String>>;
    fn commit_message(&self, repo: &Path, rev: &str) -> Result<String>;
    fn add_remote(&self, repo: &Path, name: &str, url: &str) -> Result<()>;
    /// Clone `url` into `into` with a working tree: fusion and the batch
    /// job both check out branches in this clone, which a `--bare` clone
    /// cannot do.
    fn clone_repo(&self, url: &str, into: &Path) -> Result<()>;
}

/// Shells out to the system `git` binary with a per-invocation wall-clock
/// timeout (§5: "each git operation has a wall-clock timeout, default 120s").
pub struct ProcessGitRunner {
    timeout: Duration,
}

impl ProcessGitRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn run(&self, repo: &Path, args: &[&str]) -> Result<(bool, String, String)> {
        let mut child = Command::new("git")
            .current_dir(repo)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::git(anyhow::anyhow!(e).context(format!("spawning git {args:?}"))))?;

        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();

        let status = match child
            .wait_timeout(self.timeout)
            .map_err(|e| Error::git(anyhow::anyhow!(e)))?
        {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::git(anyhow::anyhow!(
                    "git {args:?} timed out after {:?}",
                    self.timeout
                )));
            }
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut h) = stdout_handle.take() {
            use std::io::Read;
            let _ = h.read_to_string(&mut stdout);
        }
        if let Some(mut h) = stderr_handle.take() {
            use std::io::Read;
            let _ = h.read_to_string(&mut stderr);
        }

        Ok((status.success(), stdout, stderr))
    }

    fn run_ok(&self, repo: &Path, args: &[&str]) -> Result<()> {
        let (success, _stdout, stderr) = self.run(repo, args)?;
        if success {
            Ok(())
        } else {
            Err(Error::git(anyhow::anyhow!(
                "git {args:?} failed: {}",
                stderr.trim()
            )))
        }
    }
}

impl GitRunner for ProcessGitRunner {
    fn fetch(&self, repo: &Path, remote: &str, refspec: &str) -> Result<()> {
        self.run_ok(repo, &["fetch", remote, refspec])
    }

    fn checkout(&self, repo: &Path, branch: &str) -> Result<()> {
        self.run_ok(repo, &["checkout", branch])
    }

    fn checkout_reset(&self, repo: &Path, branch: &str, start_point: &str) -> Result<()> {
        self.run_ok(repo, &["checkout", "-B", branch, start_point])
    }

    fn reset_hard(&self, repo: &Path, target: &str) -> Result<()> {
        self.run_ok(repo, &["reset", "--hard", target])
    }

    fn rebase_onto(&self, repo: &Path, upstream: &str, branch: &str) -> Result<RebaseOutcome> {
        let (success, _stdout, stderr) = self.run(repo, &["rebase", upstream, branch])?;
        if success {
            Ok(RebaseOutcome::Success)
        } else if stderr.to_lowercase().contains("conflict") || !success {
            let _ = self.rebase_abort(repo);
            Ok(RebaseOutcome::Conflict)
        } else {
            Err(Error::git(anyhow::anyhow!("git rebase failed: {stderr}")))
        }
    }

    fn rebase_abort(&self, repo: &Path) -> Result<()> {
        let _ = self.run(repo, &["rebase", "--abort"]);
        Ok(())
    }

    fn cherry_pick(&self, repo: &Path, commit: &str) -> Result<RebaseOutcome> {
        let (success, _stdout, _stderr) = self.run(repo, &["cherry-pick", commit])?;
        if success {
            Ok(RebaseOutcome::Success)
        } else {
            let _ = self.cherry_pick_abort(repo);
            Ok(RebaseOutcome::Conflict)
        }
    }

    fn cherry_pick_abort(&self, repo: &Path) -> Result<()> {
        let _ = self.run(repo, &["cherry-pick", "--abort"]);
        Ok(())
    }

    fn commit_amend_message(&self, repo: &Path, message: &str) -> Result<()> {
        self.run_ok(repo, &["commit", "--amend", "-m", message])
    }

    fn merge_no_ff(&self, repo: &Path, branch: &str, message: &str) -> Result<RebaseOutcome> {
        let (success, _stdout, _stderr) =
            self.run(repo, &["merge", "--no-ff", "-m", message, branch])?;
        if success {
            Ok(RebaseOutcome::Success)
        } else {
            let _ = self.run(repo, &["merge", "--abort"]);
            Ok(RebaseOutcome::Conflict)
        }
    }

    fn push_force_with_lease(
        &self,
        repo: &Path,
        remote: &str,
        branch: &str,
        expected_sha: &str,
    ) -> Result<bool> {
        let lease = format!("--force-with-lease={branch}:{expected_sha}");
        let (success, _stdout, stderr) = self.run(
            repo,
            &["push", &lease, remote, &format!("{branch}:{branch}")],
        )?;
        if success {
            Ok(true)
        } else if stderr.contains("stale info") || stderr.contains("rejected") {
            Ok(false)
        } else {
            Err(Error::git(anyhow::anyhow!(
                "git push --force-with-lease failed: {}",
                stderr.trim()
            )))
        }
    }

    fn push(&self, repo: &Path, remote: &str, refspec: &str) -> Result<()> {
        self.run_ok(repo, &["push", remote, refspec])
    }

    fn rev_parse(&self, repo: &Path, rev: &str) -> Result<String> {
        let (success, stdout, stderr) = self.run(repo, &["rev-parse", rev])?;
        if success {
            Ok(stdout.trim().to_string())
        } else {
            Err(Error::git(anyhow::anyhow!(
                "git rev-parse {rev} failed: {}",
                stderr.trim()
            )))
        }
    }

    fn rev_list(&self, repo: &Path, range: &str) -> Result<Vec<String>> {
        let (success, stdout, stderr) = self.run(repo, &["rev-list", "--reverse", range])?;
        if success {
            Ok(stdout.lines().map(str::to_string).collect())
        } else {
            Err(Error::git(anyhow::anyhow!(
                "git rev-list {range} failed: {}",
                stderr.trim()
            )))
        }
    }

    fn commit_message(&self, repo: &Path, rev: &str) -> Result<String> {
        let (success, stdout, stderr) = self.run(repo, &["log", "-1", "--format=%B", rev])?;
        if success {
            Ok(stdout)
        } else {
            Err(Error::git(anyhow::anyhow!(
                "git log {rev} failed: {}",
                stderr.trim()
            )))
        }
    }

    fn add_remote(&self, repo: &Path, name: &str, url: &str) -> Result<()> {
        self.run_ok(repo, &["remote", "add", name, url])
    }

    fn clone_repo(&self, url: &str, into: &Path) -> Result<()> {
        let into_str = into.to_string_lossy().to_string();
        self.run_ok(Path::new("."), &["clone", url, &into_str])
    }
}
