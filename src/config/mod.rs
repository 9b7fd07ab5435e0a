//! Configuration surface (§6.3): a TOML file found by searching upward from
//! the current directory, mirroring the teacher's
//! `ProjectConfig::load`/`find_config_file`. Every field has a default
//! except the credential the chosen transport needs, which is fatal at load
//! time if missing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::ci::ManualPipelinePolicy;
use crate::fusion::FusionStrategy;
use crate::interval::IntervalUnion;
use crate::rest::MergeOrder;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".mergetrain";

#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    /// Bare host, e.g. `gitlab.example.com` (used for SSH/HTTPS clone URLs).
    pub host: String,
    /// Base REST URL, e.g. `https://gitlab.example.com/api/v4`.
    pub api_url: String,
    /// Bot's private token. Required; validated at load time.
    #[serde(default)]
    pub auth_token: String,
    /// Whether `auth_token` belongs to an admin (gates reapprove and
    /// impersonated approval, §6.1/C2).
    #[serde(default)]
    pub admin: bool,
    /// Use HTTPS (bearer-in-URL) clone transport instead of SSH.
    #[serde(default)]
    pub use_https: bool,
    #[serde(default)]
    pub ssh_key_file: Option<PathBuf>,
    /// No local clone at all (§4.7 API-only variant); disables batch mode.
    #[serde(default)]
    pub use_only_gitlab_api: bool,
    /// Username the bot logs in as; also resolved to a user id at startup.
    pub bot_username: String,
    /// Display name and address used for `Tested-by` trailers.
    #[serde(default)]
    pub bot_name: Option<String>,
    #[serde(default)]
    pub bot_email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MergeConfig {
    #[serde(default = "default_fusion")]
    pub fusion: String,
    #[serde(default = "default_true")]
    pub add_tested: bool,
    #[serde(default = "default_true")]
    pub add_part_of: bool,
    #[serde(default = "default_true")]
    pub add_reviewers: bool,
    #[serde(default)]
    pub reapprove: bool,
    #[serde(default)]
    pub approvals_required_for_merge: bool,
    /// §4.5 VALIDATE: refuse to merge while blocking discussion threads are
    /// unresolved. GitLab itself defaults `blocking_discussions_resolved` to
    /// `true` on projects that don't require resolution, so this is mostly a
    /// kill switch for projects that do.
    #[serde(default = "default_true")]
    pub require_discussions_resolved: bool,
    #[serde(default)]
    pub blocking_labels: Vec<String>,
    #[serde(default)]
    pub should_remove_source_branch: bool,
    #[serde(default)]
    pub squash: bool,
    #[serde(default = "default_merge_order")]
    pub merge_order: String,
    #[serde(default = "default_allow_merge_strategies")]
    pub allow_merge_strategies: Vec<String>,
    #[serde(default = "default_manual_pipeline_policy")]
    pub manual_pipeline_policy: String,
    /// Weekly allowed-merge-window expression (§6.7), e.g.
    /// `"Mon@9am - Fri@5pm"`. No restriction when absent.
    #[serde(default)]
    pub allowed_interval: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_ci_timeout_secs")]
    pub ci_timeout_secs: u64,
    #[serde(default = "default_git_timeout_secs")]
    pub git_timeout_secs: u64,
    #[serde(default = "default_ci_poll_interval_secs")]
    pub ci_poll_interval_secs: u64,
    #[serde(default = "default_max_retries_per_edge")]
    pub max_retries_per_edge: u32,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            ci_timeout_secs: default_ci_timeout_secs(),
            git_timeout_secs: default_git_timeout_secs(),
            ci_poll_interval_secs: default_ci_poll_interval_secs(),
            max_retries_per_edge: default_max_retries_per_edge(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FiltersConfig {
    #[serde(default)]
    pub project_regexp: Option<String>,
    #[serde(default)]
    pub branch_regexp: Option<String>,
    #[serde(default)]
    pub source_branch_regexp: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_fusion() -> String {
    "rebase".to_string()
}

fn default_merge_order() -> String {
    "created_at".to_string()
}

fn default_allow_merge_strategies() -> Vec<String> {
    vec!["ff".to_string(), "rebase_merge".to_string(), "merge".to_string()]
}

fn default_manual_pipeline_policy() -> String {
    "treat_as_failure".to_string()
}

fn default_ci_timeout_secs() -> u64 {
    15 * 60
}

fn default_git_timeout_secs() -> u64 {
    120
}

fn default_ci_poll_interval_secs() -> u64 {
    10
}

fn default_max_retries_per_edge() -> u32 {
    3
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            fusion: default_fusion(),
            add_tested: true,
            add_part_of: true,
            add_reviewers: true,
            reapprove: false,
            approvals_required_for_merge: false,
            require_discussions_resolved: true,
            blocking_labels: Vec::new(),
            should_remove_source_branch: false,
            squash: false,
            merge_order: default_merge_order(),
            allow_merge_strategies: default_allow_merge_strategies(),
            manual_pipeline_policy: default_manual_pipeline_policy(),
            allowed_interval: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MergetrainConfig {
    pub service: ServiceConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub filters: FiltersConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { enabled: false }
    }
}

impl MergetrainConfig {
    /// Search upward from `start` for `.mergetrain/config.toml` and load it.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        let Some(path) = Self::find_config_file(start) else {
            bail!(
                "no {}/{} found above {} (service.host/api_url/auth_token are required)",
                CONFIG_DIR,
                CONFIG_FILENAME,
                start.display()
            );
        };
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: MergetrainConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok((config, Some(path)))
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.service.auth_token.is_empty() {
            bail!("service.auth_token is required");
        }
        if !self.service.use_only_gitlab_api
            && !self.service.use_https
            && self.service.ssh_key_file.is_none()
        {
            bail!("service.ssh_key_file is required when service.use_https is false and service.use_only_gitlab_api is false");
        }
        if FusionStrategy::from_config(&self.merge.fusion).is_none() {
            bail!("merge.fusion must be one of merge, rebase, gitlab-rebase");
        }
        Ok(())
    }

    pub fn fusion_strategy(&self) -> FusionStrategy {
        FusionStrategy::from_config(&self.merge.fusion).unwrap_or_default()
    }

    pub fn merge_order(&self) -> MergeOrder {
        match self.merge.merge_order.as_str() {
            "assigned_at" => MergeOrder::AssignedAt,
            _ => MergeOrder::CreatedAt,
        }
    }

    pub fn manual_pipeline_policy(&self) -> ManualPipelinePolicy {
        match self.merge.manual_pipeline_policy.as_str() {
            "wait" => ManualPipelinePolicy::Wait,
            _ => ManualPipelinePolicy::TreatAsFailure,
        }
    }

    pub fn allowed_interval(&self) -> Result<IntervalUnion> {
        match &self.merge.allowed_interval {
            Some(expr) => IntervalUnion::from_human(expr),
            None => Ok(IntervalUnion::always()),
        }
    }

    pub fn ci_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.ci_timeout_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.git_timeout_secs)
    }

    pub fn ci_poll_interval(&self) -> Duration {
        Duration::from_secs(self.timeouts.ci_poll_interval_secs)
    }

    pub fn repo_transport(&self) -> crate::repo::Transport {
        if self.service.use_only_gitlab_api {
            crate::repo::Transport::ApiOnly
        } else if self.service.use_https {
            crate::repo::Transport::Https {
                auth_token: self.service.auth_token.clone(),
            }
        } else {
            crate::repo::Transport::Ssh {
                ssh_key_file: self
                    .service
                    .ssh_key_file
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("~/.ssh/id_ed25519")),
            }
        }
    }

    pub fn trailer_options(&self) -> crate::trailer::TrailerOptions {
        crate::trailer::TrailerOptions {
            add_tested: self.merge.add_tested,
            add_part_of: self.merge.add_part_of,
            add_reviewers: self.merge.add_reviewers,
            bot_name: self
                .service
                .bot_name
                .clone()
                .unwrap_or_else(|| self.service.bot_username.clone()),
            bot_email: self
                .service
                .bot_email
                .clone()
                .unwrap_or_else(|| format!("{}@{}", self.service.bot_username, self.service.host)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn minimal_toml() -> &'static str {
        r#"
[service]
host = "gitlab.example.com"
api_url = "https://gitlab.example.com/api/v4"
auth_token = "secret"
bot_username = "mergetrain-bot"
use_https = true
"#
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: MergetrainConfig = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.merge.fusion, "rebase");
        assert!(config.merge.add_tested);
        assert!(!config.batch.enabled);
        assert_eq!(config.timeouts.ci_timeout_secs, 15 * 60);
        assert_eq!(config.merge_order(), MergeOrder::CreatedAt);
        assert_eq!(config.fusion_strategy(), FusionStrategy::Rebase);
    }

    #[test]
    fn validate_rejects_missing_token() {
        let mut config: MergetrainConfig = toml::from_str(minimal_toml()).unwrap();
        config.service.auth_token = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bogus_fusion() {
        let mut config: MergetrainConfig = toml::from_str(minimal_toml()).unwrap();
        config.merge.fusion = "bogus".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_requires_ssh_key_or_https_or_api_only() {
        let toml = r#"
[service]
host = "gitlab.example.com"
api_url = "https://gitlab.example.com/api/v4"
auth_token = "secret"
bot_username = "mergetrain-bot"
"#;
        let config: MergetrainConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_walks_up_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(CONFIG_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(CONFIG_FILENAME), minimal_toml()).unwrap();

        let nested = tmp.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();

        let (config, path) = MergetrainConfig::load(&nested).unwrap();
        assert!(path.is_some());
        assert_eq!(config.service.host, "gitlab.example.com");
    }

    #[test]
    fn load_fails_when_no_config_found() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(MergetrainConfig::load(tmp.path()).is_err());
    }
}
