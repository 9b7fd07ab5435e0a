use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use mergetrain::cli::{Cli, Command};
use mergetrain::config::MergetrainConfig;
use mergetrain::driver::{BatchJobConfigTemplate, Driver, DriverConfig, SingleJobConfigTemplate};
use mergetrain::repo::RepoManager;
use mergetrain::rest::GitHostClient;
use mergetrain::rest::client::HttpGitHostClient;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "mergetrain=info",
        1 => "mergetrain=debug",
        _ => "mergetrain=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cwd = std::env::current_dir()?;
    let (config, config_path) = MergetrainConfig::load(&cwd)?;

    match config_path {
        Some(ref p) => info!("loaded config from {}", p.display()),
        None => info!("no .mergetrain/config.toml found"),
    }

    if let Command::Config { json } = cli.command {
        print_config(&config, config_path.as_deref(), json);
        return Ok(());
    }

    let client = HttpGitHostClient::new(
        config.service.api_url.clone(),
        config.service.auth_token.clone(),
        config.service.admin,
    );
    let bot_user_id = client
        .get_user_by_username(&config.service.bot_username)
        .with_context(|| format!("resolving bot user '{}'", config.service.bot_username))?
        .id;

    let repos = RepoManager::new(
        config.repo_transport(),
        config.service.host.clone(),
        config.git_timeout(),
    )?;

    let driver_config = DriverConfig {
        bot_user_id,
        merge_order: config.merge_order(),
        fusion_strategy: config.fusion_strategy(),
        allowed_interval: config.allowed_interval()?,
        blocking_labels: config.merge.blocking_labels.clone(),
        allowed_merge_strategies: config.merge.allow_merge_strategies.clone(),
        batch_enabled: config.batch.enabled,
        trailer_opts: config.trailer_options(),
        manual_pipeline_policy: config.manual_pipeline_policy(),
        single: SingleJobConfigTemplate {
            should_remove_source_branch: config.merge.should_remove_source_branch,
            squash: config.merge.squash,
            approvals_required_for_merge: config.merge.approvals_required_for_merge,
            reapprove_enabled: config.merge.reapprove,
            require_discussions_resolved: config.merge.require_discussions_resolved,
            max_retries_per_edge: config.timeouts.max_retries_per_edge,
            ci_poll_interval: config.ci_poll_interval(),
            ci_deadline: config.ci_timeout(),
        },
        batch: BatchJobConfigTemplate {
            should_remove_source_branch: config.merge.should_remove_source_branch,
            squash: config.merge.squash,
            ci_poll_interval: config.ci_poll_interval(),
            ci_deadline: config.ci_timeout(),
        },
        project_regexp: compile(config.filters.project_regexp.as_deref(), "filters.project_regexp")?,
        branch_regexp: compile(config.filters.branch_regexp.as_deref(), "filters.branch_regexp")?,
        source_branch_regexp: compile(
            config.filters.source_branch_regexp.as_deref(),
            "filters.source_branch_regexp",
        )?,
        inter_project_delay: std::time::Duration::from_secs(1),
        idle_delay: std::time::Duration::from_secs(30),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(true);
    })
    .context("installing SIGINT handler")?;

    let mut driver = Driver::new(&client, &repos, &driver_config);

    match cli.command {
        Command::Run => driver.run(shutdown_rx).await?,
        Command::Once => {
            driver.run_once(shutdown_rx).await?;
        }
        Command::Config { .. } => unreachable!("handled above"),
    }

    Ok(())
}

fn compile(pattern: Option<&str>, field: &str) -> Result<Option<regex::Regex>> {
    pattern
        .map(regex::Regex::new)
        .transpose()
        .with_context(|| format!("compiling {field}"))
}

fn print_config(config: &MergetrainConfig, path: Option<&std::path::Path>, json: bool) {
    if json {
        let summary = serde_json::json!({
            "host": config.service.host,
            "bot_username": config.service.bot_username,
            "fusion": config.merge.fusion,
            "batch": config.batch.enabled,
            "reapprove": config.merge.reapprove,
            "ci_timeout_secs": config.timeouts.ci_timeout_secs,
            "source": path.map(|p| p.display().to_string()),
        });
        println!("{}", serde_json::to_string_pretty(&summary).unwrap());
        return;
    }

    println!("mergetrain configuration:");
    println!("  host:        {}", config.service.host);
    println!("  bot user:    {}", config.service.bot_username);
    println!("  fusion:      {}", config.merge.fusion);
    println!("  batch:       {}", config.batch.enabled);
    println!("  reapprove:   {}", config.merge.reapprove);
    println!("  ci_timeout:  {}s", config.timeouts.ci_timeout_secs);
    match path {
        Some(p) => println!("  source:      {}", p.display()),
        None => println!("  source:      (defaults — no .mergetrain/config.toml found)"),
    }
}
