use anyhow::Result;
use clap::Args;

use crate::config::AppContext;
use crate::protocol::{AddRepoArgs, RepoConfig, UpdateRepoConfigArgs};
use crate::state::{ForkConfig, TrackMode};
use crate::utils::log::t;
use crate::utils::term::print_table;
use crate::{log_info, log_success};

fn parse_track_mode(s: &str) -> Result<TrackMode, String> {
  serde_json::from_value(serde_json::Value::String(s.to_string()))
    .map_err(|_| format!("unknown track mode `{s}` (all|author|assigned)"))
}

/// Changes applied by `repo config`; without any flag the config is only shown.
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigFlags {
  /// Enable or disable the merge queue
  #[arg(long)]
  pub merge_queue: Option<bool>,
  /// Which PRs the merge queue tracks
  #[arg(long, value_parser = parse_track_mode)]
  pub merge_queue_track: Option<TrackMode>,
  /// Enable or disable the PR shepherd
  #[arg(long)]
  pub pr_shepherd: Option<bool>,
  /// Which PRs the PR shepherd tracks
  #[arg(long, value_parser = parse_track_mode)]
  pub pr_shepherd_track: Option<TrackMode>,
  /// Upstream repository URL; marks the repository as a fork
  #[arg(long)]
  pub upstream_url: Option<String>,
  /// Force fork mode on or off regardless of detection
  #[arg(long)]
  pub force_fork_mode: Option<bool>,
  /// Branch PRs target; an empty value restores the default
  #[arg(long)]
  pub target_branch: Option<String>,
}

impl ConfigFlags {
  fn is_empty(&self) -> bool {
    self.merge_queue.is_none()
      && self.merge_queue_track.is_none()
      && self.pr_shepherd.is_none()
      && self.pr_shepherd_track.is_none()
      && self.upstream_url.is_none()
      && self.force_fork_mode.is_none()
      && self.target_branch.is_none()
  }

  fn into_update(self, repo: Option<String>, current: &RepoConfig) -> UpdateRepoConfigArgs {
    let merge_queue = (self.merge_queue.is_some() || self.merge_queue_track.is_some()).then(|| {
      let mut mq = current.merge_queue.clone();
      mq.enabled = self.merge_queue.unwrap_or(mq.enabled);
      mq.track_mode = self.merge_queue_track.unwrap_or(mq.track_mode);
      mq
    });
    let pr_shepherd = (self.pr_shepherd.is_some() || self.pr_shepherd_track.is_some()).then(|| {
      let mut ps = current.pr_shepherd.clone();
      ps.enabled = self.pr_shepherd.unwrap_or(ps.enabled);
      ps.track_mode = self.pr_shepherd_track.unwrap_or(ps.track_mode);
      ps
    });
    let fork = (self.upstream_url.is_some() || self.force_fork_mode.is_some()).then(|| {
      let mut fork: ForkConfig = current.fork.clone().unwrap_or_default();
      if let Some(url) = self.upstream_url {
        fork.is_fork = true;
        fork.upstream_url = Some(url);
      }
      if self.force_fork_mode.is_some() {
        fork.force_fork_mode = self.force_fork_mode;
      }
      fork
    });
    UpdateRepoConfigArgs {
      repo,
      merge_queue,
      pr_shepherd,
      fork,
      target_branch: self.target_branch,
    }
  }
}

/// # Errors
/// Returns an error if the daemon rejects the repository.
pub fn add(
  ctx: &AppContext,
  name: &str,
  github_url: &str,
  tmux_session: Option<String>,
  target_branch: Option<String>,
) -> Result<()> {
  super::client(ctx).add_repo(&AddRepoArgs {
    name: name.to_string(),
    github_url: github_url.to_string(),
    tmux_session,
    target_branch,
  })?;
  log_success!("Tracking repository {name}");
  Ok(())
}

/// # Errors
/// Returns an error if the daemon does not answer.
pub fn list(ctx: &AppContext) -> Result<()> {
  let state = super::client(ctx).get_state()?;
  if state.repos.is_empty() {
    log_info!("No repositories tracked");
    return Ok(());
  }
  let rows: Vec<Vec<String>> = state
    .repos
    .iter()
    .map(|(name, repo)| {
      let current = state.current_repo.as_deref() == Some(name.as_str());
      vec![
        if current { "*".to_string() } else { String::new() },
        t::name(name),
        repo.github_url.clone(),
        repo.agents.len().to_string(),
      ]
    })
    .collect();
  print_table(&["", "NAME", "URL", "AGENTS"], &rows);
  Ok(())
}

/// # Errors
/// Returns an error if the repository is unknown.
pub fn use_repo(ctx: &AppContext, name: &str) -> Result<()> {
  super::client(ctx).set_current_repo(name)?;
  log_success!("Current repository is now {name}");
  Ok(())
}

/// # Errors
/// Returns an error if the repository is unknown.
pub fn rm(ctx: &AppContext, name: &str) -> Result<()> {
  super::client(ctx).remove_repo(name)?;
  log_success!("Stopped tracking repository {name}");
  Ok(())
}

/// Show the effective repository config, applying `flags` first when given.
///
/// # Errors
/// Returns an error if the repository cannot be resolved.
pub fn config(ctx: &AppContext, repo: Option<String>, flags: ConfigFlags) -> Result<()> {
  let client = super::client(ctx);
  let current = client.get_repo_config(repo.as_deref())?;
  let cfg = if flags.is_empty() {
    current
  } else {
    let updated = client.update_repo_config(&flags.into_update(repo, &current))?;
    log_success!("Updated repository config");
    updated
  };
  print_config(&cfg);
  Ok(())
}

fn track_label(mode: TrackMode) -> &'static str {
  match mode {
    TrackMode::All => "all",
    TrackMode::Author => "author",
    TrackMode::Assigned => "assigned",
  }
}

fn on_off(enabled: bool) -> String {
  if enabled { t::ok("on") } else { t::warn("off") }
}

fn print_config(cfg: &RepoConfig) {
  log_info!("Target branch:  {}", t::name(&cfg.target_branch));
  log_info!(
    "Merge queue:    {} (track {})",
    on_off(cfg.merge_queue.enabled),
    track_label(cfg.merge_queue.track_mode)
  );
  log_info!(
    "PR shepherd:    {} (track {})",
    on_off(cfg.pr_shepherd.enabled),
    track_label(cfg.pr_shepherd.track_mode)
  );
  log_info!("Fork mode:      {}", on_off(cfg.fork_mode));
  if let Some(url) = cfg.fork.as_ref().and_then(|f| f.upstream_url.as_deref()) {
    log_info!("Upstream:       {}", t::path(url));
  }
  log_info!("Monitor agent:  {}", t::name(cfg.monitor_agent_type));
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::state::{AgentType, MergeQueueConfig, PrShepherdConfig};

  fn current() -> RepoConfig {
    RepoConfig {
      merge_queue: MergeQueueConfig::default(),
      pr_shepherd: PrShepherdConfig::default(),
      fork: None,
      target_branch: "main".into(),
      fork_mode: false,
      monitor_agent_type: AgentType::MergeQueue,
    }
  }

  #[test]
  fn flags_only_touch_named_sections() {
    let flags = ConfigFlags {
      merge_queue_track: Some(TrackMode::Assigned),
      ..ConfigFlags::default()
    };
    let update = flags.into_update(Some("app".into()), &current());
    let mq = update.merge_queue.unwrap();
    assert!(mq.enabled);
    assert_eq!(mq.track_mode, TrackMode::Assigned);
    assert!(update.pr_shepherd.is_none());
    assert!(update.fork.is_none());
    assert!(update.target_branch.is_none());
  }

  #[test]
  fn upstream_url_marks_fork() {
    let flags = ConfigFlags {
      upstream_url: Some("https://github.com/up/app".into()),
      ..ConfigFlags::default()
    };
    let fork = flags.into_update(None, &current()).fork.unwrap();
    assert!(fork.is_fork);
    assert_eq!(fork.upstream_url.as_deref(), Some("https://github.com/up/app"));
    assert_eq!(fork.force_fork_mode, None);
  }

  #[test]
  fn track_mode_parser() {
    assert_eq!(parse_track_mode("author").unwrap(), TrackMode::Author);
    assert!(parse_track_mode("nobody").is_err());
  }
}
