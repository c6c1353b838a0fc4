//! Starting and stopping agent processes.
//!
//! The lifecycle manager only talks to [`AgentLauncher`]; [`TmuxLauncher`] is
//! the production implementation running each agent in a tmux window.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::config::MulticlaudeConfig;
use crate::state::AgentType;
use crate::utils::command::{expand_vars_in_argv, split_argv};
use crate::utils::git;
use crate::utils::tmux::Tmux;

/// Everything needed to bring one agent process up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
  pub repo: String,
  pub github_url: String,
  pub name: String,
  pub agent_type: AgentType,
  pub session_id: String,
  pub tmux_session: String,
  pub tmux_window: String,
  pub checkout_path: PathBuf,
  pub worktree_path: PathBuf,
  /// Branch the agent works on, when it has its own worktree.
  pub branch: Option<String>,
  pub base_branch: String,
  pub task: Option<String>,
  pub push_to: Option<String>,
}

impl LaunchSpec {
  /// Environment exported to the agent process.
  #[must_use]
  pub fn env(&self) -> BTreeMap<String, String> {
    let mut env = BTreeMap::from([
      ("MULTICLAUDE_AGENT_NAME".to_string(), self.name.clone()),
      (
        "MULTICLAUDE_AGENT_TYPE".to_string(),
        self.agent_type.as_str().to_string(),
      ),
      ("MULTICLAUDE_REPO".to_string(), self.repo.clone()),
      ("MULTICLAUDE_SESSION_ID".to_string(), self.session_id.clone()),
      ("MULTICLAUDE_TASK".to_string(), self.task.clone().unwrap_or_default()),
    ]);
    if let Some(branch) = &self.branch {
      env.insert("MULTICLAUDE_BRANCH".to_string(), branch.clone());
    }
    if let Some(push_to) = &self.push_to {
      env.insert("MULTICLAUDE_PUSH_TO".to_string(), push_to.clone());
    }
    env
  }
}

/// A running (or previously running) agent to stop or clean up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTarget {
  pub repo: String,
  pub name: String,
  pub tmux_session: String,
  pub tmux_window: String,
  pub pid: u32,
  pub checkout_path: PathBuf,
  pub worktree_path: PathBuf,
  pub owns_worktree: bool,
}

pub trait AgentLauncher: Send + Sync {
  /// Start the agent and return its pid. Never called with the store lock held.
  fn launch(&self, spec: &LaunchSpec) -> Result<u32>;

  fn is_alive(&self, pid: u32) -> bool;

  /// Stop the agent's process. Stopping something already gone succeeds.
  fn terminate(&self, target: &AgentTarget) -> Result<()>;

  /// Release resources owned by a removed agent, such as its worktree.
  fn release(&self, target: &AgentTarget) -> Result<()>;
}

/// Liveness check via signal 0.
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
  let Ok(raw) = i32::try_from(pid) else {
    return false;
  };
  if raw <= 0 {
    return false;
  }
  // EPERM means the process exists but belongs to someone else
  matches!(
    kill(Pid::from_raw(raw), None),
    Ok(()) | Err(nix::errno::Errno::EPERM)
  )
}

pub struct TmuxLauncher {
  tmux: Tmux,
  config: MulticlaudeConfig,
}

impl TmuxLauncher {
  #[must_use]
  pub fn new(config: MulticlaudeConfig) -> Self {
    Self {
      tmux: Tmux::new(config.tmux_socket_path()),
      config,
    }
  }

  fn prepare_workdir(&self, spec: &LaunchSpec) -> Result<PathBuf> {
    git::ensure_clone(&spec.github_url, &spec.checkout_path)
      .with_context(|| format!("failed to prepare checkout for {}", spec.repo))?;
    let Some(branch) = &spec.branch else {
      return Ok(spec.checkout_path.clone());
    };
    let repo = git::open_checkout(&spec.checkout_path)?;
    git::add_worktree(&repo, &spec.worktree_path, branch, &spec.base_branch).with_context(|| {
      format!(
        "failed to create worktree {} on {branch}",
        spec.worktree_path.display()
      )
    })?;
    Ok(spec.worktree_path.clone())
  }
}

impl AgentLauncher for TmuxLauncher {
  fn launch(&self, spec: &LaunchSpec) -> Result<u32> {
    let cwd = self.prepare_workdir(spec)?;
    let env = spec.env();
    let lookup: HashMap<String, String> = env.clone().into_iter().collect();
    let argv = expand_vars_in_argv(&self.config.agent_argv(spec.agent_type)?, &lookup);
    let (program, args) = split_argv(&argv)?;

    self.tmux.ensure_session(&spec.tmux_session, &cwd)?;
    let pid = self
      .tmux
      .new_window(&spec.tmux_session, &spec.tmux_window, &cwd, &env, program, args)?;
    info!(
      "Launched {} {}/{} in {}:{} (pid {pid})",
      spec.agent_type, spec.repo, spec.name, spec.tmux_session, spec.tmux_window
    );
    Ok(pid)
  }

  fn is_alive(&self, pid: u32) -> bool {
    pid_alive(pid)
  }

  fn terminate(&self, target: &AgentTarget) -> Result<()> {
    self
      .tmux
      .kill_window(&target.tmux_session, &target.tmux_window)?;
    if target.pid != 0
      && pid_alive(target.pid)
      && let Ok(raw) = i32::try_from(target.pid)
    {
      debug!("Sending SIGTERM to {} (pid {})", target.name, target.pid);
      if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        warn!("Failed to signal pid {}: {err}", target.pid);
      }
    }
    Ok(())
  }

  fn release(&self, target: &AgentTarget) -> Result<()> {
    if !target.owns_worktree || !target.worktree_path.exists() {
      return Ok(());
    }
    let repo = git::open_checkout(&target.checkout_path)?;
    if !git::remove_worktree(&repo, &target.worktree_path)? {
      warn!(
        "Worktree {} is still present after removal",
        target.worktree_path.display()
      );
    }
    Ok(())
  }
}
