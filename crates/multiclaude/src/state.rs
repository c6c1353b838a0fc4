//! The daemon's state tree: repositories, their agents, task history and
//! per-repository configuration.
//!
//! These types are the single definition of the snapshot file and of the
//! `get_state`/`get_repo`/`list_agents` payloads. The daemon and the client
//! both (de)serialize through them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

static IDENT_RE: OnceLock<Regex> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentType {
  Supervisor,
  Worker,
  MergeQueue,
  PrShepherd,
  Workspace,
  Review,
  GenericPersistent,
}

/// Agent types the daemon keeps alive, restarting them after an unexpected exit.
pub const PERSISTENT_AGENT_TYPES: &[AgentType] = &[
  AgentType::Supervisor,
  AgentType::MergeQueue,
  AgentType::PrShepherd,
  AgentType::Workspace,
  AgentType::GenericPersistent,
];

impl AgentType {
  pub const ALL: &'static [AgentType] = &[
    AgentType::Supervisor,
    AgentType::Worker,
    AgentType::MergeQueue,
    AgentType::PrShepherd,
    AgentType::Workspace,
    AgentType::Review,
    AgentType::GenericPersistent,
  ];

  #[must_use]
  pub fn as_str(self) -> &'static str {
    match self {
      AgentType::Supervisor => "supervisor",
      AgentType::Worker => "worker",
      AgentType::MergeQueue => "merge-queue",
      AgentType::PrShepherd => "pr-shepherd",
      AgentType::Workspace => "workspace",
      AgentType::Review => "review",
      AgentType::GenericPersistent => "generic-persistent",
    }
  }

  #[must_use]
  pub fn is_persistent(self) -> bool {
    PERSISTENT_AGENT_TYPES.contains(&self)
  }

  /// Workers and reviewers finish, get cleaned up and leave a history entry.
  #[must_use]
  pub fn is_ephemeral(self) -> bool {
    !self.is_persistent()
  }

  /// Agents that work in their own git worktree rather than the repository checkout.
  #[must_use]
  pub fn uses_own_worktree(self) -> bool {
    matches!(
      self,
      AgentType::Worker | AgentType::Review | AgentType::Workspace
    )
  }

  /// Fixed name for agent types that exist at most once per repository.
  #[must_use]
  pub fn singleton_name(self) -> Option<&'static str> {
    match self {
      AgentType::Supervisor
      | AgentType::MergeQueue
      | AgentType::PrShepherd
      | AgentType::Workspace => Some(self.as_str()),
      AgentType::Worker | AgentType::Review | AgentType::GenericPersistent => None,
    }
  }
}

impl fmt::Display for AgentType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for AgentType {
  type Err = DomainError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    AgentType::ALL
      .iter()
      .copied()
      .find(|t| t.as_str() == s)
      .ok_or_else(|| DomainError::InvalidArgument(format!("unknown agent type: {s}")))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrackMode {
  #[default]
  All,
  Author,
  Assigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
  Open,
  Merged,
  Closed,
  NoPr,
  Failed,
  Unknown,
}

impl TaskStatus {
  #[must_use]
  pub fn as_str(self) -> &'static str {
    match self {
      TaskStatus::Open => "open",
      TaskStatus::Merged => "merged",
      TaskStatus::Closed => "closed",
      TaskStatus::NoPr => "no-pr",
      TaskStatus::Failed => "failed",
      TaskStatus::Unknown => "unknown",
    }
  }

  #[must_use]
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      TaskStatus::Merged | TaskStatus::Closed | TaskStatus::NoPr | TaskStatus::Failed
    )
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TaskStatus {
  type Err = DomainError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    [
      TaskStatus::Open,
      TaskStatus::Merged,
      TaskStatus::Closed,
      TaskStatus::NoPr,
      TaskStatus::Failed,
      TaskStatus::Unknown,
    ]
    .into_iter()
    .find(|t| t.as_str() == s)
    .ok_or_else(|| DomainError::InvalidArgument(format!("unknown task status: {s}")))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeQueueConfig {
  pub enabled: bool,
  pub track_mode: TrackMode,
}

impl Default for MergeQueueConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      track_mode: TrackMode::All,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrShepherdConfig {
  pub enabled: bool,
  pub track_mode: TrackMode,
}

impl Default for PrShepherdConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      track_mode: TrackMode::Author,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ForkConfig {
  pub is_fork: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub upstream_url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub upstream_owner: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub upstream_repo: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub force_fork_mode: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHistoryEntry {
  pub name: String,
  pub task: String,
  pub branch: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pr_url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pr_number: Option<u64>,
  pub status: TaskStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub summary: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub failure_reason: Option<String>,
  pub created_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
  #[serde(rename = "type")]
  pub agent_type: AgentType,
  pub worktree_path: String,
  pub tmux_window: String,
  pub session_id: String,
  /// Process id of the agent, 0 while it is not running.
  pub pid: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub task: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub summary: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub failure_reason: Option<String>,
  pub created_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_nudge: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ready_for_cleanup: Option<bool>,
}

impl Agent {
  #[must_use]
  pub fn is_running(&self) -> bool {
    self.pid != 0
  }

  #[must_use]
  pub fn is_ready_for_cleanup(&self) -> bool {
    self.ready_for_cleanup.unwrap_or(false)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
  pub github_url: String,
  pub tmux_session: String,
  #[serde(default)]
  pub agents: BTreeMap<String, Agent>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub task_history: Option<Vec<TaskHistoryEntry>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub merge_queue_config: Option<MergeQueueConfig>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pr_shepherd_config: Option<PrShepherdConfig>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub fork_config: Option<ForkConfig>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub target_branch: Option<String>,
}

impl Repository {
  #[must_use]
  pub fn new(github_url: impl Into<String>, tmux_session: impl Into<String>) -> Self {
    Self {
      github_url: github_url.into(),
      tmux_session: tmux_session.into(),
      agents: BTreeMap::new(),
      task_history: None,
      merge_queue_config: None,
      pr_shepherd_config: None,
      fork_config: None,
      target_branch: None,
    }
  }

  pub fn agent(&self, repo: &str, name: &str) -> Result<&Agent, DomainError> {
    self.agents.get(name).ok_or_else(|| DomainError::AgentNotFound {
      repo: repo.to_string(),
      name: name.to_string(),
    })
  }

  pub fn agent_mut(&mut self, repo: &str, name: &str) -> Result<&mut Agent, DomainError> {
    self
      .agents
      .get_mut(name)
      .ok_or_else(|| DomainError::AgentNotFound {
        repo: repo.to_string(),
        name: name.to_string(),
      })
  }

  /// Target branch for pull requests, falling back to the configured default.
  #[must_use]
  pub fn target_branch_or<'a>(&'a self, default_branch: &'a str) -> &'a str {
    self
      .target_branch
      .as_deref()
      .filter(|b| !b.trim().is_empty())
      .unwrap_or(default_branch)
  }

  /// Fork mode applies to detected forks and to repositories forced into it.
  #[must_use]
  pub fn is_fork_mode(&self) -> bool {
    self
      .fork_config
      .as_ref()
      .is_some_and(|f| f.is_fork || f.force_fork_mode.unwrap_or(false))
  }

  /// Which PR-monitoring agent this repository runs.
  #[must_use]
  pub fn monitor_agent_type(&self) -> AgentType {
    if self.is_fork_mode() {
      AgentType::PrShepherd
    } else {
      AgentType::MergeQueue
    }
  }

  #[must_use]
  pub fn effective_merge_queue_config(&self) -> MergeQueueConfig {
    self.merge_queue_config.clone().unwrap_or_default()
  }

  #[must_use]
  pub fn effective_pr_shepherd_config(&self) -> PrShepherdConfig {
    self.pr_shepherd_config.clone().unwrap_or_default()
  }

  /// First agent of the given type, by name order.
  #[must_use]
  pub fn find_agent_by_type(&self, agent_type: AgentType) -> Option<(&String, &Agent)> {
    self
      .agents
      .iter()
      .find(|(_, agent)| agent.agent_type == agent_type)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct State {
  #[serde(default)]
  pub repos: BTreeMap<String, Repository>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub current_repo: Option<String>,
}

impl State {
  pub fn repo(&self, name: &str) -> Result<&Repository, DomainError> {
    self
      .repos
      .get(name)
      .ok_or_else(|| DomainError::RepoNotFound(name.to_string()))
  }

  pub fn repo_mut(&mut self, name: &str) -> Result<&mut Repository, DomainError> {
    self
      .repos
      .get_mut(name)
      .ok_or_else(|| DomainError::RepoNotFound(name.to_string()))
  }

  /// Resolve the repository a command targets: the explicit name, else the current repo.
  pub fn resolve_repo_name(&self, explicit: Option<&str>) -> Result<String, DomainError> {
    match explicit.filter(|s| !s.trim().is_empty()) {
      Some(name) => {
        self.repo(name)?;
        Ok(name.to_string())
      }
      None => {
        let current = self.current_repo.as_ref().ok_or(DomainError::NoRepository)?;
        self.repo(current)?;
        Ok(current.clone())
      }
    }
  }

  pub fn add_repo(&mut self, name: &str, repo: Repository) -> Result<(), DomainError> {
    validate_identifier("repository name", name)?;
    if self.repos.contains_key(name) {
      return Err(DomainError::RepoExists(name.to_string()));
    }
    self.repos.insert(name.to_string(), repo);
    Ok(())
  }

  pub fn remove_repo(&mut self, name: &str) -> Result<Repository, DomainError> {
    let repo = self.repo(name)?;
    if !repo.agents.is_empty() {
      return Err(DomainError::InvalidTransition(format!(
        "repository {name} still has {} agent(s); remove them first",
        repo.agents.len()
      )));
    }
    if self.current_repo.as_deref() == Some(name) {
      self.current_repo = None;
    }
    self
      .repos
      .remove(name)
      .ok_or_else(|| DomainError::RepoNotFound(name.to_string()))
  }

  pub fn set_current_repo(&mut self, name: &str) -> Result<(), DomainError> {
    self.repo(name)?;
    self.current_repo = Some(name.to_string());
    Ok(())
  }

  #[must_use]
  pub fn agent_count(&self) -> usize {
    self.repos.values().map(|r| r.agents.len()).sum()
  }

  /// Structural invariants that must hold after every committed mutation.
  pub fn check_invariants(&self) -> Result<(), String> {
    if let Some(current) = &self.current_repo
      && !self.repos.contains_key(current)
    {
      return Err(format!("current repository {current} does not exist"));
    }
    for (repo_name, repo) in &self.repos {
      if !is_valid_identifier(repo_name) {
        return Err(format!("invalid repository name {repo_name:?}"));
      }
      for (agent_name, agent) in &repo.agents {
        if !is_valid_identifier(agent_name) {
          return Err(format!("invalid agent name {agent_name:?} in {repo_name}"));
        }
        if agent.tmux_window.is_empty() || agent.session_id.is_empty() {
          return Err(format!(
            "agent {repo_name}/{agent_name} is missing its window or session id"
          ));
        }
      }
    }
    Ok(())
  }
}

fn ident_re() -> &'static Regex {
  IDENT_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("valid regex"))
}

#[must_use]
pub fn is_valid_identifier(value: &str) -> bool {
  ident_re().is_match(value)
}

pub fn validate_identifier(what: &str, value: &str) -> Result<(), DomainError> {
  if is_valid_identifier(value) {
    Ok(())
  } else {
    Err(DomainError::InvalidArgument(format!(
      "invalid {what} {value:?}: use letters, digits, '.', '_' or '-'"
    )))
  }
}
