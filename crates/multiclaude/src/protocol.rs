//! Socket wire format: one JSON document per line in each direction.
//!
//! The request/response envelopes and every argument and result payload are
//! defined here once and shared by the daemon and the client.

use std::fmt;
use std::io::{self, BufRead, Read, Write};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::state::{AgentType, ForkConfig, MergeQueueConfig, PrShepherdConfig, TaskStatus};

/// Longest accepted line, newline included.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
  pub command: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub args: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
  pub success: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl Response {
  /// Successful response carrying `data`; `()` produces no data field.
  #[must_use]
  pub fn ok(data: impl Serialize) -> Self {
    match serde_json::to_value(data) {
      Ok(Value::Null) => Self {
        success: true,
        data: None,
        error: None,
      },
      Ok(value) => Self {
        success: true,
        data: Some(value),
        error: None,
      },
      Err(err) => Self::err(format!("failed to encode response: {err}")),
    }
  }

  #[must_use]
  pub fn err(message: impl Into<String>) -> Self {
    Self {
      success: false,
      data: None,
      error: Some(message.into()),
    }
  }
}

#[derive(Debug, Error)]
pub enum FrameError {
  #[error("i/o error: {0}")]
  Io(#[from] io::Error),
  #[error("malformed JSON: {0}")]
  Malformed(#[source] serde_json::Error),
  #[error("line exceeds {MAX_LINE_BYTES} bytes")]
  TooLarge,
}

/// Read one newline-terminated JSON document. `Ok(None)` means clean end of stream.
///
/// # Errors
/// - [`FrameError::Io`] for read failures and timeouts
/// - [`FrameError::TooLarge`] when no newline arrives within [`MAX_LINE_BYTES`]
/// - [`FrameError::Malformed`] when the line is not the expected JSON
pub fn read_message<R: BufRead, T: DeserializeOwned>(r: &mut R) -> Result<Option<T>, FrameError> {
  let mut buf = Vec::new();
  let limit = u64::try_from(MAX_LINE_BYTES).unwrap_or(u64::MAX);
  let n = r.by_ref().take(limit).read_until(b'\n', &mut buf)?;
  if n == 0 {
    return Ok(None);
  }
  if buf.last() != Some(&b'\n') {
    if n >= MAX_LINE_BYTES {
      return Err(FrameError::TooLarge);
    }
    // EOF in the middle of a line
    if buf.iter().all(u8::is_ascii_whitespace) {
      return Ok(None);
    }
  }
  serde_json::from_slice(&buf)
    .map(Some)
    .map_err(FrameError::Malformed)
}

/// Write `msg` as one JSON line and flush.
///
/// # Errors
/// Returns [`FrameError::Io`] when the peer is gone or the write times out.
pub fn write_message<W: Write, T: Serialize>(w: &mut W, msg: &T) -> Result<(), FrameError> {
  let mut bytes = serde_json::to_vec(msg).map_err(FrameError::Malformed)?;
  bytes.push(b'\n');
  w.write_all(&bytes)?;
  w.flush()?;
  Ok(())
}

/// Commands understood by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
  Ping,
  Status,
  Stop,
  GetState,
  ListRepos,
  GetRepo,
  AddRepo,
  RemoveRepo,
  SetCurrentRepo,
  GetCurrentRepo,
  ClearCurrentRepo,
  GetRepoConfig,
  UpdateRepoConfig,
  ListAgents,
  SpawnWorker,
  SpawnAgent,
  RemoveAgent,
  CompleteAgent,
  RestartAgent,
  TriggerCleanup,
  TaskHistory,
  UpdateTaskStatus,
  SendMessage,
  ListMessages,
  AckMessage,
}

impl Command {
  pub const ALL: &'static [Command] = &[
    Command::Ping,
    Command::Status,
    Command::Stop,
    Command::GetState,
    Command::ListRepos,
    Command::GetRepo,
    Command::AddRepo,
    Command::RemoveRepo,
    Command::SetCurrentRepo,
    Command::GetCurrentRepo,
    Command::ClearCurrentRepo,
    Command::GetRepoConfig,
    Command::UpdateRepoConfig,
    Command::ListAgents,
    Command::SpawnWorker,
    Command::SpawnAgent,
    Command::RemoveAgent,
    Command::CompleteAgent,
    Command::RestartAgent,
    Command::TriggerCleanup,
    Command::TaskHistory,
    Command::UpdateTaskStatus,
    Command::SendMessage,
    Command::ListMessages,
    Command::AckMessage,
  ];

  #[must_use]
  pub fn as_str(self) -> &'static str {
    match self {
      Command::Ping => "ping",
      Command::Status => "status",
      Command::Stop => "stop",
      Command::GetState => "get_state",
      Command::ListRepos => "list_repos",
      Command::GetRepo => "get_repo",
      Command::AddRepo => "add_repo",
      Command::RemoveRepo => "remove_repo",
      Command::SetCurrentRepo => "set_current_repo",
      Command::GetCurrentRepo => "get_current_repo",
      Command::ClearCurrentRepo => "clear_current_repo",
      Command::GetRepoConfig => "get_repo_config",
      Command::UpdateRepoConfig => "update_repo_config",
      Command::ListAgents => "list_agents",
      Command::SpawnWorker => "spawn_worker",
      Command::SpawnAgent => "spawn_agent",
      Command::RemoveAgent => "remove_agent",
      Command::CompleteAgent => "complete_agent",
      Command::RestartAgent => "restart_agent",
      Command::TriggerCleanup => "trigger_cleanup",
      Command::TaskHistory => "task_history",
      Command::UpdateTaskStatus => "update_task_status",
      Command::SendMessage => "send_message",
      Command::ListMessages => "list_messages",
      Command::AckMessage => "ack_message",
    }
  }
}

impl fmt::Display for Command {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown command")]
pub struct UnknownCommand;

impl FromStr for Command {
  type Err = UnknownCommand;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Command::ALL
      .iter()
      .copied()
      .find(|c| c.as_str() == s)
      .ok_or(UnknownCommand)
  }
}

// Argument payloads

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameArgs {
  pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoArgs {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub repo: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddRepoArgs {
  pub name: String,
  pub github_url: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tmux_session: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub target_branch: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRepoConfigArgs {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub repo: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub merge_queue: Option<MergeQueueConfig>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pr_shepherd: Option<PrShepherdConfig>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub fork: Option<ForkConfig>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub target_branch: Option<String>,
}

/// Effective per-repository configuration, defaults applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
  pub merge_queue: MergeQueueConfig,
  pub pr_shepherd: PrShepherdConfig,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub fork: Option<ForkConfig>,
  pub target_branch: String,
  pub fork_mode: bool,
  pub monitor_agent_type: AgentType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnWorkerArgs {
  pub task: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub repo: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub branch: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub push_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnAgentArgs {
  #[serde(rename = "type")]
  pub agent_type: AgentType,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub repo: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub task: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentArgs {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub repo: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteAgentArgs {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub repo: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub summary: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub failure_reason: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pr_url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pr_number: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHistoryArgs {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub repo: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub limit: Option<usize>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<TaskStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTaskStatusArgs {
  pub name: String,
  pub status: TaskStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub repo: Option<String>,
  /// Defaults to `work/<name>`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub branch: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pr_url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pr_number: Option<u64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub summary: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageArgs {
  pub to: String,
  pub body: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub from: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub repo: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListMessagesArgs {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub agent: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub repo: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdArgs {
  pub id: String,
}

// Result payloads

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameResult {
  pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdResult {
  pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatus {
  pub running: bool,
  pub pid: u32,
  pub repos: usize,
  pub agents: usize,
  pub socket_path: String,
}
