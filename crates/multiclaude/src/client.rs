//! Typed client for the daemon socket.
//!
//! Each call opens a short-lived connection, writes one request line and
//! reads one response line.

use std::collections::BTreeMap;
use std::io::{self, BufReader};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::lifecycle::ReconcileReport;
use crate::mailbox::Message;
use crate::protocol::{
  AddRepoArgs, AgentArgs, Command, CompleteAgentArgs, DaemonStatus, FrameError, IdArgs, IdResult,
  ListMessagesArgs, NameArgs, NameResult, RepoArgs, RepoConfig, Request, Response,
  SendMessageArgs, SpawnAgentArgs, SpawnWorkerArgs, TaskHistoryArgs, UpdateRepoConfigArgs,
  UpdateTaskStatusArgs, read_message, write_message,
};
use crate::state::{Agent, Repository, State, TaskHistoryEntry};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
  #[error("daemon not running: no socket at {0} (start it with `multiclaude daemon start`)")]
  SocketMissing(PathBuf),
  #[error("failed to connect to daemon at {path}: {source}")]
  Connect {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
  #[error("timed out waiting for the daemon")]
  Timeout,
  #[error("daemon connection failed: {0}")]
  Io(#[source] io::Error),
  #[error("invalid response from daemon: {0}")]
  InvalidResponse(String),
  #[error("{0}")]
  Remote(String),
}

impl ClientError {
  /// Whether the daemon could not be reached or did not answer sensibly.
  #[must_use]
  pub fn is_connectivity(&self) -> bool {
    !matches!(self, ClientError::Remote(_))
  }

  fn from_io(err: io::Error) -> Self {
    match err.kind() {
      io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ClientError::Timeout,
      _ => ClientError::Io(err),
    }
  }
}

impl From<FrameError> for ClientError {
  fn from(err: FrameError) -> Self {
    match err {
      FrameError::Io(e) => ClientError::from_io(e),
      other => ClientError::InvalidResponse(other.to_string()),
    }
  }
}

#[derive(Debug, Clone)]
pub struct DaemonClient {
  socket: PathBuf,
  timeout: Duration,
}

impl DaemonClient {
  #[must_use]
  pub fn new(socket: impl Into<PathBuf>) -> Self {
    Self {
      socket: socket.into(),
      timeout: DEFAULT_TIMEOUT,
    }
  }

  #[must_use]
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  #[must_use]
  pub fn socket(&self) -> &Path {
    &self.socket
  }

  fn connect(&self) -> Result<UnixStream, ClientError> {
    let stream = UnixStream::connect(&self.socket).map_err(|source| {
      if self.socket.exists() {
        ClientError::Connect {
          path: self.socket.clone(),
          source,
        }
      } else {
        ClientError::SocketMissing(self.socket.clone())
      }
    })?;
    stream
      .set_read_timeout(Some(self.timeout))
      .map_err(ClientError::Io)?;
    stream
      .set_write_timeout(Some(self.timeout))
      .map_err(ClientError::Io)?;
    Ok(stream)
  }

  /// Send a raw request and return the raw response, successful or not.
  ///
  /// # Errors
  /// Returns a connectivity error when the exchange itself fails.
  pub fn request(&self, req: &Request) -> Result<Response, ClientError> {
    let stream = self.connect()?;
    let mut reader = BufReader::new(stream.try_clone().map_err(ClientError::Io)?);
    let mut writer = stream;
    write_message(&mut writer, req)?;
    let _ = writer.shutdown(std::net::Shutdown::Write);
    read_message::<_, Response>(&mut reader)?.ok_or_else(|| {
      ClientError::InvalidResponse("connection closed before a response arrived".to_string())
    })
  }

  /// Send `command` with optional JSON arguments.
  ///
  /// # Errors
  /// Returns a connectivity error when the exchange itself fails.
  pub fn send(&self, command: Command, args: Option<Value>) -> Result<Response, ClientError> {
    self.request(&Request {
      command: command.as_str().to_string(),
      args,
    })
  }

  /// Send `command` and decode the `data` of a successful response.
  ///
  /// # Errors
  /// Returns [`ClientError::Remote`] when the daemon reports a failure.
  pub fn call<T: DeserializeOwned>(
    &self,
    command: Command,
    args: impl Serialize,
  ) -> Result<T, ClientError> {
    let args = match serde_json::to_value(args) {
      Ok(Value::Null) => None,
      Ok(v) => Some(v),
      Err(err) => return Err(ClientError::InvalidResponse(format!("unencodable arguments: {err}"))),
    };
    let resp = self.send(command, args)?;
    if !resp.success {
      return Err(ClientError::Remote(
        resp.error.unwrap_or_else(|| format!("{command} failed")),
      ));
    }
    serde_json::from_value(resp.data.unwrap_or(Value::Null))
      .map_err(|err| ClientError::InvalidResponse(format!("{command}: {err}")))
  }

  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn ping(&self) -> Result<(), ClientError> {
    self.call(Command::Ping, ())
  }

  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn status(&self) -> Result<DaemonStatus, ClientError> {
    self.call(Command::Status, ())
  }

  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn stop(&self) -> Result<(), ClientError> {
    self.call(Command::Stop, ())
  }

  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn get_state(&self) -> Result<State, ClientError> {
    self.call(Command::GetState, ())
  }

  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn list_repos(&self) -> Result<Vec<String>, ClientError> {
    self.call(Command::ListRepos, ())
  }

  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn get_repo(&self, name: &str) -> Result<Repository, ClientError> {
    self.call(Command::GetRepo, NameArgs { name: name.to_string() })
  }

  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn add_repo(&self, args: &AddRepoArgs) -> Result<(), ClientError> {
    self.call(Command::AddRepo, args)
  }

  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn remove_repo(&self, name: &str) -> Result<(), ClientError> {
    self.call(Command::RemoveRepo, NameArgs { name: name.to_string() })
  }

  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn set_current_repo(&self, name: &str) -> Result<(), ClientError> {
    self.call(Command::SetCurrentRepo, NameArgs { name: name.to_string() })
  }

  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn get_current_repo(&self) -> Result<Option<String>, ClientError> {
    self.call(Command::GetCurrentRepo, ())
  }

  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn clear_current_repo(&self) -> Result<(), ClientError> {
    self.call(Command::ClearCurrentRepo, ())
  }

  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn get_repo_config(&self, repo: Option<&str>) -> Result<RepoConfig, ClientError> {
    self.call(
      Command::GetRepoConfig,
      RepoArgs {
        repo: repo.map(str::to_string),
      },
    )
  }

  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn update_repo_config(&self, args: &UpdateRepoConfigArgs) -> Result<RepoConfig, ClientError> {
    self.call(Command::UpdateRepoConfig, args)
  }

  /// Agents of one repository, or of all repositories keyed `<repo>/<name>`
  /// when none is given and none is current.
  ///
  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn list_agents(&self, repo: Option<&str>) -> Result<BTreeMap<String, Agent>, ClientError> {
    self.call(
      Command::ListAgents,
      RepoArgs {
        repo: repo.map(str::to_string),
      },
    )
  }

  /// Returns the generated worker name.
  ///
  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn spawn_worker(&self, args: &SpawnWorkerArgs) -> Result<String, ClientError> {
    self
      .call::<NameResult>(Command::SpawnWorker, args)
      .map(|r| r.name)
  }

  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn spawn_agent(&self, args: &SpawnAgentArgs) -> Result<String, ClientError> {
    self
      .call::<NameResult>(Command::SpawnAgent, args)
      .map(|r| r.name)
  }

  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn remove_agent(&self, args: &AgentArgs) -> Result<(), ClientError> {
    self.call(Command::RemoveAgent, args)
  }

  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn complete_agent(&self, args: &CompleteAgentArgs) -> Result<(), ClientError> {
    self.call(Command::CompleteAgent, args)
  }

  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn restart_agent(&self, args: &AgentArgs) -> Result<(), ClientError> {
    self.call(Command::RestartAgent, args)
  }

  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn trigger_cleanup(&self) -> Result<ReconcileReport, ClientError> {
    self.call(Command::TriggerCleanup, ())
  }

  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn task_history(&self, args: &TaskHistoryArgs) -> Result<Vec<TaskHistoryEntry>, ClientError> {
    self.call(Command::TaskHistory, args)
  }

  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn update_task_status(
    &self,
    args: &UpdateTaskStatusArgs,
  ) -> Result<TaskHistoryEntry, ClientError> {
    self.call(Command::UpdateTaskStatus, args)
  }

  /// Returns the new message id.
  ///
  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn send_message(&self, args: &SendMessageArgs) -> Result<String, ClientError> {
    self
      .call::<IdResult>(Command::SendMessage, args)
      .map(|r| r.id)
  }

  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn list_messages(&self, args: &ListMessagesArgs) -> Result<Vec<Message>, ClientError> {
    self.call(Command::ListMessages, args)
  }

  /// # Errors
  /// See [`DaemonClient::call`].
  pub fn ack_message(&self, id: &str) -> Result<(), ClientError> {
    self.call(Command::AckMessage, IdArgs { id: id.to_string() })
  }
}
