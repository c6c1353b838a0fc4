//! Routes decoded requests to the store, lifecycle manager, ledger and mailbox.
//!
//! Every handler returns a [`Response`]; errors never escape as panics or
//! closed connections. State side effects all go through `StateStore::mutate`.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use chrono::Utc;
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::DomainError;
use crate::history::{self, Resolution};
use crate::lifecycle::{
  CompletionReport, LifecycleManager, ReconcileReport, SpawnRequest, agent_branch,
};
use crate::mailbox::{Mailbox, resolve_recipient};
use crate::protocol::{
  AddRepoArgs, AgentArgs, Command, CompleteAgentArgs, DaemonStatus, IdArgs, IdResult,
  ListMessagesArgs, NameArgs, NameResult, RepoArgs, RepoConfig, Request, Response,
  SendMessageArgs, SpawnAgentArgs, SpawnWorkerArgs, TaskHistoryArgs, UpdateRepoConfigArgs,
  UpdateTaskStatusArgs,
};
use crate::state::{Agent, AgentType, Repository, State};
use crate::store::StateStore;

/// Sender recorded for messages that do not name one.
const DEFAULT_SENDER: &str = "supervisor";

pub struct Dispatcher {
  lifecycle: Arc<LifecycleManager>,
  mailbox: Arc<Mailbox>,
  socket_path: PathBuf,
  shutdown: Arc<AtomicBool>,
}

fn parse_args<T: DeserializeOwned>(command: Command, args: Option<Value>) -> Result<T> {
  let value = match args {
    None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
    Some(v) => v,
  };
  serde_json::from_value(value).map_err(|err| anyhow!("invalid arguments for {command}: {err}"))
}

fn repo_config(repo: &Repository, default_branch: &str) -> RepoConfig {
  RepoConfig {
    merge_queue: repo.effective_merge_queue_config(),
    pr_shepherd: repo.effective_pr_shepherd_config(),
    fork: repo.fork_config.clone(),
    target_branch: repo.target_branch_or(default_branch).to_string(),
    fork_mode: repo.is_fork_mode(),
    monitor_agent_type: repo.monitor_agent_type(),
  }
}

/// Agents of the resolved repository, or of every repository keyed `<repo>/<name>`
/// when no repository is given and none is current.
fn list_agents(state: &State, repo: Option<&str>) -> Result<BTreeMap<String, Agent>, DomainError> {
  match state.resolve_repo_name(repo) {
    Ok(name) => Ok(state.repo(&name)?.agents.clone()),
    Err(DomainError::NoRepository) => Ok(
      state
        .repos
        .iter()
        .flat_map(|(r, repo)| {
          repo
            .agents
            .iter()
            .map(move |(n, a)| (format!("{r}/{n}"), a.clone()))
        })
        .collect(),
    ),
    Err(err) => Err(err),
  }
}

/// Every `(repo, agent)` pair that can still receive messages.
fn live_recipients(state: &State) -> HashSet<(String, String)> {
  state
    .repos
    .iter()
    .flat_map(|(r, repo)| repo.agents.keys().map(move |n| (r.clone(), n.clone())))
    .collect()
}

impl Dispatcher {
  pub fn new(
    lifecycle: Arc<LifecycleManager>,
    mailbox: Arc<Mailbox>,
    socket_path: impl Into<PathBuf>,
    shutdown: Arc<AtomicBool>,
  ) -> Self {
    Self {
      lifecycle,
      mailbox,
      socket_path: socket_path.into(),
      shutdown,
    }
  }

  fn store(&self) -> &StateStore {
    self.lifecycle.store()
  }

  /// One reconcile pass, then drop the inboxes of agents it cleaned up.
  ///
  /// # Errors
  /// Returns an error only when the store refuses mutations.
  pub fn reconcile(&self) -> Result<ReconcileReport> {
    let report = self.lifecycle.reconcile()?;
    if !report.cleaned.is_empty() {
      self.prune_mailbox();
    }
    Ok(report)
  }

  fn prune_mailbox(&self) {
    let live = self.store().read(live_recipients);
    self.mailbox.prune(&live);
  }

  /// Execute one request. Unknown commands yield exactly `"unknown command"`.
  pub fn handle(&self, req: Request) -> Response {
    let Ok(command) = req.command.parse::<Command>() else {
      debug!("Rejecting unknown command {:?}", req.command);
      return Response::err("unknown command");
    };
    match self.execute(command, req.args) {
      Ok(resp) => resp,
      Err(err) => {
        debug!("{command} failed: {err:#}");
        Response::err(format!("{err:#}"))
      }
    }
  }

  fn execute(&self, command: Command, args: Option<Value>) -> Result<Response> {
    let store = self.store();
    match command {
      Command::Ping => Ok(Response::ok(())),
      Command::Status => {
        let (repos, agents) = store.read(|s| (s.repos.len(), s.agent_count()));
        Ok(Response::ok(DaemonStatus {
          running: true,
          pid: std::process::id(),
          repos,
          agents,
          socket_path: self.socket_path.display().to_string(),
        }))
      }
      Command::Stop => {
        info!("Stop requested over the socket");
        self.shutdown.store(true, Ordering::SeqCst);
        Ok(Response::ok(()))
      }
      Command::GetState => Ok(Response::ok(store.get())),
      Command::ListRepos => {
        let names: Vec<String> = store.read(|s| s.repos.keys().cloned().collect());
        Ok(Response::ok(names))
      }
      Command::GetRepo => {
        let a: NameArgs = parse_args(command, args)?;
        let repo = store.read(|s| s.repo(&a.name).cloned())?;
        Ok(Response::ok(repo))
      }
      Command::AddRepo => {
        let a: AddRepoArgs = parse_args(command, args)?;
        if a.github_url.trim().is_empty() {
          return Err(DomainError::InvalidArgument("github_url must not be empty".into()).into());
        }
        let tmux_session = a
          .tmux_session
          .filter(|s| !s.trim().is_empty())
          .unwrap_or_else(|| format!("mc-{}", a.name));
        let mut repo = Repository::new(a.github_url, tmux_session);
        repo.target_branch = a.target_branch.filter(|b| !b.trim().is_empty());
        store.mutate(|s| s.add_repo(&a.name, repo))?;
        info!("Tracking repository {}", a.name);
        Ok(Response::ok(()))
      }
      Command::RemoveRepo => {
        let a: NameArgs = parse_args(command, args)?;
        store.mutate(|s| s.remove_repo(&a.name))?;
        info!("Stopped tracking repository {}", a.name);
        Ok(Response::ok(()))
      }
      Command::SetCurrentRepo => {
        let a: NameArgs = parse_args(command, args)?;
        store.mutate(|s| s.set_current_repo(&a.name))?;
        Ok(Response::ok(()))
      }
      Command::GetCurrentRepo => Ok(Response::ok(store.read(|s| s.current_repo.clone()))),
      Command::ClearCurrentRepo => {
        store.mutate(|s| {
          s.current_repo = None;
          Ok(())
        })?;
        Ok(Response::ok(()))
      }
      Command::GetRepoConfig => {
        let a: RepoArgs = parse_args(command, args)?;
        let default_branch = self.lifecycle.default_branch();
        let cfg = store.read(|s| {
          let name = s.resolve_repo_name(a.repo.as_deref())?;
          Ok::<_, DomainError>(repo_config(s.repo(&name)?, default_branch))
        })?;
        Ok(Response::ok(cfg))
      }
      Command::UpdateRepoConfig => {
        let a: UpdateRepoConfigArgs = parse_args(command, args)?;
        let default_branch = self.lifecycle.default_branch();
        let cfg = store.mutate(|s| {
          let name = s.resolve_repo_name(a.repo.as_deref())?;
          let repo = s.repo_mut(&name)?;
          if let Some(mq) = a.merge_queue.clone() {
            repo.merge_queue_config = Some(mq);
          }
          if let Some(ps) = a.pr_shepherd.clone() {
            repo.pr_shepherd_config = Some(ps);
          }
          if let Some(fork) = a.fork.clone() {
            repo.fork_config = Some(fork);
          }
          if let Some(branch) = a.target_branch.as_deref() {
            repo.target_branch = Some(branch.trim())
              .filter(|b| !b.is_empty())
              .map(str::to_string);
          }
          Ok(repo_config(repo, default_branch))
        })?;
        Ok(Response::ok(cfg))
      }
      Command::ListAgents => {
        let a: RepoArgs = parse_args(command, args)?;
        let agents = store.read(|s| list_agents(s, a.repo.as_deref()))?;
        Ok(Response::ok(agents))
      }
      Command::SpawnWorker => {
        let a: SpawnWorkerArgs = parse_args(command, args)?;
        let name = self.lifecycle.spawn(SpawnRequest {
          agent_type: Some(AgentType::Worker),
          repo: a.repo,
          name: None,
          task: Some(a.task),
          branch: a.branch,
          push_to: a.push_to,
        })?;
        Ok(Response::ok(NameResult { name }))
      }
      Command::SpawnAgent => {
        let a: SpawnAgentArgs = parse_args(command, args)?;
        let name = self.lifecycle.spawn(SpawnRequest {
          agent_type: Some(a.agent_type),
          repo: a.repo,
          name: a.name,
          task: a.task,
          branch: None,
          push_to: None,
        })?;
        Ok(Response::ok(NameResult { name }))
      }
      Command::RemoveAgent => {
        let a: AgentArgs = parse_args(command, args)?;
        let repo = self.store().read(|s| s.resolve_repo_name(a.repo.as_deref()))?;
        self.lifecycle.remove(Some(&repo), &a.name)?;
        self.mailbox.forget_agent(&repo, &a.name);
        Ok(Response::ok(()))
      }
      Command::CompleteAgent => {
        let a: CompleteAgentArgs = parse_args(command, args)?;
        self.lifecycle.complete(
          a.repo.as_deref(),
          &a.name,
          CompletionReport {
            summary: a.summary,
            failure_reason: a.failure_reason,
            pr_url: a.pr_url,
            pr_number: a.pr_number,
          },
        )?;
        Ok(Response::ok(()))
      }
      Command::RestartAgent => {
        let a: AgentArgs = parse_args(command, args)?;
        self.lifecycle.restart(a.repo.as_deref(), &a.name)?;
        Ok(Response::ok(()))
      }
      Command::TriggerCleanup => Ok(Response::ok(self.reconcile()?)),
      Command::TaskHistory => {
        let a: TaskHistoryArgs = parse_args(command, args)?;
        let entries = store.read(|s| {
          let name = s.resolve_repo_name(a.repo.as_deref())?;
          Ok::<_, DomainError>(history::query(s.repo(&name)?, a.status, a.limit))
        })?;
        Ok(Response::ok(entries))
      }
      Command::UpdateTaskStatus => {
        let a: UpdateTaskStatusArgs = parse_args(command, args)?;
        let branch = a
          .branch
          .clone()
          .filter(|b| !b.trim().is_empty())
          .unwrap_or_else(|| worker_branch(&a.name));
        let entry = store.mutate(|s| {
          let name = s.resolve_repo_name(a.repo.as_deref())?;
          history::resolve(
            s.repo_mut(&name)?,
            &a.name,
            &branch,
            a.status,
            Resolution {
              pr_url: a.pr_url.clone(),
              pr_number: a.pr_number,
              summary: a.summary.clone(),
              failure_reason: None,
            },
            Utc::now(),
          )
        })?;
        Ok(Response::ok(entry))
      }
      Command::SendMessage => {
        let a: SendMessageArgs = parse_args(command, args)?;
        if a.body.trim().is_empty() {
          return Err(DomainError::InvalidArgument("message body must not be empty".into()).into());
        }
        let (repo, to) = store.read(|s| {
          let name = s.resolve_repo_name(a.repo.as_deref())?;
          let to = resolve_recipient(&name, s.repo(&name)?, &a.to)?;
          Ok::<_, DomainError>((name, to))
        })?;
        let from = a
          .from
          .as_deref()
          .filter(|f| !f.trim().is_empty())
          .unwrap_or(DEFAULT_SENDER);
        let msg = self.mailbox.send(&repo, &to, from, &a.body)?;
        Ok(Response::ok(IdResult { id: msg.id }))
      }
      Command::ListMessages => {
        let a: ListMessagesArgs = parse_args(command, args)?;
        let repo = store.read(|s| s.resolve_repo_name(a.repo.as_deref()))?;
        // Messages that raced with an agent's removal
        self.prune_mailbox();
        Ok(Response::ok(self.mailbox.list(&repo, a.agent.as_deref())))
      }
      Command::AckMessage => {
        let a: IdArgs = parse_args(command, args)?;
        self.mailbox.ack(&a.id)?;
        Ok(Response::ok(()))
      }
    }
  }
}

/// Branch recorded for a worker's history entries.
fn worker_branch(name: &str) -> String {
  agent_branch(AgentType::Worker, name).unwrap_or_else(|| format!("work/{name}"))
}
