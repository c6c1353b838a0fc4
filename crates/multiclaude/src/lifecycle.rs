//! Agent lifecycle: spawning, completion, cleanup and the restart policy for
//! persistent agent types.
//!
//! Invariants:
//! - Launching or stopping a process never happens under the store lock.
//!   Spawns follow reserve (store lock) -> launch (no lock) -> record (store lock).
//! - An agent is "in flight" between reserve and record. Reconcile skips
//!   in-flight agents and name generation avoids their names.
//! - Lock order: store write lock before `pending`.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::MulticlaudePaths;
use crate::errors::DomainError;
use crate::history;
use crate::launcher::{AgentLauncher, AgentTarget, LaunchSpec};
use crate::names;
use crate::state::{
  Agent, AgentType, Repository, State, TaskHistoryEntry, TaskStatus, validate_identifier,
};
use crate::store::StateStore;

type AgentKey = (String, String);

#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
  pub agent_type: Option<AgentType>,
  pub repo: Option<String>,
  pub name: Option<String>,
  pub task: Option<String>,
  pub branch: Option<String>,
  pub push_to: Option<String>,
}

/// What an agent reports when it is done.
#[derive(Debug, Clone, Default)]
pub struct CompletionReport {
  pub summary: Option<String>,
  pub failure_reason: Option<String>,
  pub pr_url: Option<String>,
  pub pr_number: Option<u64>,
}

/// Outcome of one reconcile pass; entries are `<repo>/<name>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
  pub stopped: Vec<String>,
  pub cleaned: Vec<String>,
  pub restarted: Vec<String>,
}

impl ReconcileReport {
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.stopped.is_empty() && self.cleaned.is_empty() && self.restarted.is_empty()
  }
}

/// Branch a worktree-owning agent works on.
#[must_use]
pub fn agent_branch(agent_type: AgentType, name: &str) -> Option<String> {
  agent_type.uses_own_worktree().then(|| format!("work/{name}"))
}

fn qualified(repo: &str, name: &str) -> String {
  format!("{repo}/{name}")
}

pub struct LifecycleManager {
  store: Arc<StateStore>,
  launcher: Arc<dyn AgentLauncher>,
  paths: MulticlaudePaths,
  default_branch: String,
  pending: Mutex<HashSet<AgentKey>>,
}

impl LifecycleManager {
  pub fn new(
    store: Arc<StateStore>,
    launcher: Arc<dyn AgentLauncher>,
    paths: MulticlaudePaths,
    default_branch: impl Into<String>,
  ) -> Self {
    Self {
      store,
      launcher,
      paths,
      default_branch: default_branch.into(),
      pending: Mutex::new(HashSet::new()),
    }
  }

  #[must_use]
  pub fn store(&self) -> &Arc<StateStore> {
    &self.store
  }

  #[must_use]
  pub fn default_branch(&self) -> &str {
    &self.default_branch
  }

  fn is_pending(&self, repo: &str, name: &str) -> bool {
    self
      .pending
      .lock()
      .contains(&(repo.to_string(), name.to_string()))
  }

  fn launch_spec(
    &self,
    repo_name: &str,
    repo: &Repository,
    name: &str,
    agent: &Agent,
    base_branch: Option<&str>,
    push_to: Option<String>,
  ) -> LaunchSpec {
    LaunchSpec {
      repo: repo_name.to_string(),
      github_url: repo.github_url.clone(),
      name: name.to_string(),
      agent_type: agent.agent_type,
      session_id: agent.session_id.clone(),
      tmux_session: repo.tmux_session.clone(),
      tmux_window: agent.tmux_window.clone(),
      checkout_path: self.paths.repo_checkout(repo_name),
      worktree_path: agent.worktree_path.clone().into(),
      branch: agent_branch(agent.agent_type, name),
      base_branch: base_branch
        .filter(|b| !b.trim().is_empty())
        .unwrap_or_else(|| repo.target_branch_or(&self.default_branch))
        .to_string(),
      task: agent.task.clone(),
      push_to,
    }
  }

  fn target(&self, repo_name: &str, tmux_session: &str, name: &str, agent: &Agent) -> AgentTarget {
    AgentTarget {
      repo: repo_name.to_string(),
      name: name.to_string(),
      tmux_session: tmux_session.to_string(),
      tmux_window: agent.tmux_window.clone(),
      pid: agent.pid,
      checkout_path: self.paths.repo_checkout(repo_name),
      worktree_path: agent.worktree_path.clone().into(),
      owns_worktree: agent.agent_type.uses_own_worktree(),
    }
  }

  /// Pick the name for a new agent. Called under the store lock.
  fn choose_name(
    &self,
    repo_name: &str,
    repo: &Repository,
    agent_type: AgentType,
    requested: Option<&str>,
  ) -> Result<String, DomainError> {
    let pending = self.pending.lock();
    let taken = |n: &str| {
      repo.agents.contains_key(n) || pending.contains(&(repo_name.to_string(), n.to_string()))
    };
    let fixed = requested
      .filter(|n| !n.trim().is_empty())
      .or(agent_type.singleton_name());
    match fixed {
      Some(name) => {
        validate_identifier("agent name", name)?;
        if taken(name) {
          return Err(DomainError::AgentExists {
            repo: repo_name.to_string(),
            name: name.to_string(),
          });
        }
        Ok(name.to_string())
      }
      None => Ok(names::generate_unique(taken)),
    }
  }

  /// Create an agent and start its process.
  ///
  /// # Errors
  /// Returns domain errors for an unknown repository or a taken name, and the
  /// launch error when the process cannot be started. A failed launch leaves
  /// no trace in the state.
  pub fn spawn(&self, req: SpawnRequest) -> Result<String> {
    let agent_type = req.agent_type.unwrap_or(AgentType::Worker);
    if agent_type == AgentType::Worker && req.task.as_deref().is_none_or(|t| t.trim().is_empty()) {
      return Err(DomainError::InvalidArgument("a worker needs a task".to_string()).into());
    }

    let mut reserved: Option<AgentKey> = None;
    let phase1 = self.store.mutate(|state| {
      let repo_name = state.resolve_repo_name(req.repo.as_deref())?;
      let repo = state.repo_mut(&repo_name)?;
      let name = self.choose_name(&repo_name, repo, agent_type, req.name.as_deref())?;
      let worktree_path = if agent_type.uses_own_worktree() {
        self.paths.worktree(&repo_name, &name)
      } else {
        self.paths.repo_checkout(&repo_name)
      };
      let agent = Agent {
        agent_type,
        worktree_path: worktree_path.display().to_string(),
        tmux_window: name.clone(),
        session_id: Uuid::new_v4().to_string(),
        pid: 0,
        task: req.task.clone().filter(|t| !t.trim().is_empty()),
        summary: None,
        failure_reason: None,
        created_at: Utc::now(),
        last_nudge: None,
        ready_for_cleanup: None,
      };
      let spec = self.launch_spec(
        &repo_name,
        repo,
        &name,
        &agent,
        req.branch.as_deref(),
        req.push_to.clone(),
      );
      repo.agents.insert(name.clone(), agent);
      let key = (repo_name, name);
      self.pending.lock().insert(key.clone());
      reserved = Some(key);
      Ok(spec)
    });
    let spec = match phase1 {
      Ok(spec) => spec,
      Err(err) => {
        if let Some(key) = reserved {
          self.pending.lock().remove(&key);
        }
        return Err(err.into());
      }
    };

    info!("Spawning {} {}", spec.agent_type, qualified(&spec.repo, &spec.name));
    let launched = self.launcher.launch(&spec);
    let name = spec.name.clone();
    self.finish_launch(&spec, launched, true)?;
    Ok(name)
  }

  /// Record the outcome of a launch and release the in-flight mark.
  ///
  /// With `rollback`, a failed launch removes the reserved entry. Otherwise the
  /// agent stays with `pid = 0` for the next reconcile pass.
  fn finish_launch(&self, spec: &LaunchSpec, launched: Result<u32>, rollback: bool) -> Result<()> {
    let key = (spec.repo.clone(), spec.name.clone());
    let outcome = match launched {
      Ok(pid) => {
        let recorded = self.store.mutate(|state| {
          let Some(agent) = state
            .repos
            .get_mut(&spec.repo)
            .and_then(|r| r.agents.get_mut(&spec.name))
            .filter(|a| a.session_id == spec.session_id)
          else {
            return Ok(false);
          };
          agent.pid = pid;
          Ok(true)
        });
        match recorded {
          Ok(true) => Ok(()),
          Ok(false) => {
            warn!(
              "Agent {} was removed while launching; stopping pid {pid}",
              qualified(&spec.repo, &spec.name)
            );
            self.stop_fresh_process(spec, pid);
            Ok(())
          }
          Err(err) => {
            self.stop_fresh_process(spec, pid);
            Err(anyhow::Error::new(err))
          }
        }
      }
      Err(err) => {
        if rollback {
          let rolled_back = self.store.mutate(|state| {
            if let Some(repo) = state.repos.get_mut(&spec.repo)
              && repo
                .agents
                .get(&spec.name)
                .is_some_and(|a| a.session_id == spec.session_id)
            {
              repo.agents.remove(&spec.name);
            }
            Ok(())
          });
          if let Err(rollback_err) = rolled_back {
            error!(
              "Could not roll back reservation of {}; it stays with pid 0: {rollback_err}",
              qualified(&spec.repo, &spec.name)
            );
          }
        }
        error!(
          "Launching {} failed: {err:#}",
          qualified(&spec.repo, &spec.name)
        );
        Err(err.context(format!("failed to launch agent {}", spec.name)))
      }
    };
    self.pending.lock().remove(&key);
    outcome
  }

  fn stop_fresh_process(&self, spec: &LaunchSpec, pid: u32) {
    let target = AgentTarget {
      repo: spec.repo.clone(),
      name: spec.name.clone(),
      tmux_session: spec.tmux_session.clone(),
      tmux_window: spec.tmux_window.clone(),
      pid,
      checkout_path: spec.checkout_path.clone(),
      worktree_path: spec.worktree_path.clone(),
      owns_worktree: spec.branch.is_some(),
    };
    if let Err(err) = self.launcher.terminate(&target) {
      warn!("Failed to stop orphaned agent process {pid}: {err:#}");
    }
  }

  /// Remove an agent from the state and stop its process. No history entry is written.
  ///
  /// # Errors
  /// Returns a domain error when the repository or agent does not exist.
  pub fn remove(&self, repo: Option<&str>, name: &str) -> Result<Agent> {
    let (target, agent) = self.store.mutate(|state| {
      let repo_name = state.resolve_repo_name(repo)?;
      let repo = state.repo_mut(&repo_name)?;
      let agent = repo.agent(&repo_name, name)?.clone();
      repo.agents.remove(name);
      let target = self.target(&repo_name, &repo.tmux_session, name, &agent);
      Ok((target, agent))
    })?;
    info!("Removed agent {}", qualified(&target.repo, name));
    self.stop_and_release(&target);
    Ok(agent)
  }

  fn stop_and_release(&self, target: &AgentTarget) {
    if let Err(err) = self.launcher.terminate(target) {
      warn!(
        "Failed to stop {}: {err:#}",
        qualified(&target.repo, &target.name)
      );
    }
    if let Err(err) = self.launcher.release(target) {
      warn!(
        "Failed to release worktree of {}: {err:#}",
        qualified(&target.repo, &target.name)
      );
    }
  }

  /// Mark an agent as done. The next reconcile pass cleans it up.
  ///
  /// # Errors
  /// Returns a domain error when the repository or agent does not exist.
  pub fn complete(&self, repo: Option<&str>, name: &str, report: CompletionReport) -> Result<()> {
    self.store.mutate(|state| {
      let repo_name = state.resolve_repo_name(repo)?;
      let repo = state.repo_mut(&repo_name)?;
      let agent = repo.agent_mut(&repo_name, name)?;
      agent.ready_for_cleanup = Some(true);
      if report.summary.is_some() {
        agent.summary = report.summary.clone();
      }
      if report.failure_reason.is_some() {
        agent.failure_reason = report.failure_reason.clone();
      }
      let agent = agent.clone();
      if report.pr_url.is_some()
        && let Some(branch) = agent_branch(agent.agent_type, name)
      {
        history::append_if_absent(
          repo,
          TaskHistoryEntry {
            name: name.to_string(),
            task: agent.task.clone().unwrap_or_default(),
            branch,
            pr_url: report.pr_url.clone(),
            pr_number: report.pr_number,
            status: TaskStatus::Open,
            summary: agent.summary.clone(),
            failure_reason: None,
            created_at: agent.created_at,
            completed_at: None,
          },
        );
      }
      Ok(())
    })?;
    info!("Agent {name} reported completion");
    Ok(())
  }

  /// Re-launch an agent with the same identity and a fresh session.
  ///
  /// # Errors
  /// Returns a domain error when the agent does not exist or is already being
  /// launched, and the launch error if the process cannot be started.
  pub fn restart(&self, repo: Option<&str>, name: &str) -> Result<()> {
    let mut reserved: Option<AgentKey> = None;
    let prepared = self.store.mutate(|state| {
      let repo_name = state.resolve_repo_name(repo)?;
      if self.is_pending(&repo_name, name) {
        return Err(DomainError::InvalidTransition(format!(
          "agent {name} is already starting"
        )));
      }
      let repo = state.repo_mut(&repo_name)?;
      let agent = repo.agent_mut(&repo_name, name)?;
      let old = agent.clone();
      agent.session_id = Uuid::new_v4().to_string();
      agent.pid = 0;
      agent.ready_for_cleanup = None;
      let agent = agent.clone();
      let previous = self.target(&repo_name, &repo.tmux_session, name, &old);
      let spec = self.launch_spec(&repo_name, repo, name, &agent, None, None);
      let key = (repo_name, name.to_string());
      self.pending.lock().insert(key.clone());
      reserved = Some(key);
      Ok((previous, spec))
    });
    let (previous, spec) = match prepared {
      Ok(v) => v,
      Err(err) => {
        if let Some(key) = reserved {
          self.pending.lock().remove(&key);
        }
        return Err(err.into());
      }
    };
    if previous.pid != 0
      && let Err(err) = self.launcher.terminate(&previous)
    {
      warn!("Failed to stop {name} before restart: {err:#}");
    }
    info!("Restarting {}", qualified(&spec.repo, name));
    let launched = self.launcher.launch(&spec);
    self.finish_launch(&spec, launched, false)
  }

  /// One pass of the reconciler. Also run on demand by `trigger_cleanup`.
  ///
  /// # Errors
  /// Returns an error only when the store refuses mutations.
  pub fn reconcile(&self) -> Result<ReconcileReport> {
    let running: Vec<(String, String, u32)> = self.store.read(|state| {
      state
        .repos
        .iter()
        .flat_map(|(r, repo)| {
          repo
            .agents
            .iter()
            .filter(|(_, a)| a.is_running())
            .map(move |(n, a)| (r.clone(), n.clone(), a.pid))
        })
        .collect()
    });
    let dead: Vec<(String, String, u32)> = running
      .into_iter()
      .filter(|(_, _, pid)| !self.launcher.is_alive(*pid))
      .collect();

    let needs_work = !dead.is_empty()
      || self.store.read(|state| {
        state.repos.iter().any(|(r, repo)| {
          repo.agents.iter().any(|(n, a)| {
            !self.is_pending(r, n)
              && (a.is_ready_for_cleanup() || (a.agent_type.is_persistent() && !a.is_running()))
          })
        })
      });
    if !needs_work {
      return Ok(ReconcileReport::default());
    }

    let mut reserved: Vec<AgentKey> = Vec::new();
    let planned = self.store.mutate(|state| {
      let mut report = ReconcileReport::default();
      for (repo_name, name, pid) in &dead {
        if let Some(agent) = state
          .repos
          .get_mut(repo_name)
          .and_then(|r| r.agents.get_mut(name))
          .filter(|a| a.pid == *pid)
        {
          agent.pid = 0;
          report.stopped.push(qualified(repo_name, name));
        }
      }
      let cleanups = self.collect_cleanups(state, &mut report);
      let respawns = self.collect_respawns(state, &mut report, &mut reserved);
      Ok((report, cleanups, respawns))
    });
    let (report, cleanups, respawns) = match planned {
      Ok(v) => v,
      Err(err) => {
        let mut pending = self.pending.lock();
        for key in &reserved {
          pending.remove(key);
        }
        return Err(err).context("reconcile failed");
      }
    };

    for name in &report.stopped {
      info!("Agent {name} is no longer running");
    }
    for target in &cleanups {
      info!("Cleaned up {}", qualified(&target.repo, &target.name));
      self.stop_and_release(target);
    }
    for spec in &respawns {
      warn!(
        "Respawning persistent agent {} with a new session; previous conversation context is lost",
        qualified(&spec.repo, &spec.name)
      );
      let launched = self.launcher.launch(spec);
      if let Err(err) = self.finish_launch(spec, launched, false) {
        warn!("Respawn will be retried on the next pass: {err:#}");
      }
    }
    if !report.is_empty() {
      debug!("Reconcile: {report:?}");
    }
    Ok(report)
  }

  /// Remove agents marked done, writing their history entries. Runs under the store lock.
  fn collect_cleanups(&self, state: &mut State, report: &mut ReconcileReport) -> Vec<AgentTarget> {
    let mut targets = Vec::new();
    for (repo_name, repo) in &mut state.repos {
      let done: Vec<String> = repo
        .agents
        .iter()
        .filter(|(n, a)| a.is_ready_for_cleanup() && !self.is_pending(repo_name, n))
        .map(|(n, _)| n.clone())
        .collect();
      for name in done {
        let Some(agent) = repo.agents.remove(&name) else {
          continue;
        };
        if agent.agent_type.is_ephemeral()
          && let Some(branch) = agent_branch(agent.agent_type, &name)
        {
          let status = if agent.failure_reason.is_some() {
            TaskStatus::Failed
          } else {
            TaskStatus::NoPr
          };
          history::append_if_absent(
            repo,
            TaskHistoryEntry {
              name: name.clone(),
              task: agent.task.clone().unwrap_or_default(),
              branch,
              pr_url: None,
              pr_number: None,
              status,
              summary: agent.summary.clone(),
              failure_reason: agent.failure_reason.clone(),
              created_at: agent.created_at,
              completed_at: Some(Utc::now()),
            },
          );
        }
        targets.push(self.target(repo_name, &repo.tmux_session, &name, &agent));
        report.cleaned.push(qualified(repo_name, &name));
      }
    }
    targets
  }

  /// Reserve stopped persistent agents for a respawn. Runs under the store lock.
  fn collect_respawns(
    &self,
    state: &mut State,
    report: &mut ReconcileReport,
    reserved: &mut Vec<AgentKey>,
  ) -> Vec<LaunchSpec> {
    let mut specs = Vec::new();
    for (repo_name, repo) in &mut state.repos {
      let stopped: Vec<String> = repo
        .agents
        .iter()
        .filter(|(n, a)| {
          a.agent_type.is_persistent()
            && !a.is_running()
            && !a.is_ready_for_cleanup()
            && !self.is_pending(repo_name, n)
        })
        .map(|(n, _)| n.clone())
        .collect();
      for name in stopped {
        let Some(agent) = repo.agents.get_mut(&name) else {
          continue;
        };
        agent.session_id = Uuid::new_v4().to_string();
        let agent = agent.clone();
        specs.push(self.launch_spec(repo_name, repo, &name, &agent, None, None));
        let key = (repo_name.clone(), name.clone());
        self.pending.lock().insert(key.clone());
        reserved.push(key);
        report.restarted.push(qualified(repo_name, &name));
      }
    }
    specs
  }
}
