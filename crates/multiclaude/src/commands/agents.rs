use anyhow::Result;

use crate::config::AppContext;
use crate::protocol::{AgentArgs, CompleteAgentArgs, SpawnAgentArgs, SpawnWorkerArgs};
use crate::state::{Agent, AgentType};
use crate::utils::log::t;
use crate::utils::term::print_table;
use crate::{log_info, log_success};

fn agent_row(name: &str, agent: &Agent) -> Vec<String> {
  let status = if agent.is_ready_for_cleanup() {
    t::warn("done")
  } else if agent.is_running() {
    t::ok("running")
  } else {
    t::err("stopped")
  };
  vec![
    t::name(name),
    agent.agent_type.to_string(),
    status,
    if agent.is_running() {
      agent.pid.to_string()
    } else {
      "-".to_string()
    },
    super::short_time(agent.created_at),
    agent.task.clone().unwrap_or_default(),
  ]
}

/// List agents of `repo`, the current repository, or every repository.
///
/// # Errors
/// Returns an error if the daemon does not answer.
pub fn list(ctx: &AppContext, repo: Option<&str>) -> Result<()> {
  let agents = super::client(ctx).list_agents(repo)?;
  if agents.is_empty() {
    log_info!("No agents");
    return Ok(());
  }
  let rows: Vec<Vec<String>> = agents
    .iter()
    .map(|(name, agent)| agent_row(name, agent))
    .collect();
  print_table(&["NAME", "TYPE", "STATUS", "PID", "CREATED", "TASK"], &rows);
  Ok(())
}

/// Spawn a worker for `task` and print its generated name.
///
/// # Errors
/// Returns an error if the daemon rejects the spawn.
pub fn work(
  ctx: &AppContext,
  task: &str,
  repo: Option<String>,
  branch: Option<String>,
  push_to: Option<String>,
) -> Result<()> {
  let name = super::client(ctx).spawn_worker(&SpawnWorkerArgs {
    task: task.to_string(),
    repo,
    branch,
    push_to,
  })?;
  log_success!("Spawned worker {name}");
  Ok(())
}

/// # Errors
/// Returns an error if the daemon rejects the spawn.
pub fn spawn(
  ctx: &AppContext,
  agent_type: AgentType,
  repo: Option<String>,
  name: Option<String>,
  task: Option<String>,
) -> Result<()> {
  let name = super::client(ctx).spawn_agent(&SpawnAgentArgs {
    agent_type,
    repo,
    name,
    task,
  })?;
  log_success!("Spawned {agent_type} {name}");
  Ok(())
}

/// # Errors
/// Returns an error if the agent is unknown.
pub fn rm(ctx: &AppContext, name: &str, repo: Option<String>) -> Result<()> {
  super::client(ctx).remove_agent(&AgentArgs {
    name: name.to_string(),
    repo,
  })?;
  log_success!("Removed agent {name}");
  Ok(())
}

/// Mark an agent finished; the next cleanup pass removes it.
///
/// # Errors
/// Returns an error if the agent is unknown.
pub fn complete(ctx: &AppContext, args: CompleteAgentArgs) -> Result<()> {
  let name = args.name.clone();
  let failed = args.failure_reason.is_some();
  super::client(ctx).complete_agent(&args)?;
  if failed {
    log_info!("Marked {} as failed", t::name(&name));
  } else {
    log_success!("Marked {name} as complete");
  }
  Ok(())
}

/// # Errors
/// Returns an error if the agent is unknown or cannot be relaunched.
pub fn restart(ctx: &AppContext, name: &str, repo: Option<String>) -> Result<()> {
  super::client(ctx).restart_agent(&AgentArgs {
    name: name.to_string(),
    repo,
  })?;
  log_success!("Restarted agent {name}");
  Ok(())
}
