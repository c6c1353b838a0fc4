use anyhow::Result;

use crate::config::AppContext;
use crate::log_success;
use crate::utils::log::t;
use crate::utils::term::print_table;

/// # Errors
/// Returns an error if the daemon does not answer.
pub fn ping(ctx: &AppContext) -> Result<()> {
  super::client(ctx).ping()?;
  log_success!("pong");
  Ok(())
}

/// Overview of tracked repositories and their agents.
///
/// # Errors
/// Returns an error if the daemon does not answer.
pub fn run(ctx: &AppContext) -> Result<()> {
  let state = super::client(ctx).get_state()?;
  if state.repos.is_empty() {
    crate::log_info!("No repositories tracked. Add one with `multiclaude repo add <name> <url>`");
    return Ok(());
  }
  let rows: Vec<Vec<String>> = state
    .repos
    .iter()
    .map(|(name, repo)| {
      let running = repo.agents.values().filter(|a| a.is_running()).count();
      let marker = if state.current_repo.as_deref() == Some(name.as_str()) {
        "*"
      } else {
        ""
      };
      vec![
        marker.to_string(),
        t::name(name),
        repo.agents.len().to_string(),
        if running == repo.agents.len() {
          t::ok(running)
        } else {
          t::warn(running)
        },
        repo.tmux_session.clone(),
      ]
    })
    .collect();
  print_table(&["", "REPO", "AGENTS", "RUNNING", "SESSION"], &rows);
  Ok(())
}
