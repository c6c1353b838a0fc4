use anyhow::Result;

use crate::config::AppContext;
use crate::log_info;
use crate::protocol::TaskHistoryArgs;
use crate::state::{TaskHistoryEntry, TaskStatus};
use crate::utils::log::t;
use crate::utils::term::print_table;

fn status_token(status: TaskStatus) -> String {
  match status {
    TaskStatus::Merged => t::ok(status),
    TaskStatus::Failed | TaskStatus::Closed => t::err(status),
    TaskStatus::Open | TaskStatus::NoPr | TaskStatus::Unknown => t::warn(status),
  }
}

fn history_row(entry: &TaskHistoryEntry) -> Vec<String> {
  let outcome = entry
    .pr_url
    .clone()
    .or_else(|| entry.failure_reason.clone())
    .or_else(|| entry.summary.clone())
    .unwrap_or_default();
  vec![
    t::name(&entry.name),
    status_token(entry.status),
    entry.completed_at.map(super::short_time).unwrap_or_default(),
    entry.task.clone(),
    outcome,
  ]
}

/// Print the task history of a repository, newest first.
///
/// # Errors
/// Returns an error if the repository cannot be resolved.
pub fn run(
  ctx: &AppContext,
  repo: Option<String>,
  status: Option<TaskStatus>,
  limit: Option<usize>,
) -> Result<()> {
  let entries = super::client(ctx).task_history(&TaskHistoryArgs { repo, limit, status })?;
  if entries.is_empty() {
    log_info!("No task history");
    return Ok(());
  }
  let rows: Vec<Vec<String>> = entries.iter().map(history_row).collect();
  print_table(&["NAME", "STATUS", "COMPLETED", "TASK", "OUTCOME"], &rows);
  Ok(())
}
