//! Per-repository ledger of finished work.
//!
//! Entries are append-only. The single in-place edit is resolving an `open`
//! entry to a terminal status, which happens inside one store mutation.

use chrono::{DateTime, Utc};

use crate::errors::DomainError;
use crate::state::{Repository, TaskHistoryEntry, TaskStatus};

/// Fields a caller may attach when an entry is resolved.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
  pub pr_url: Option<String>,
  pub pr_number: Option<u64>,
  pub summary: Option<String>,
  pub failure_reason: Option<String>,
}

pub fn append(repo: &mut Repository, entry: TaskHistoryEntry) {
  repo.task_history.get_or_insert_with(Vec::new).push(entry);
}

#[must_use]
pub fn find<'a>(repo: &'a Repository, name: &str, branch: &str) -> Option<&'a TaskHistoryEntry> {
  repo
    .task_history
    .as_deref()
    .unwrap_or_default()
    .iter()
    .rev()
    .find(|e| e.name == name && e.branch == branch)
}

/// Append `entry` unless the ledger already has one for its `(name, branch)`.
///
/// Returns whether the entry was added.
pub fn append_if_absent(repo: &mut Repository, entry: TaskHistoryEntry) -> bool {
  if find(repo, &entry.name, &entry.branch).is_some() {
    return false;
  }
  append(repo, entry);
  true
}

/// Move the newest `open` entry for `(name, branch)` to `status`.
///
/// # Errors
/// - [`DomainError::InvalidArgument`] if `status` is not terminal.
/// - [`DomainError::HistoryEntryNotFound`] if no entry matches.
/// - [`DomainError::InvalidTransition`] if the matching entry is already resolved.
pub fn resolve(
  repo: &mut Repository,
  name: &str,
  branch: &str,
  status: TaskStatus,
  resolution: Resolution,
  now: DateTime<Utc>,
) -> Result<TaskHistoryEntry, DomainError> {
  if !status.is_terminal() {
    return Err(DomainError::InvalidArgument(format!(
      "task status {status} is not terminal"
    )));
  }
  let entry = repo
    .task_history
    .as_mut()
    .and_then(|entries| {
      entries
        .iter_mut()
        .rev()
        .find(|e| e.name == name && e.branch == branch)
    })
    .ok_or_else(|| DomainError::HistoryEntryNotFound {
      name: name.to_string(),
      branch: branch.to_string(),
    })?;
  if entry.status != TaskStatus::Open {
    return Err(DomainError::InvalidTransition(format!(
      "task {name} on {branch} is already {}",
      entry.status
    )));
  }
  entry.status = status;
  entry.completed_at = Some(now);
  if resolution.pr_url.is_some() {
    entry.pr_url = resolution.pr_url;
  }
  if resolution.pr_number.is_some() {
    entry.pr_number = resolution.pr_number;
  }
  if resolution.summary.is_some() {
    entry.summary = resolution.summary;
  }
  if resolution.failure_reason.is_some() {
    entry.failure_reason = resolution.failure_reason;
  }
  Ok(entry.clone())
}

/// Entries newest first, optionally filtered by status and truncated to `limit`.
///
/// Entries with equal `created_at` keep their reverse insertion order.
#[must_use]
pub fn query(
  repo: &Repository,
  status: Option<TaskStatus>,
  limit: Option<usize>,
) -> Vec<TaskHistoryEntry> {
  let mut entries: Vec<TaskHistoryEntry> = repo
    .task_history
    .as_deref()
    .unwrap_or_default()
    .iter()
    .rev()
    .filter(|e| status.is_none_or(|s| e.status == s))
    .cloned()
    .collect();
  // Stable sort on the reversed list keeps later insertions first on ties
  entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
  if let Some(limit) = limit {
    entries.truncate(limit);
  }
  entries
}
