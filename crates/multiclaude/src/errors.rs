use thiserror::Error;

/// Failures of a single request against the state tree.
///
/// These never leave a partial mutation behind: the store discards the
/// working copy whenever a handler returns one of them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
  #[error("repository not found: {0}")]
  RepoNotFound(String),
  #[error("repository already exists: {0}")]
  RepoExists(String),
  #[error("agent not found: {name} (repository {repo})")]
  AgentNotFound { repo: String, name: String },
  #[error("agent already exists: {name} (repository {repo})")]
  AgentExists { repo: String, name: String },
  #[error("no repository specified and no current repository set")]
  NoRepository,
  #[error("invalid argument: {0}")]
  InvalidArgument(String),
  #[error("invalid state transition: {0}")]
  InvalidTransition(String),
  #[error("no task history entry for {name} on branch {branch}")]
  HistoryEntryNotFound { name: String, branch: String },
  #[error("message not found: {0}")]
  MessageNotFound(String),
}

/// Errors returned by [`crate::store::StateStore::mutate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
  #[error(transparent)]
  Domain(#[from] DomainError),
  /// The in-memory invariants were found broken; the store refuses all further mutations.
  #[error("internal error: state invariants violated ({0}); refusing further mutations")]
  Corrupted(String),
}

impl StoreError {
  #[must_use]
  pub fn is_corrupted(&self) -> bool {
    matches!(self, StoreError::Corrupted(_))
  }
}
