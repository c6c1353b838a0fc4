//! Single owner of the daemon's [`State`] tree.
//!
//! Invariants:
//! - Mutations run against a working copy under the write lock and replace the
//!   live tree only when the closure succeeds and the invariants hold.
//! - Readers take the read lock and never observe a mutation mid-flight.
//! - Persistence serializes under the read lock and writes outside of it.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use log::{error, warn};
use parking_lot::{Mutex, RwLock};

use crate::errors::{DomainError, StoreError};
use crate::state::State;
use crate::utils::fs::write_atomic;

pub struct StateStore {
  state: RwLock<State>,
  path: PathBuf,
  /// Set once invariants were found broken; further mutations are refused.
  corrupted: Mutex<Option<String>>,
  persist_lock: Mutex<()>,
  subscribers: Mutex<Vec<Sender<()>>>,
}

impl StateStore {
  /// Load the snapshot at `path`, or start empty when it is missing or blank.
  ///
  /// # Errors
  /// Returns an error if the file exists but cannot be read or is not a valid state document.
  pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
    let path = path.into();
    let state = load_snapshot(&path)?;
    Ok(Self::with_state(path, state))
  }

  #[must_use]
  pub fn with_state(path: impl Into<PathBuf>, state: State) -> Self {
    Self {
      state: RwLock::new(state),
      path: path.into(),
      corrupted: Mutex::new(None),
      persist_lock: Mutex::new(()),
      subscribers: Mutex::new(Vec::new()),
    }
  }

  #[must_use]
  pub fn path(&self) -> &Path {
    &self.path
  }

  /// A consistent copy of the whole tree.
  #[must_use]
  pub fn get(&self) -> State {
    self.state.read().clone()
  }

  /// Borrow the tree under the read lock. Keep `f` short.
  pub fn read<T>(&self, f: impl FnOnce(&State) -> T) -> T {
    f(&self.state.read())
  }

  /// Apply `f` atomically. On error nothing changes.
  ///
  /// # Errors
  /// Returns the closure's domain error, or [`StoreError::Corrupted`] when the
  /// store refuses mutations because its invariants were violated.
  pub fn mutate<T>(
    &self,
    f: impl FnOnce(&mut State) -> Result<T, DomainError>,
  ) -> Result<T, StoreError> {
    let mut guard = self.state.write();
    if let Some(reason) = self.corrupted.lock().clone() {
      return Err(StoreError::Corrupted(reason));
    }
    let mut next = guard.clone();
    let out = f(&mut next)?;
    if let Err(reason) = next.check_invariants() {
      error!("Mutation broke state invariants, refusing further mutations: {reason}");
      *self.corrupted.lock() = Some(reason.clone());
      return Err(StoreError::Corrupted(reason));
    }
    *guard = next;
    drop(guard);
    self.notify_changed();
    Ok(out)
  }

  /// Receive a signal after every committed mutation.
  ///
  /// The channel holds at most one pending signal; bursts collapse into one.
  pub fn subscribe(&self) -> Receiver<()> {
    let (tx, rx) = bounded(1);
    self.subscribers.lock().push(tx);
    rx
  }

  fn notify_changed(&self) {
    self
      .subscribers
      .lock()
      .retain(|tx| !matches!(tx.try_send(()), Err(TrySendError::Disconnected(()))));
  }

  /// Write the current tree to the snapshot file.
  ///
  /// # Errors
  /// Returns an error if serialization or the atomic write fails. The in-memory
  /// state is never affected.
  pub fn persist(&self) -> Result<()> {
    let _serial = self.persist_lock.lock();
    let bytes = {
      let state = self.state.read();
      serde_json::to_vec_pretty(&*state).context("failed to serialize state")?
    };
    write_atomic(&self.path, &bytes)
      .with_context(|| format!("failed to persist state to {}", self.path.display()))
  }

  #[must_use]
  pub fn is_corrupted(&self) -> bool {
    self.corrupted.lock().is_some()
  }
}

fn load_snapshot(path: &Path) -> Result<State> {
  if !path.exists() {
    return Ok(State::default());
  }
  let data =
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
  if data.trim().is_empty() {
    return Ok(State::default());
  }
  let mut state: State =
    serde_json::from_str(&data).with_context(|| format!("invalid state in {}", path.display()))?;
  if let Some(current) = state.current_repo.clone()
    && !state.repos.contains_key(&current)
  {
    warn!("Clearing current repository {current}: it is not tracked anymore");
    state.current_repo = None;
  }
  if let Err(reason) = state.check_invariants() {
    anyhow::bail!("state in {} is inconsistent: {reason}", path.display());
  }
  Ok(state)
}
