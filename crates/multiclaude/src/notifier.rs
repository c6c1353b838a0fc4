//! Debounced snapshot flushing.
//!
//! One background thread waits for change signals from the store, lets a burst
//! settle for the debounce window and then persists whatever the state is at
//! that moment. Bursts that never settle are still flushed once `max_delay`
//! has passed since the first signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, bounded, select};
use log::{debug, error};

use crate::store::StateStore;

/// Upper bound on how long a continuous burst can postpone a flush, as a multiple of the debounce.
const MAX_DELAY_FACTOR: u32 = 10;

pub struct PersistNotifier {
  stop_tx: Sender<()>,
  handle: Option<JoinHandle<()>>,
  flushes: Arc<AtomicU64>,
}

impl PersistNotifier {
  /// Start the flusher thread for `store`.
  ///
  /// # Errors
  /// Returns an error if the thread cannot be spawned.
  pub fn spawn(store: Arc<StateStore>, debounce: Duration) -> Result<Self> {
    let changes = store.subscribe();
    let (stop_tx, stop_rx) = bounded(1);
    let flushes = Arc::new(AtomicU64::new(0));
    let counter = flushes.clone();
    let max_delay = debounce.saturating_mul(MAX_DELAY_FACTOR);
    let handle = std::thread::Builder::new()
      .name("state-flusher".to_string())
      .spawn(move || flush_loop(&store, &changes, &stop_rx, debounce, max_delay, &counter))
      .context("failed to spawn state flusher thread")?;
    Ok(Self {
      stop_tx,
      handle: Some(handle),
      flushes,
    })
  }

  /// Number of snapshot writes performed so far.
  #[must_use]
  pub fn flushes(&self) -> u64 {
    self.flushes.load(Ordering::SeqCst)
  }

  /// Flush anything pending and stop the thread.
  pub fn shutdown(mut self) {
    self.stop();
  }

  fn stop(&mut self) {
    let _ = self.stop_tx.try_send(());
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

impl Drop for PersistNotifier {
  fn drop(&mut self) {
    self.stop();
  }
}

fn flush_loop(
  store: &StateStore,
  changes: &Receiver<()>,
  stop: &Receiver<()>,
  debounce: Duration,
  max_delay: Duration,
  flushes: &AtomicU64,
) {
  loop {
    select! {
      recv(changes) -> msg => {
        if msg.is_err() {
          return;
        }
      }
      recv(stop) -> _ => {
        // Pick up a change that raced with the stop request
        if changes.try_recv().is_ok() {
          flush(store, flushes);
        }
        return;
      }
    }

    let first = Instant::now();
    let mut stopping = false;
    loop {
      let remaining = max_delay.saturating_sub(first.elapsed());
      let wait = debounce.min(remaining);
      if wait.is_zero() {
        break;
      }
      select! {
        recv(changes) -> msg => {
          if msg.is_err() {
            break;
          }
        }
        recv(stop) -> _ => {
          stopping = true;
          break;
        }
        default(wait) => break,
      }
    }

    flush(store, flushes);
    if stopping {
      return;
    }
  }
}

fn flush(store: &StateStore, flushes: &AtomicU64) {
  match store.persist() {
    Ok(()) => {
      let n = flushes.fetch_add(1, Ordering::SeqCst) + 1;
      debug!("Flushed state snapshot ({n} total)");
    }
    Err(err) => error!("State snapshot flush failed: {err:#}"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::state::{Repository, State};

  fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
      if cond() {
        return true;
      }
      std::thread::sleep(Duration::from_millis(10));
    }
    cond()
  }

  fn read_file_state(path: &std::path::Path) -> Option<State> {
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
  }

  #[test]
  fn burst_of_mutations_is_coalesced() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StateStore::open(dir.path().join("state.json")).unwrap());
    let notifier = PersistNotifier::spawn(store.clone(), Duration::from_millis(100)).unwrap();

    for i in 0..50 {
      store
        .mutate(|state| state.add_repo(&format!("r{i}"), Repository::new("u", "s")))
        .unwrap();
    }

    let path = store.path().to_path_buf();
    assert!(wait_until(Duration::from_secs(5), || {
      read_file_state(&path).is_some_and(|s| s.repos.len() == 50)
    }));
    assert!(
      notifier.flushes() < 10,
      "expected coalesced flushes, got {}",
      notifier.flushes()
    );
    assert_eq!(read_file_state(&path).unwrap(), store.get());
    notifier.shutdown();
  }

  #[test]
  fn shutdown_flushes_pending_change() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StateStore::open(dir.path().join("state.json")).unwrap());
    let notifier = PersistNotifier::spawn(store.clone(), Duration::from_secs(30)).unwrap();
    store
      .mutate(|state| state.add_repo("late", Repository::new("u", "s")))
      .unwrap();
    notifier.shutdown();
    let on_disk = read_file_state(store.path()).unwrap();
    assert!(on_disk.repos.contains_key("late"));
  }

  #[test]
  fn idle_notifier_does_not_write() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StateStore::open(dir.path().join("state.json")).unwrap());
    let notifier = PersistNotifier::spawn(store.clone(), Duration::from_millis(10)).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(notifier.flushes(), 0);
    notifier.shutdown();
    assert!(!store.path().exists());
  }
}
