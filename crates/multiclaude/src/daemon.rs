//! The daemon process: socket listener, per-connection workers, the periodic
//! reconciler and the snapshot flusher.
//!
//! Invariants:
//! - Frames are written without holding the store lock or any lifecycle lock.
//! - Shutdown stops accepting, stops the reconciler, flushes the snapshot and
//!   removes the socket and pid files, in that order.

use std::fs;
use std::io::BufReader;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use log::{debug, error, info, warn};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

use crate::config::{MulticlaudeConfig, MulticlaudePaths};
use crate::dispatch::Dispatcher;
use crate::launcher::AgentLauncher;
use crate::lifecycle::LifecycleManager;
use crate::mailbox::Mailbox;
use crate::notifier::PersistNotifier;
use crate::protocol::{FrameError, Request, Response, read_message, write_message};
use crate::store::StateStore;
use crate::utils::fs::{ensure_private_dir, write_atomic};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_: nix::libc::c_int) {
  TERMINATE.store(true, Ordering::SeqCst);
}

/// Turn SIGTERM and SIGINT into an orderly shutdown of a running daemon.
///
/// # Errors
/// Returns an error if the handlers cannot be installed.
pub fn install_termination_handlers() -> Result<()> {
  let action = SigAction::new(
    SigHandler::Handler(on_terminate),
    SaFlags::SA_RESTART,
    SigSet::empty(),
  );
  for sig in [Signal::SIGTERM, Signal::SIGINT] {
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    unsafe { sigaction(sig, &action) }.with_context(|| format!("failed to install {sig} handler"))?;
  }
  Ok(())
}

#[derive(Debug, Clone)]
pub struct DaemonOptions {
  pub debounce: Duration,
  pub reconcile_interval: Duration,
  pub io_timeout: Duration,
  pub default_branch: String,
}

impl DaemonOptions {
  #[must_use]
  pub fn from_config(cfg: &MulticlaudeConfig) -> Self {
    Self {
      debounce: cfg.debounce(),
      reconcile_interval: cfg.reconcile_interval(),
      io_timeout: cfg.io_timeout(),
      default_branch: cfg.default_branch().to_string(),
    }
  }
}

impl Default for DaemonOptions {
  fn default() -> Self {
    Self::from_config(&MulticlaudeConfig::default())
  }
}

/// Bind the socket, creating its directory with mode 0700 and removing a stale socket file.
///
/// # Errors
/// Returns an error if the socket cannot be bound.
pub fn ensure_socket_dir_and_bind(path: &Path) -> Result<UnixListener> {
  if let Some(dir) = path.parent() {
    let _ = fs::create_dir_all(dir);
    let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
  }
  if path.exists() {
    // Best-effort remove stale
    let _ = fs::remove_file(path);
  }
  UnixListener::bind(path).with_context(|| format!("failed to bind {}", path.display()))
}

pub struct Daemon {
  listener: UnixListener,
  paths: MulticlaudePaths,
  options: DaemonOptions,
  lifecycle: Arc<LifecycleManager>,
  dispatcher: Arc<Dispatcher>,
  shutdown: Arc<AtomicBool>,
}

impl Daemon {
  /// Load state and mailbox, then bind the socket.
  ///
  /// # Errors
  /// Fails when another daemon answers on the socket, when the snapshot is
  /// unreadable, or when the socket cannot be bound.
  pub fn bind(
    paths: MulticlaudePaths,
    options: DaemonOptions,
    launcher: Arc<dyn AgentLauncher>,
  ) -> Result<Self> {
    let socket = paths.socket().to_path_buf();
    if UnixStream::connect(&socket).is_ok() {
      bail!("daemon already running at {}", socket.display());
    }
    ensure_private_dir(paths.home())?;

    let store = Arc::new(StateStore::open(paths.state_file())?);
    let mailbox = Arc::new(Mailbox::open(paths.messages_dir())?);
    let lifecycle = Arc::new(LifecycleManager::new(
      store,
      launcher,
      paths.clone(),
      options.default_branch.clone(),
    ));
    let shutdown = Arc::new(AtomicBool::new(false));
    let dispatcher = Arc::new(Dispatcher::new(
      lifecycle.clone(),
      mailbox,
      &socket,
      shutdown.clone(),
    ));

    let listener = ensure_socket_dir_and_bind(&socket)?;
    listener
      .set_nonblocking(true)
      .context("failed to make listener non-blocking")?;
    write_atomic(&paths.pid_file(), std::process::id().to_string().as_bytes())?;

    Ok(Self {
      listener,
      paths,
      options,
      lifecycle,
      dispatcher,
      shutdown,
    })
  }

  /// Flag that stops [`Daemon::run`] once set.
  #[must_use]
  pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
    self.shutdown.clone()
  }

  #[must_use]
  pub fn store(&self) -> Arc<StateStore> {
    self.lifecycle.store().clone()
  }

  fn should_stop(&self) -> bool {
    self.shutdown.load(Ordering::SeqCst) || TERMINATE.load(Ordering::SeqCst)
  }

  /// Serve until a `stop` request, a termination signal or the shutdown flag.
  ///
  /// # Errors
  /// Returns an error if a background thread cannot be started.
  pub fn run(self) -> Result<()> {
    info!(
      "Starting daemon. Socket path: {}, state: {}",
      self.paths.socket().display(),
      self.paths.state_file().display()
    );
    let store = self.store();
    let notifier = PersistNotifier::spawn(store.clone(), self.options.debounce)?;
    let reconciler = self.spawn_reconciler()?;

    let conn_seq = AtomicU64::new(0);
    while !self.should_stop() {
      match self.listener.accept() {
        Ok((stream, _)) => self.serve(stream, &conn_seq),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
          std::thread::sleep(ACCEPT_POLL);
        }
        Err(e) => {
          error!("Accept error: {e}");
          std::thread::sleep(ACCEPT_POLL * 2);
        }
      }
    }

    info!("Shutting down daemon");
    self.shutdown.store(true, Ordering::SeqCst);
    if reconciler.join().is_err() {
      error!("Reconciler thread panicked");
    }
    notifier.shutdown();
    if let Err(err) = store.persist() {
      error!("Final state flush failed: {err:#}");
    }
    let _ = fs::remove_file(self.paths.socket());
    let _ = fs::remove_file(self.paths.pid_file());
    Ok(())
  }

  fn serve(&self, stream: UnixStream, conn_seq: &AtomicU64) {
    let id = conn_seq.fetch_add(1, Ordering::Relaxed);
    let dispatcher = self.dispatcher.clone();
    let timeout = self.options.io_timeout;
    let spawned = std::thread::Builder::new()
      .name(format!("conn-{id}"))
      .spawn(move || {
        if let Err(err) = handle_connection(stream, &dispatcher, timeout) {
          debug!("Connection {id} closed: {err:#}");
        }
      });
    if let Err(err) = spawned {
      error!("Failed to spawn connection thread: {err}");
    }
  }

  fn spawn_reconciler(&self) -> Result<JoinHandle<()>> {
    let dispatcher = self.dispatcher.clone();
    let shutdown = self.shutdown.clone();
    let interval = self.options.reconcile_interval;
    std::thread::Builder::new()
      .name("reconciler".to_string())
      .spawn(move || {
        let stopping = || shutdown.load(Ordering::SeqCst) || TERMINATE.load(Ordering::SeqCst);
        // First pass right away restores agents lost while the daemon was down
        let mut next = Instant::now();
        while !stopping() {
          if Instant::now() >= next {
            if let Err(err) = dispatcher.reconcile() {
              error!("Reconcile failed: {err:#}");
            }
            next = Instant::now() + interval;
          }
          std::thread::sleep(ACCEPT_POLL);
        }
      })
      .context("failed to spawn reconciler thread")
  }
}

/// Serve sequential request/response exchanges until the peer closes.
///
/// Malformed JSON gets an error response and then the connection is closed.
fn handle_connection(stream: UnixStream, dispatcher: &Dispatcher, timeout: Duration) -> Result<()> {
  stream.set_nonblocking(false)?;
  stream.set_read_timeout(Some(timeout))?;
  stream.set_write_timeout(Some(timeout))?;
  let mut reader = BufReader::new(stream.try_clone()?);
  let mut writer = stream;
  loop {
    match read_message::<_, Request>(&mut reader) {
      Ok(None) => return Ok(()),
      Ok(Some(req)) => {
        let command = req.command.clone();
        let resp = dispatcher.handle(req);
        if !resp.success {
          debug!("{command}: {}", resp.error.as_deref().unwrap_or_default());
        }
        write_message(&mut writer, &resp).context("failed to write response")?;
      }
      Err(FrameError::Malformed(err)) => {
        warn!("Malformed request: {err}");
        let _ = write_message(&mut writer, &Response::err(format!("invalid request: {err}")));
        return Ok(());
      }
      Err(err) => return Err(err.into()),
    }
  }
}
