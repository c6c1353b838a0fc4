use std::fs::OpenOptions;
use std::os::unix::net::UnixStream;
use std::process::{Command as ProcCommand, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};

use crate::client::ClientError;
use crate::config::AppContext;
use crate::daemon::{Daemon, DaemonOptions, install_termination_handlers};
use crate::launcher::TmuxLauncher;
use crate::utils::log::t;
use crate::{log_info, log_success, log_warn};

const READY_TIMEOUT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(50);

/// Run the daemon in the foreground until stopped.
///
/// # Errors
/// Returns an error if the daemon cannot start.
pub fn run_blocking(ctx: &AppContext) -> Result<()> {
  let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
    .format_timestamp_secs()
    .try_init();
  install_termination_handlers()?;

  let launcher = Arc::new(TmuxLauncher::new(ctx.config.clone()));
  let daemon = Daemon::bind(
    ctx.paths.clone(),
    DaemonOptions::from_config(&ctx.config),
    launcher,
  )?;
  daemon.run()
}

/// Start the daemon as a detached child and wait until it accepts connections.
///
/// # Errors
/// Returns an error if the child cannot be spawned or never becomes ready.
pub fn start(ctx: &AppContext) -> Result<()> {
  let socket = ctx.paths.socket();
  if UnixStream::connect(socket).is_ok() {
    log_warn!("Daemon already running");
    return Ok(());
  }

  crate::utils::fs::ensure_private_dir(ctx.paths.home())?;
  let log_path = ctx.paths.log_file();
  let log = OpenOptions::new()
    .create(true)
    .append(true)
    .open(&log_path)
    .with_context(|| format!("failed to open {}", log_path.display()))?;
  let exe = std::env::current_exe().context("failed to get current exe")?;
  ProcCommand::new(exe)
    .arg("daemon")
    .arg("run")
    .stdin(Stdio::null())
    .stdout(log.try_clone()?)
    .stderr(log)
    .spawn()
    .context("failed to spawn daemon child")?;

  let started = Instant::now();
  while started.elapsed() < READY_TIMEOUT {
    if UnixStream::connect(socket).is_ok() {
      log_success!("Started daemon at {}", socket.display());
      return Ok(());
    }
    thread::sleep(POLL);
  }
  bail!(
    "Daemon did not answer on {} within {}s (see {})",
    socket.display(),
    READY_TIMEOUT.as_secs(),
    log_path.display()
  )
}

/// Ask the daemon to stop and wait for its socket to disappear.
///
/// # Errors
/// Returns an error if the daemon rejects the request or keeps its socket.
pub fn stop(ctx: &AppContext) -> Result<()> {
  let client = super::client(ctx);
  match client.stop() {
    Ok(()) => {}
    Err(ClientError::SocketMissing(_)) => {
      log_info!("Daemon not running");
      return Ok(());
    }
    Err(err) => return Err(err.into()),
  }

  let socket = ctx.paths.socket();
  let started = Instant::now();
  while started.elapsed() < READY_TIMEOUT {
    if !socket.exists() {
      log_success!("Stopped daemon");
      return Ok(());
    }
    thread::sleep(POLL);
  }
  bail!("Daemon socket {} still present after stop", socket.display())
}

/// Print whether the daemon is running.
///
/// # Errors
/// Returns an error only for daemon-side failures; an unreachable daemon is reported as stopped.
pub fn status(ctx: &AppContext) -> Result<()> {
  match super::client(ctx).status() {
    Ok(status) => {
      log_info!(
        "Daemon:  {} (pid {}, {} repos, {} agents)",
        t::ok("running"),
        t::id(status.pid),
        status.repos,
        status.agents
      );
      log_info!("  Socket: {}", t::path(&status.socket_path));
    }
    Err(err) if err.is_connectivity() => {
      log_info!("Daemon:  {}", t::warn("stopped"));
      log_info!("  Socket: {}", t::path(ctx.paths.socket().display()));
    }
    Err(err) => return Err(err.into()),
  }
  Ok(())
}
