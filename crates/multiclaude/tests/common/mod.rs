#![allow(dead_code)]
use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use assert_cmd::Command;
use multiclaude::client::DaemonClient;
use multiclaude::config::MulticlaudePaths;
use multiclaude::daemon::{Daemon, DaemonOptions};
use multiclaude::launcher::{AgentLauncher, AgentTarget, LaunchSpec};
use parking_lot::Mutex;
use tempfile::{Builder, TempDir};

/// Launcher that hands out fake pids and tracks which are "alive".
#[derive(Default)]
pub struct FakeLauncher {
  next_pid: AtomicU32,
  alive: Mutex<HashSet<u32>>,
  pub launched: Mutex<Vec<LaunchSpec>>,
  pub terminated: Mutex<Vec<AgentTarget>>,
  pub fail: AtomicBool,
}

impl FakeLauncher {
  pub fn kill(&self, pid: u32) {
    self.alive.lock().remove(&pid);
  }
}

impl AgentLauncher for FakeLauncher {
  fn launch(&self, spec: &LaunchSpec) -> Result<u32> {
    if self.fail.load(Ordering::SeqCst) {
      anyhow::bail!("tmux is not available");
    }
    let pid = 40_000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
    self.alive.lock().insert(pid);
    self.launched.lock().push(spec.clone());
    Ok(pid)
  }

  fn is_alive(&self, pid: u32) -> bool {
    self.alive.lock().contains(&pid)
  }

  fn terminate(&self, target: &AgentTarget) -> Result<()> {
    self.alive.lock().remove(&target.pid);
    self.terminated.lock().push(target.clone());
    Ok(())
  }

  fn release(&self, _target: &AgentTarget) -> Result<()> {
    Ok(())
  }
}

#[derive(Debug)]
pub struct TestEnv {
  temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    // Keep socket paths well below the sun_path limit
    let temp = Builder::new()
      .prefix("mc-")
      .tempdir_in("/tmp")
      .expect("temp dir");
    Self { temp }
  }

  pub fn home(&self) -> PathBuf {
    self.temp.path().join("home")
  }

  pub fn paths(&self) -> MulticlaudePaths {
    MulticlaudePaths::under(self.home())
  }

  /// Best-effort check whether Unix sockets can be created in this environment.
  pub fn sockets_available(&self) -> bool {
    let probe = self.temp.path().join("probe.sock");
    match UnixListener::bind(&probe) {
      Ok(_l) => {
        let _ = std::fs::remove_file(&probe);
        true
      }
      Err(_) => false,
    }
  }

  pub fn start_daemon(&self, launcher: Arc<FakeLauncher>) -> Result<RunningDaemon> {
    let options = DaemonOptions {
      debounce: Duration::from_millis(20),
      reconcile_interval: Duration::from_secs(3600),
      io_timeout: Duration::from_secs(5),
      default_branch: "main".to_string(),
    };
    let paths = self.paths();
    let daemon = Daemon::bind(paths.clone(), options, launcher)?;
    let shutdown = daemon.shutdown_handle();
    let handle = std::thread::Builder::new()
      .name("test-daemon".to_string())
      .spawn(move || daemon.run())
      .context("spawn daemon thread")?;
    Ok(RunningDaemon {
      paths,
      shutdown,
      handle: Some(handle),
    })
  }

  /// The CLI binary, pointed at this environment's home and an empty global config.
  pub fn bin_cmd(&self) -> Result<Command> {
    let mut cmd = Command::cargo_bin("multiclaude")?;
    cmd
      .env("MULTICLAUDE_HOME", self.home())
      .env("XDG_CONFIG_HOME", self.temp.path().join("xdg"))
      .env_remove("MULTICLAUDE_SOCKET_PATH")
      .env("NO_COLOR", "1");
    Ok(cmd)
  }
}

pub struct RunningDaemon {
  pub paths: MulticlaudePaths,
  shutdown: Arc<AtomicBool>,
  handle: Option<JoinHandle<Result<()>>>,
}

impl RunningDaemon {
  pub fn client(&self) -> DaemonClient {
    DaemonClient::new(self.paths.socket()).with_timeout(Duration::from_secs(5))
  }

  pub fn socket(&self) -> &Path {
    self.paths.socket()
  }

  /// Open a raw connection for line-level protocol tests.
  pub fn raw(&self) -> Result<RawConn> {
    let stream = UnixStream::connect(self.socket())?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let reader = BufReader::new(stream.try_clone()?);
    Ok(RawConn { stream, reader })
  }

  /// Wait for the daemon thread to exit after a `stop` request.
  pub fn join(mut self) -> Result<()> {
    let handle = self.handle.take().context("daemon already joined")?;
    let started = Instant::now();
    while !handle.is_finished() {
      anyhow::ensure!(
        started.elapsed() < Duration::from_secs(10),
        "daemon did not stop"
      );
      std::thread::sleep(Duration::from_millis(20));
    }
    handle
      .join()
      .map_err(|_| anyhow::anyhow!("daemon thread panicked"))?
  }
}

impl Drop for RunningDaemon {
  fn drop(&mut self) {
    self.shutdown.store(true, Ordering::SeqCst);
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

pub struct RawConn {
  stream: UnixStream,
  reader: BufReader<UnixStream>,
}

impl RawConn {
  pub fn send_line(&mut self, line: &str) -> Result<()> {
    self.stream.write_all(line.as_bytes())?;
    self.stream.write_all(b"\n")?;
    self.stream.flush()?;
    Ok(())
  }

  /// Next response as JSON, or `None` once the daemon closed the connection.
  pub fn read_response(&mut self) -> Result<Option<serde_json::Value>> {
    let mut line = String::new();
    if self.reader.read_line(&mut line)? == 0 {
      return Ok(None);
    }
    Ok(Some(serde_json::from_str(&line)?))
  }
}
