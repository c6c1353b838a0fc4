use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};

/// Handle on the tmux server agents run in.
#[derive(Debug, Clone, Default)]
pub struct Tmux {
  socket: Option<PathBuf>,
}

impl Tmux {
  #[must_use]
  pub fn new(socket: Option<PathBuf>) -> Self {
    Self { socket }
  }

  /// Base tmux command, pointed at the dedicated socket when one is configured.
  fn cmd(&self) -> Command {
    let mut cmd = Command::new("tmux");
    if let Some(sock) = &self.socket {
      cmd.arg("-S").arg(sock);
    }
    cmd
  }

  #[must_use]
  pub fn has_session(&self, session: &str) -> bool {
    self
      .cmd()
      .args(["has-session", "-t", &exact(session)])
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .status()
      .is_ok_and(|s| s.success())
  }

  /// Create a detached session rooted at `cwd` unless it already exists.
  ///
  /// # Errors
  /// Returns an error if tmux cannot be run or refuses to create the session.
  pub fn ensure_session(&self, session: &str, cwd: &Path) -> Result<()> {
    if self.has_session(session) {
      return Ok(());
    }
    let mut cmd = self.cmd();
    cmd
      .args(["new-session", "-d", "-s", session, "-c"])
      .arg(cwd);
    run_cmd(&mut cmd).context("tmux new-session failed")
  }

  /// Open a detached window running `program args` and return the pane's pid.
  ///
  /// Uses `-e` flags to pass environment to the new window (tmux 3.2+).
  ///
  /// # Errors
  /// Returns an error if tmux fails or prints something other than a pid.
  pub fn new_window(
    &self,
    session: &str,
    window: &str,
    cwd: &Path,
    env: &BTreeMap<String, String>,
    program: &str,
    args: &[String],
  ) -> Result<u32> {
    let mut cmd = self.cmd();
    cmd.args(["new-window", "-d", "-P", "-F", "#{pane_pid}"]);
    for (k, v) in env {
      cmd.arg("-e").arg(format!("{k}={v}"));
    }
    cmd
      .args(["-t", &format!("{}:", exact(session)), "-n", window, "-c"])
      .arg(cwd)
      .arg(program)
      .args(args);
    let out = run_output(&mut cmd).context("tmux new-window failed")?;
    parse_pane_pid(&out)
  }

  /// Kill `session:window`. A window that is already gone is not an error.
  ///
  /// # Errors
  /// Returns an error if tmux cannot be run.
  pub fn kill_window(&self, session: &str, window: &str) -> Result<()> {
    self
      .cmd()
      .args(["kill-window", "-t", &format!("{}:{window}", exact(session))])
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .status()
      .context("failed to run tmux kill-window")?;
    Ok(())
  }
}

// `=name` makes tmux match the session name exactly instead of by prefix
fn exact(session: &str) -> String {
  format!("={session}")
}

fn parse_pane_pid(out: &str) -> Result<u32> {
  let line = out.lines().next().unwrap_or_default().trim();
  match line.parse::<u32>() {
    Ok(pid) if pid != 0 => Ok(pid),
    _ => bail!("unexpected tmux output for pane pid: {line:?}"),
  }
}

/// Run a command and return an error if it fails.
///
/// # Errors
/// Returns an error if the command fails to spawn or exits with non-zero status.
pub fn run_cmd(cmd: &mut Command) -> Result<()> {
  let status = cmd
    .stdout(Stdio::null())
    .stderr(Stdio::null())
    .status()
    .with_context(|| format!("spawn {cmd:?}"))?;
  if status.success() {
    Ok(())
  } else {
    bail!("command failed: {cmd:?}")
  }
}

/// Run a command and return its stdout.
///
/// # Errors
/// Returns an error if the command fails to spawn or exits with non-zero status.
pub fn run_output(cmd: &mut Command) -> Result<String> {
  let out = cmd.output().with_context(|| format!("spawn {cmd:?}"))?;
  if !out.status.success() {
    bail!(
      "command failed: {cmd:?}: {}",
      String::from_utf8_lossy(&out.stderr).trim()
    );
  }
  Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}
