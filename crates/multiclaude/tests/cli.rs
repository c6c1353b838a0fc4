mod common;

use std::sync::Arc;

use anyhow::Result;
use predicates::prelude::*;
use serial_test::serial;

use crate::common::{FakeLauncher, TestEnv};

#[test]
fn help_lists_commands() -> Result<()> {
  let env = TestEnv::new();
  env
    .bin_cmd()?
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("daemon").and(predicate::str::contains("history")));
  Ok(())
}

#[test]
fn ping_without_daemon_exits_with_connectivity_code() -> Result<()> {
  let env = TestEnv::new();
  env
    .bin_cmd()?
    .arg("ping")
    .assert()
    .code(2)
    .stderr(predicate::str::contains("daemon not running"));
  Ok(())
}

#[test]
fn daemon_status_reports_stopped() -> Result<()> {
  let env = TestEnv::new();
  env
    .bin_cmd()?
    .args(["daemon", "status"])
    .assert()
    .success()
    .stdout(predicate::str::contains("stopped"));
  Ok(())
}

#[test]
#[serial]
fn commands_talk_to_running_daemon() -> Result<()> {
  let env = TestEnv::new();
  if !env.sockets_available() {
    eprintln!("Skipping commands_talk_to_running_daemon: Unix sockets not available");
    return Ok(());
  }
  let _daemon = env.start_daemon(Arc::new(FakeLauncher::default()))?;

  env
    .bin_cmd()?
    .arg("ping")
    .assert()
    .success()
    .stdout(predicate::str::contains("pong"));

  env
    .bin_cmd()?
    .args(["repo", "add", "app", "https://github.com/acme/app"])
    .assert()
    .success();
  env.bin_cmd()?.args(["repo", "use", "app"]).assert().success();
  env
    .bin_cmd()?
    .args(["repo", "list"])
    .assert()
    .success()
    .stdout(predicate::str::contains("app").and(predicate::str::contains("acme/app")));

  env
    .bin_cmd()?
    .args(["work", "fix the flaky test"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Spawned worker"));
  env
    .bin_cmd()?
    .arg("agents")
    .assert()
    .success()
    .stdout(predicate::str::contains("fix the flaky test").and(predicate::str::contains("running")));

  env
    .bin_cmd()?
    .args(["repo", "config", "--merge-queue", "false"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Merge queue:    off"));

  // Daemon-reported failures exit with 1
  env
    .bin_cmd()?
    .args(["rm", "ghost"])
    .assert()
    .code(1)
    .stderr(predicate::str::contains("agent not found: ghost"));
  Ok(())
}

#[test]
#[serial]
fn daemon_start_status_stop_cycle() -> Result<()> {
  let env = TestEnv::new();
  if !env.sockets_available() {
    eprintln!("Skipping daemon_start_status_stop_cycle: Unix sockets not available");
    return Ok(());
  }
  env
    .bin_cmd()?
    .args(["daemon", "start"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Started daemon"));
  env
    .bin_cmd()?
    .args(["daemon", "status"])
    .assert()
    .success()
    .stdout(predicate::str::contains("running"));
  env
    .bin_cmd()?
    .args(["daemon", "start"])
    .assert()
    .success()
    .stderr(predicate::str::contains("already running"));
  env
    .bin_cmd()?
    .args(["daemon", "stop"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Stopped daemon"));

  let paths = env.paths();
  assert!(!paths.socket().exists());
  assert!(paths.state_file().exists());
  Ok(())
}
