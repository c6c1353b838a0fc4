mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use multiclaude::client::ClientError;
use multiclaude::protocol::{
  AddRepoArgs, AgentArgs, CompleteAgentArgs, ListMessagesArgs, SendMessageArgs, SpawnAgentArgs,
  SpawnWorkerArgs, TaskHistoryArgs, UpdateTaskStatusArgs,
};
use multiclaude::state::{AgentType, State, TaskStatus};
use pretty_assertions::assert_eq;
use serde_json::json;

use crate::common::{FakeLauncher, TestEnv};

fn add_app(client: &multiclaude::client::DaemonClient) -> Result<()> {
  client.add_repo(&AddRepoArgs {
    name: "app".into(),
    github_url: "https://github.com/acme/app".into(),
    ..AddRepoArgs::default()
  })?;
  Ok(())
}

#[test]
fn unknown_command_keeps_connection_open() -> Result<()> {
  let env = TestEnv::new();
  if !env.sockets_available() {
    eprintln!("Skipping unknown_command_keeps_connection_open: Unix sockets not available");
    return Ok(());
  }
  let daemon = env.start_daemon(Arc::new(FakeLauncher::default()))?;
  let mut conn = daemon.raw()?;

  conn.send_line(r#"{"command":"frobnicate","args":{}}"#)?;
  let resp = conn.read_response()?.expect("response");
  assert_eq!(resp, json!({"success": false, "error": "unknown command"}));

  conn.send_line(r#"{"command":"ping"}"#)?;
  let resp = conn.read_response()?.expect("response");
  assert_eq!(resp, json!({"success": true}));
  Ok(())
}

#[test]
fn malformed_json_gets_error_then_close() -> Result<()> {
  let env = TestEnv::new();
  if !env.sockets_available() {
    eprintln!("Skipping malformed_json_gets_error_then_close: Unix sockets not available");
    return Ok(());
  }
  let daemon = env.start_daemon(Arc::new(FakeLauncher::default()))?;
  let mut conn = daemon.raw()?;

  conn.send_line("{not json")?;
  let resp = conn.read_response()?.expect("error response");
  assert_eq!(resp["success"], json!(false));
  assert!(resp["error"].as_str().unwrap_or_default().contains("invalid request"));
  assert!(conn.read_response()?.is_none(), "connection should be closed");

  // The daemon keeps serving other clients
  daemon.client().ping()?;
  Ok(())
}

#[test]
fn spawn_into_unknown_repo_leaves_state_untouched() -> Result<()> {
  let env = TestEnv::new();
  if !env.sockets_available() {
    eprintln!("Skipping spawn_into_unknown_repo_leaves_state_untouched: Unix sockets not available");
    return Ok(());
  }
  let launcher = Arc::new(FakeLauncher::default());
  let daemon = env.start_daemon(launcher.clone())?;
  let client = daemon.client();

  let before = client.get_state()?;
  let err = client
    .spawn_worker(&SpawnWorkerArgs {
      task: "fix the build".into(),
      repo: Some("ghost".into()),
      ..SpawnWorkerArgs::default()
    })
    .unwrap_err();
  assert!(matches!(err, ClientError::Remote(ref m) if m.contains("repository not found: ghost")));
  assert!(!err.is_connectivity());
  assert_eq!(client.get_state()?, before);
  assert!(launcher.launched.lock().is_empty());
  Ok(())
}

#[test]
fn worker_completion_lands_in_history() -> Result<()> {
  let env = TestEnv::new();
  if !env.sockets_available() {
    eprintln!("Skipping worker_completion_lands_in_history: Unix sockets not available");
    return Ok(());
  }
  let launcher = Arc::new(FakeLauncher::default());
  let daemon = env.start_daemon(launcher.clone())?;
  let client = daemon.client();
  add_app(&client)?;
  client.set_current_repo("app")?;

  let first = client.spawn_worker(&SpawnWorkerArgs {
    task: "fix the build".into(),
    ..SpawnWorkerArgs::default()
  })?;
  let second = client.spawn_worker(&SpawnWorkerArgs {
    task: "add a changelog".into(),
    ..SpawnWorkerArgs::default()
  })?;
  assert_ne!(first, second);
  let agents = client.list_agents(None)?;
  assert!(agents[&first].is_running());
  assert_eq!(agents[&first].task.as_deref(), Some("fix the build"));

  client.complete_agent(&CompleteAgentArgs {
    name: first.clone(),
    summary: Some("fixed".into()),
    ..CompleteAgentArgs::default()
  })?;
  client.complete_agent(&CompleteAgentArgs {
    name: second.clone(),
    failure_reason: Some("no write access".into()),
    pr_url: None,
    ..CompleteAgentArgs::default()
  })?;
  let report = client.trigger_cleanup()?;
  let mut cleaned = report.cleaned.clone();
  cleaned.sort();
  let mut expected = vec![format!("app/{first}"), format!("app/{second}")];
  expected.sort();
  assert_eq!(cleaned, expected);
  assert!(client.list_agents(None)?.is_empty());

  let all = client.task_history(&TaskHistoryArgs::default())?;
  assert_eq!(all.len(), 2);
  let newest = client.task_history(&TaskHistoryArgs {
    limit: Some(1),
    ..TaskHistoryArgs::default()
  })?;
  assert_eq!(newest.len(), 1);
  assert_eq!(newest[0], all[0]);

  let failed = client.task_history(&TaskHistoryArgs {
    status: Some(TaskStatus::Failed),
    ..TaskHistoryArgs::default()
  })?;
  assert_eq!(failed.len(), 1);
  assert_eq!(failed[0].name, second);
  assert_eq!(failed[0].failure_reason.as_deref(), Some("no write access"));
  Ok(())
}

#[test]
fn open_pr_entry_is_resolved_by_status_update() -> Result<()> {
  let env = TestEnv::new();
  if !env.sockets_available() {
    eprintln!("Skipping open_pr_entry_is_resolved_by_status_update: Unix sockets not available");
    return Ok(());
  }
  let daemon = env.start_daemon(Arc::new(FakeLauncher::default()))?;
  let client = daemon.client();
  add_app(&client)?;

  let name = client.spawn_worker(&SpawnWorkerArgs {
    task: "bump deps".into(),
    repo: Some("app".into()),
    ..SpawnWorkerArgs::default()
  })?;
  client.complete_agent(&CompleteAgentArgs {
    name: name.clone(),
    repo: Some("app".into()),
    pr_url: Some("https://github.com/acme/app/pull/12".into()),
    pr_number: Some(12),
    ..CompleteAgentArgs::default()
  })?;
  client.trigger_cleanup()?;

  let history = client.task_history(&TaskHistoryArgs {
    repo: Some("app".into()),
    ..TaskHistoryArgs::default()
  })?;
  assert_eq!(history.len(), 1);
  assert_eq!(history[0].status, TaskStatus::Open);

  let resolved = client.update_task_status(&UpdateTaskStatusArgs {
    name: name.clone(),
    status: TaskStatus::Merged,
    repo: Some("app".into()),
    branch: None,
    pr_url: None,
    pr_number: None,
    summary: None,
  })?;
  assert_eq!(resolved.status, TaskStatus::Merged);
  assert!(resolved.completed_at.is_some());
  assert_eq!(resolved.pr_number, Some(12));
  Ok(())
}

#[test]
fn dead_persistent_agent_is_respawned() -> Result<()> {
  let env = TestEnv::new();
  if !env.sockets_available() {
    eprintln!("Skipping dead_persistent_agent_is_respawned: Unix sockets not available");
    return Ok(());
  }
  let launcher = Arc::new(FakeLauncher::default());
  let daemon = env.start_daemon(launcher.clone())?;
  let client = daemon.client();
  add_app(&client)?;

  let name = client.spawn_agent(&SpawnAgentArgs {
    agent_type: AgentType::Supervisor,
    repo: Some("app".into()),
    name: None,
    task: None,
  })?;
  assert_eq!(name, "supervisor");
  let before = client.get_repo("app")?.agents["supervisor"].clone();
  launcher.kill(before.pid);

  let report = client.trigger_cleanup()?;
  assert_eq!(report.stopped, vec!["app/supervisor".to_string()]);
  assert_eq!(report.restarted, vec!["app/supervisor".to_string()]);

  let after = client.get_repo("app")?.agents["supervisor"].clone();
  assert!(after.is_running());
  assert_ne!(after.pid, before.pid);
  assert_ne!(after.session_id, before.session_id);
  assert_eq!(launcher.launched.lock().len(), 2);
  Ok(())
}

#[test]
fn messages_reach_agents_by_type() -> Result<()> {
  let env = TestEnv::new();
  if !env.sockets_available() {
    eprintln!("Skipping messages_reach_agents_by_type: Unix sockets not available");
    return Ok(());
  }
  let daemon = env.start_daemon(Arc::new(FakeLauncher::default()))?;
  let client = daemon.client();
  add_app(&client)?;
  client.set_current_repo("app")?;
  let worker = client.spawn_worker(&SpawnWorkerArgs {
    task: "write docs".into(),
    ..SpawnWorkerArgs::default()
  })?;

  let id = client.send_message(&SendMessageArgs {
    to: "worker".into(),
    body: "please rebase".into(),
    ..SendMessageArgs::default()
  })?;
  let inbox = client.list_messages(&ListMessagesArgs {
    agent: Some(worker.clone()),
    repo: None,
  })?;
  assert_eq!(inbox.len(), 1);
  assert_eq!(inbox[0].id, id);
  assert_eq!(inbox[0].from, "supervisor");
  assert_eq!(inbox[0].body, "please rebase");

  client.ack_message(&id)?;
  assert!(client.list_messages(&ListMessagesArgs::default())?.is_empty());
  let err = client.ack_message(&id).unwrap_err();
  assert!(err.to_string().contains("message not found"));

  client.remove_agent(&AgentArgs {
    name: worker,
    repo: None,
  })?;
  Ok(())
}

#[test]
fn stop_flushes_state_and_removes_socket() -> Result<()> {
  let env = TestEnv::new();
  if !env.sockets_available() {
    eprintln!("Skipping stop_flushes_state_and_removes_socket: Unix sockets not available");
    return Ok(());
  }
  let daemon = env.start_daemon(Arc::new(FakeLauncher::default()))?;
  let client = daemon.client();
  add_app(&client)?;
  client.set_current_repo("app")?;
  assert!(daemon.paths.pid_file().exists());

  // A second daemon must not steal the socket
  let second = multiclaude::daemon::Daemon::bind(
    daemon.paths.clone(),
    multiclaude::daemon::DaemonOptions::default(),
    Arc::new(FakeLauncher::default()),
  );
  assert!(second.is_err());

  client.stop()?;
  let paths = daemon.paths.clone();
  daemon.join()?;
  assert!(!paths.socket().exists());
  assert!(!paths.pid_file().exists());

  let data = std::fs::read_to_string(paths.state_file())?;
  let state: State = serde_json::from_str(&data)?;
  assert_eq!(state.current_repo.as_deref(), Some("app"));
  assert!(state.repos.contains_key("app"));

  let err = client.ping().unwrap_err();
  assert!(err.is_connectivity());
  Ok(())
}

#[test]
fn snapshot_follows_mutations() -> Result<()> {
  let env = TestEnv::new();
  if !env.sockets_available() {
    eprintln!("Skipping snapshot_follows_mutations: Unix sockets not available");
    return Ok(());
  }
  let daemon = env.start_daemon(Arc::new(FakeLauncher::default()))?;
  let client = daemon.client();
  add_app(&client)?;
  client.set_current_repo("app")?;
  client.clear_current_repo()?;

  let started = Instant::now();
  loop {
    let snapshot = std::fs::read_to_string(daemon.paths.state_file())
      .ok()
      .and_then(|d| serde_json::from_str::<State>(&d).ok());
    if let Some(state) = snapshot
      && state.repos.contains_key("app")
      && state.current_repo.is_none()
    {
      break;
    }
    assert!(
      started.elapsed() < Duration::from_secs(5),
      "snapshot never caught up"
    );
    std::thread::sleep(Duration::from_millis(20));
  }
  Ok(())
}
