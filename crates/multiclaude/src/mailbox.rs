//! Per-agent inboxes.
//!
//! Messages live in memory and are mirrored one file each under
//! `<messages>/<repo>/<agent>/<id>.json`. Acknowledged messages are deleted.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;
use crate::state::{AgentType, Repository};
use crate::utils::fs::write_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
  Pending,
  Delivered,
  Read,
  Acked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
  pub id: String,
  pub from: String,
  pub to: String,
  pub repo: String,
  pub body: String,
  pub timestamp: DateTime<Utc>,
  pub status: MessageStatus,
}

/// Resolve `to` to an agent name: an exact name first, then the first agent of that type.
pub fn resolve_recipient(repo_name: &str, repo: &Repository, to: &str) -> Result<String, DomainError> {
  if repo.agents.contains_key(to) {
    return Ok(to.to_string());
  }
  if let Ok(agent_type) = to.parse::<AgentType>()
    && let Some((name, _)) = repo.find_agent_by_type(agent_type)
  {
    return Ok(name.clone());
  }
  Err(DomainError::AgentNotFound {
    repo: repo_name.to_string(),
    name: to.to_string(),
  })
}

pub struct Mailbox {
  dir: PathBuf,
  messages: Mutex<Vec<Message>>,
}

impl Mailbox {
  /// Load every message file below `dir`. Unreadable files are skipped with a warning.
  ///
  /// # Errors
  /// Returns an error if `dir` exists but cannot be listed.
  pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
    let dir = dir.into();
    let mut messages = Vec::new();
    if dir.exists() {
      load_tree(&dir, &mut messages)?;
    }
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    Ok(Self {
      dir,
      messages: Mutex::new(messages),
    })
  }

  fn file_for(&self, msg: &Message) -> PathBuf {
    self
      .dir
      .join(&msg.repo)
      .join(&msg.to)
      .join(format!("{}.json", msg.id))
  }

  fn write(&self, msg: &Message) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(msg).context("failed to serialize message")?;
    write_atomic(&self.file_for(msg), &bytes)
  }

  /// Queue a message for an already resolved recipient.
  ///
  /// # Errors
  /// Returns an error if the message file cannot be written; nothing is queued then.
  pub fn send(&self, repo: &str, to: &str, from: &str, body: &str) -> Result<Message> {
    let msg = Message {
      id: Uuid::new_v4().to_string(),
      from: from.to_string(),
      to: to.to_string(),
      repo: repo.to_string(),
      body: body.to_string(),
      timestamp: Utc::now(),
      status: MessageStatus::Pending,
    };
    self.write(&msg)?;
    self.messages.lock().push(msg.clone());
    Ok(msg)
  }

  /// Un-acknowledged messages of `repo`, oldest first, optionally for one agent.
  ///
  /// Pending messages are returned with status `delivered`. Their files are
  /// rewritten under the lock so a concurrent `ack` cannot be undone.
  pub fn list(&self, repo: &str, agent: Option<&str>) -> Vec<Message> {
    let mut messages = self.messages.lock();
    let mut out = Vec::new();
    for msg in messages
      .iter_mut()
      .filter(|m| m.repo == repo && agent.is_none_or(|a| m.to == a))
      .filter(|m| m.status != MessageStatus::Acked)
    {
      if msg.status == MessageStatus::Pending {
        msg.status = MessageStatus::Delivered;
        if let Err(err) = self.write(msg) {
          warn!("Failed to update message {}: {err:#}", msg.id);
        }
      }
      out.push(msg.clone());
    }
    out
  }

  /// Acknowledge and delete a message.
  ///
  /// # Errors
  /// Returns [`DomainError::MessageNotFound`] for unknown ids.
  pub fn ack(&self, id: &str) -> Result<Message> {
    let mut messages = self.messages.lock();
    let idx = messages
      .iter()
      .position(|m| m.id == id)
      .ok_or_else(|| DomainError::MessageNotFound(id.to_string()))?;
    let mut msg = messages.remove(idx);
    msg.status = MessageStatus::Acked;
    self.delete_file(&msg);
    Ok(msg)
  }

  /// Drop the inbox of an agent that no longer exists. Returns how many messages went with it.
  pub fn forget_agent(&self, repo: &str, agent: &str) -> usize {
    self.drop_where(|m| m.repo == repo && m.to == agent)
  }

  /// Drop messages whose recipient is not in `live` (`(repo, agent)` pairs).
  pub fn prune(&self, live: &HashSet<(String, String)>) -> usize {
    self.drop_where(|m| !live.contains(&(m.repo.clone(), m.to.clone())))
  }

  fn drop_where(&self, mut doomed: impl FnMut(&Message) -> bool) -> usize {
    let mut messages = self.messages.lock();
    let mut dropped = Vec::new();
    messages.retain(|m| {
      if doomed(m) {
        dropped.push(m.clone());
        false
      } else {
        true
      }
    });
    for msg in &dropped {
      self.delete_file(msg);
      // Only succeeds once the inbox is empty
      let _ = fs::remove_dir(self.dir.join(&msg.repo).join(&msg.to));
    }
    if !dropped.is_empty() {
      debug!("Dropped {} message(s) for removed agents", dropped.len());
    }
    dropped.len()
  }

  fn delete_file(&self, msg: &Message) {
    let path = self.file_for(msg);
    if let Err(err) = fs::remove_file(&path)
      && err.kind() != std::io::ErrorKind::NotFound
    {
      warn!("Failed to delete {}: {err}", path.display());
    }
  }
}

fn load_tree(dir: &Path, out: &mut Vec<Message>) -> Result<()> {
  let entries = fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
  for entry in entries.flatten() {
    let path = entry.path();
    if path.is_dir() {
      load_tree(&path, out)?;
    } else if path.extension().is_some_and(|e| e == "json") {
      let parsed = fs::read_to_string(&path)
        .map_err(anyhow::Error::from)
        .and_then(|data| serde_json::from_str::<Message>(&data).map_err(anyhow::Error::from));
      match parsed {
        Ok(msg) => out.push(msg),
        Err(err) => warn!("Skipping unreadable message {}: {err:#}", path.display()),
      }
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::state::Agent;

  fn repo_with(agents: &[(&str, AgentType)]) -> Repository {
    let mut repo = Repository::new("u", "s");
    for (name, agent_type) in agents {
      repo.agents.insert(
        (*name).to_string(),
        Agent {
          agent_type: *agent_type,
          worktree_path: String::new(),
          tmux_window: (*name).to_string(),
          session_id: "s".to_string(),
          pid: 0,
          task: None,
          summary: None,
          failure_reason: None,
          created_at: Utc::now(),
          last_nudge: None,
          ready_for_cleanup: None,
        },
      );
    }
    repo
  }

  #[test]
  fn recipient_by_name_or_type() {
    let repo = repo_with(&[
      ("supervisor", AgentType::Supervisor),
      ("calm-otter", AgentType::Worker),
    ]);
    assert_eq!(resolve_recipient("app", &repo, "calm-otter").unwrap(), "calm-otter");
    assert_eq!(resolve_recipient("app", &repo, "worker").unwrap(), "calm-otter");
    assert!(matches!(
      resolve_recipient("app", &repo, "merge-queue"),
      Err(DomainError::AgentNotFound { .. })
    ));
  }

  #[test]
  fn send_list_ack_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let mailbox = Mailbox::open(dir.path().join("messages")).unwrap();
    let first = mailbox.send("app", "calm-otter", "supervisor", "rebase please").unwrap();
    let second = mailbox.send("app", "calm-otter", "supervisor", "and add tests").unwrap();
    mailbox.send("app", "supervisor", "calm-otter", "done").unwrap();

    let listed = mailbox.list("app", Some("calm-otter"));
    assert_eq!(
      listed.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(),
      vec!["rebase please", "and add tests"]
    );
    assert!(listed.iter().all(|m| m.status == MessageStatus::Delivered));
    assert_eq!(mailbox.list("app", None).len(), 3);
    assert!(mailbox.list("other", None).is_empty());

    let file = dir
      .path()
      .join("messages/app/calm-otter")
      .join(format!("{}.json", first.id));
    assert!(file.exists());
    mailbox.ack(&first.id).unwrap();
    assert!(!file.exists());
    let listed = mailbox.list("app", Some("calm-otter"));
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, second.id);

    let err = mailbox.ack(&first.id).unwrap_err();
    assert!(err.to_string().contains("message not found"));
  }

  #[test]
  fn acked_messages_stay_gone_while_listing_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("messages");
    let mailbox = Mailbox::open(&path).unwrap();
    for i in 0..200 {
      let msg = mailbox.send("app", "w", "supervisor", &format!("m{i}")).unwrap();
      std::thread::scope(|scope| {
        let lister = scope.spawn(|| mailbox.list("app", Some("w")));
        mailbox.ack(&msg.id).unwrap();
        lister.join().unwrap();
      });
    }
    assert!(mailbox.list("app", None).is_empty());
    let reopened = Mailbox::open(&path).unwrap();
    assert!(reopened.list("app", None).is_empty());
  }

  #[test]
  fn inboxes_of_removed_agents_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("messages");
    let mailbox = Mailbox::open(&path).unwrap();
    mailbox.send("app", "gone", "supervisor", "one").unwrap();
    mailbox.send("app", "gone", "supervisor", "two").unwrap();
    mailbox.send("app", "stays", "supervisor", "three").unwrap();
    mailbox.send("lib", "stale", "supervisor", "four").unwrap();

    assert_eq!(mailbox.forget_agent("app", "gone"), 2);
    assert!(!path.join("app/gone").exists());
    assert_eq!(mailbox.forget_agent("app", "gone"), 0);

    let live = HashSet::from([("app".to_string(), "stays".to_string())]);
    assert_eq!(mailbox.prune(&live), 1);
    assert!(mailbox.list("lib", None).is_empty());
    let left = mailbox.list("app", None);
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].to, "stays");

    let reopened = Mailbox::open(&path).unwrap();
    assert_eq!(reopened.list("app", None).len(), 1);
    assert!(reopened.list("lib", None).is_empty());
  }

  #[test]
  fn messages_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("messages");
    let sent = {
      let mailbox = Mailbox::open(&path).unwrap();
      mailbox.send("app", "w", "supervisor", "hello").unwrap()
    };
    std::fs::write(path.join("app").join("w").join("junk.json"), "{").unwrap();
    let mailbox = Mailbox::open(&path).unwrap();
    let listed = mailbox.list("app", None);
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, sent.id);
  }
}
