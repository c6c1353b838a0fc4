use anyhow::Result;
use clap::{Parser, Subcommand};

pub mod client;
mod commands;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod errors;
pub mod history;
pub mod launcher;
pub mod lifecycle;
pub mod mailbox;
pub mod names;
pub mod notifier;
pub mod protocol;
pub mod state;
pub mod store;
pub mod utils;

use crate::client::ClientError;
use crate::commands::repo::ConfigFlags;
use crate::config::AppContext;
use crate::protocol::CompleteAgentArgs;
use crate::state::{AgentType, TaskStatus};

/// Multiclaude - run fleets of Claude agents across your repositories.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None, bin_name = "multiclaude")]
pub struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
  /// Manage the daemon process
  Daemon {
    #[command(subcommand)]
    command: DaemonCommand,
  },
  /// Check that the daemon answers
  Ping,
  /// Overview of tracked repositories
  Status,
  /// Manage tracked repositories
  Repo {
    #[command(subcommand)]
    command: RepoCommand,
  },
  /// List agents
  Agents {
    #[arg(long)]
    repo: Option<String>,
  },
  /// Spawn a worker for a task
  Work {
    task: String,
    #[arg(long)]
    repo: Option<String>,
    /// Branch the worker starts from
    #[arg(long)]
    branch: Option<String>,
    /// Remote the worker pushes to
    #[arg(long)]
    push_to: Option<String>,
  },
  /// Spawn an agent of any type
  Spawn {
    /// supervisor, worker, merge-queue, pr-shepherd, workspace, review or generic-persistent
    agent_type: AgentType,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    task: Option<String>,
    #[arg(long)]
    repo: Option<String>,
  },
  /// Stop an agent and forget it
  Rm {
    name: String,
    #[arg(long)]
    repo: Option<String>,
  },
  /// Report an agent as done
  Complete {
    name: String,
    #[arg(long)]
    repo: Option<String>,
    #[arg(long)]
    summary: Option<String>,
    /// Mark the work as failed with this reason
    #[arg(long = "failure")]
    failure_reason: Option<String>,
    #[arg(long)]
    pr_url: Option<String>,
    #[arg(long)]
    pr_number: Option<u64>,
  },
  /// Relaunch an agent's process
  Restart {
    name: String,
    #[arg(long)]
    repo: Option<String>,
  },
  /// Show finished work, newest first
  History {
    #[arg(long)]
    repo: Option<String>,
    #[arg(long)]
    status: Option<TaskStatus>,
    #[arg(long)]
    limit: Option<usize>,
  },
  /// Agent mailboxes
  Msg {
    #[command(subcommand)]
    command: MsgCommand,
  },
}

#[derive(Debug, Subcommand)]
enum DaemonCommand {
  /// Run the daemon in the foreground
  Run,
  /// Start the daemon in the background
  Start,
  /// Stop a running daemon
  Stop,
  /// Show daemon status
  Status,
}

#[derive(Debug, Subcommand)]
enum RepoCommand {
  /// Track a repository
  Add {
    name: String,
    github_url: String,
    #[arg(long)]
    tmux_session: Option<String>,
    #[arg(long)]
    target_branch: Option<String>,
  },
  /// List tracked repositories
  List,
  /// Make a repository the default for other commands
  Use { name: String },
  /// Stop tracking a repository
  Rm { name: String },
  /// Show or change repository config
  Config {
    #[arg(long)]
    repo: Option<String>,
    #[command(flatten)]
    flags: ConfigFlags,
  },
}

#[derive(Debug, Subcommand)]
enum MsgCommand {
  /// Send a message to an agent (by name or type)
  Send {
    to: String,
    body: String,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    repo: Option<String>,
  },
  /// List unacknowledged messages
  List {
    #[arg(long)]
    agent: Option<String>,
    #[arg(long)]
    repo: Option<String>,
  },
  /// Acknowledge a message
  Ack { id: String },
}

#[must_use]
pub fn parse() -> Cli {
  Cli::parse()
}

/// Parse arguments and run the selected command.
///
/// # Errors
/// Returns the command's error; see [`exit_code`] for how it maps to a status.
pub fn run() -> Result<()> {
  let cli = parse();
  let ctx = AppContext::load()?;

  match cli.command {
    Commands::Daemon { command } => match command {
      DaemonCommand::Run => commands::daemon::run_blocking(&ctx)?,
      DaemonCommand::Start => commands::daemon::start(&ctx)?,
      DaemonCommand::Stop => commands::daemon::stop(&ctx)?,
      DaemonCommand::Status => commands::daemon::status(&ctx)?,
    },
    Commands::Ping => commands::status::ping(&ctx)?,
    Commands::Status => commands::status::run(&ctx)?,
    Commands::Repo { command } => match command {
      RepoCommand::Add {
        name,
        github_url,
        tmux_session,
        target_branch,
      } => commands::repo::add(&ctx, &name, &github_url, tmux_session, target_branch)?,
      RepoCommand::List => commands::repo::list(&ctx)?,
      RepoCommand::Use { name } => commands::repo::use_repo(&ctx, &name)?,
      RepoCommand::Rm { name } => commands::repo::rm(&ctx, &name)?,
      RepoCommand::Config { repo, flags } => commands::repo::config(&ctx, repo, flags)?,
    },
    Commands::Agents { repo } => commands::agents::list(&ctx, repo.as_deref())?,
    Commands::Work {
      task,
      repo,
      branch,
      push_to,
    } => commands::agents::work(&ctx, &task, repo, branch, push_to)?,
    Commands::Spawn {
      agent_type,
      name,
      task,
      repo,
    } => commands::agents::spawn(&ctx, agent_type, repo, name, task)?,
    Commands::Rm { name, repo } => commands::agents::rm(&ctx, &name, repo)?,
    Commands::Complete {
      name,
      repo,
      summary,
      failure_reason,
      pr_url,
      pr_number,
    } => commands::agents::complete(
      &ctx,
      CompleteAgentArgs {
        name,
        repo,
        summary,
        failure_reason,
        pr_url,
        pr_number,
      },
    )?,
    Commands::Restart { name, repo } => commands::agents::restart(&ctx, &name, repo)?,
    Commands::History {
      repo,
      status,
      limit,
    } => commands::history::run(&ctx, repo, status, limit)?,
    Commands::Msg { command } => match command {
      MsgCommand::Send {
        to,
        body,
        from,
        repo,
      } => commands::msg::send(&ctx, &to, &body, from, repo)?,
      MsgCommand::List { agent, repo } => commands::msg::list(&ctx, agent, repo)?,
      MsgCommand::Ack { id } => commands::msg::ack(&ctx, &id)?,
    },
  }

  Ok(())
}

/// Process exit status for a failed command: 2 when the daemon could not be
/// reached, 1 for everything else.
#[must_use]
pub fn exit_code(err: &anyhow::Error) -> i32 {
  match err.downcast_ref::<ClientError>() {
    Some(client_err) if client_err.is_connectivity() => 2,
    _ => 1,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use clap::CommandFactory;
  use clap::error::ErrorKind;

  #[test]
  fn command_factory_builds() {
    Cli::command().debug_assert();
  }

  #[test]
  fn spawn_parses_agent_type() {
    let cli = Cli::try_parse_from(["multiclaude", "spawn", "merge-queue", "--repo", "app"]).unwrap();
    match cli.command {
      Commands::Spawn {
        agent_type, repo, ..
      } => {
        assert_eq!(agent_type, AgentType::MergeQueue);
        assert_eq!(repo.as_deref(), Some("app"));
      }
      other => panic!("unexpected command {other:?}"),
    }
    let err = Cli::try_parse_from(["multiclaude", "spawn", "intern"]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValueValidation);
  }

  #[test]
  fn repo_config_flags_parse() {
    let cli = Cli::try_parse_from([
      "multiclaude",
      "repo",
      "config",
      "--merge-queue",
      "false",
      "--pr-shepherd-track",
      "assigned",
    ])
    .unwrap();
    let Commands::Repo {
      command: RepoCommand::Config { repo, flags },
    } = cli.command
    else {
      panic!("expected repo config");
    };
    assert!(repo.is_none());
    assert_eq!(flags.merge_queue, Some(false));
    assert_eq!(flags.pr_shepherd_track, Some(crate::state::TrackMode::Assigned));
  }

  #[test]
  fn exit_codes_separate_connectivity() {
    let missing = anyhow::Error::from(ClientError::SocketMissing("/nope".into()));
    assert_eq!(exit_code(&missing), 2);
    let remote = anyhow::Error::from(ClientError::Remote("agent not found".into()));
    assert_eq!(exit_code(&remote), 1);
    assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
  }
}
