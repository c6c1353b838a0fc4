use anyhow::Result;

use crate::config::AppContext;
use crate::protocol::{ListMessagesArgs, SendMessageArgs};
use crate::utils::log::t;
use crate::utils::term::print_table;
use crate::{log_info, log_success};

/// # Errors
/// Returns an error if the recipient cannot be resolved.
pub fn send(
  ctx: &AppContext,
  to: &str,
  body: &str,
  from: Option<String>,
  repo: Option<String>,
) -> Result<()> {
  let id = super::client(ctx).send_message(&SendMessageArgs {
    to: to.to_string(),
    body: body.to_string(),
    from,
    repo,
  })?;
  log_success!("Sent message {id} to {to}");
  Ok(())
}

/// # Errors
/// Returns an error if the repository cannot be resolved.
pub fn list(ctx: &AppContext, agent: Option<String>, repo: Option<String>) -> Result<()> {
  let messages = super::client(ctx).list_messages(&ListMessagesArgs { agent, repo })?;
  if messages.is_empty() {
    log_info!("No messages");
    return Ok(());
  }
  let rows: Vec<Vec<String>> = messages
    .iter()
    .map(|m| {
      vec![
        t::id(&m.id),
        m.from.clone(),
        t::name(&m.to),
        super::short_time(m.timestamp),
        m.body.clone(),
      ]
    })
    .collect();
  print_table(&["ID", "FROM", "TO", "SENT", "BODY"], &rows);
  Ok(())
}

/// # Errors
/// Returns an error if the message id is unknown.
pub fn ack(ctx: &AppContext, id: &str) -> Result<()> {
  super::client(ctx).ack_message(id)?;
  log_success!("Acknowledged message {id}");
  Ok(())
}
