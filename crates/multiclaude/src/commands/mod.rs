use crate::client::DaemonClient;
use crate::config::AppContext;

pub mod agents;
pub mod daemon;
pub mod history;
pub mod msg;
pub mod repo;
pub mod status;

pub(crate) fn client(ctx: &AppContext) -> DaemonClient {
  DaemonClient::new(ctx.paths.socket())
}

/// Timestamp rendering shared by the list commands.
pub(crate) fn short_time(ts: chrono::DateTime<chrono::Utc>) -> String {
  ts.with_timezone(&chrono::Local)
    .format("%Y-%m-%d %H:%M")
    .to_string()
}
