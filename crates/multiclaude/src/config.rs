use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use owo_colors::OwoColorize as _;
use serde::Deserialize;
use toml::Value as TomlValue;

use crate::state::AgentType;

/// Known top-level config keys.
const KNOWN_TOP_LEVEL_KEYS: &[&str] = &["default_branch", "daemon", "agent", "agents", "tmux"];

/// Known keys within `[daemon]` section.
const KNOWN_DAEMON_KEYS: &[&str] = &[
  "socket_path",
  "state_path",
  "debounce_ms",
  "reconcile_interval_secs",
  "io_timeout_secs",
];

/// Known keys within `[agent]` and each `[agents.<type>]` section.
const KNOWN_AGENT_KEYS: &[&str] = &["cmd"];

/// Known keys within `[tmux]` section.
const KNOWN_TMUX_KEYS: &[&str] = &["socket_path"];

// Embed built-in defaults
const DEFAULT_TOML: &str =
  include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/defaults/multiclaude.toml"));

pub const HOME_ENV: &str = "MULTICLAUDE_HOME";
pub const SOCKET_ENV: &str = "MULTICLAUDE_SOCKET_PATH";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentCommandConfig {
  #[serde(default)]
  pub cmd: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
  #[serde(default)]
  pub socket_path: Option<String>,
  #[serde(default)]
  pub state_path: Option<String>,
  #[serde(default)]
  pub debounce_ms: Option<u64>,
  #[serde(default)]
  pub reconcile_interval_secs: Option<u64>,
  #[serde(default)]
  pub io_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TmuxConfig {
  /// Dedicated tmux server socket. Unset means the user's default server.
  #[serde(default)]
  pub socket_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MulticlaudeConfig {
  #[serde(default)]
  pub default_branch: Option<String>,
  #[serde(default)]
  pub daemon: Option<DaemonConfig>,
  /// Command used for agent types without their own entry in `agents`.
  #[serde(default)]
  pub agent: Option<AgentCommandConfig>,
  #[serde(default)]
  pub agents: BTreeMap<String, AgentCommandConfig>,
  #[serde(default)]
  pub tmux: Option<TmuxConfig>,
}

impl MulticlaudeConfig {
  #[must_use]
  pub fn default_branch(&self) -> &str {
    self
      .default_branch
      .as_deref()
      .filter(|b| !b.trim().is_empty())
      .unwrap_or("main")
  }

  fn daemon_value(&self, f: impl Fn(&DaemonConfig) -> Option<u64>) -> Option<u64> {
    self.daemon.as_ref().and_then(f)
  }

  #[must_use]
  pub fn debounce(&self) -> Duration {
    Duration::from_millis(self.daemon_value(|d| d.debounce_ms).unwrap_or(200))
  }

  #[must_use]
  pub fn reconcile_interval(&self) -> Duration {
    Duration::from_secs(
      self
        .daemon_value(|d| d.reconcile_interval_secs)
        .unwrap_or(120)
        .max(1),
    )
  }

  #[must_use]
  pub fn io_timeout(&self) -> Duration {
    Duration::from_secs(self.daemon_value(|d| d.io_timeout_secs).unwrap_or(30).max(1))
  }

  #[must_use]
  pub fn tmux_socket_path(&self) -> Option<PathBuf> {
    self
      .tmux
      .as_ref()
      .and_then(|t| t.socket_path.as_deref())
      .map(PathBuf::from)
  }

  /// Agent argv for `agent_type`: `[agents.<type>]` first, then `[agent]`.
  ///
  /// # Errors
  /// Returns an error when neither section defines a non-empty command.
  pub fn agent_argv(&self, agent_type: AgentType) -> Result<Vec<String>> {
    let specific = self
      .agents
      .get(agent_type.as_str())
      .filter(|a| !a.cmd.is_empty());
    let fallback = self.agent.as_ref().filter(|a| !a.cmd.is_empty());
    match specific.or(fallback) {
      Some(cfg) => Ok(cfg.cmd.clone()),
      None => anyhow::bail!("no agent command configured for {agent_type} (set [agent] cmd)"),
    }
  }
}

/// Filesystem layout of one multiclaude home.
#[derive(Debug, Clone)]
pub struct MulticlaudePaths {
  home: PathBuf,
  socket: PathBuf,
  state: PathBuf,
}

impl MulticlaudePaths {
  pub fn new(home: impl Into<PathBuf>, socket: impl Into<PathBuf>, state: impl Into<PathBuf>) -> Self {
    Self {
      home: home.into(),
      socket: socket.into(),
      state: state.into(),
    }
  }

  /// Default layout below `home`: `daemon.sock` and `state.json`.
  pub fn under(home: impl Into<PathBuf>) -> Self {
    let home = home.into();
    Self {
      socket: home.join("daemon.sock"),
      state: home.join("state.json"),
      home,
    }
  }

  /// Resolve the layout from environment and config.
  #[must_use]
  pub fn resolve(home: &Path, cfg: &MulticlaudeConfig) -> Self {
    Self::new(
      home,
      compute_socket_path(home, cfg),
      compute_state_path(home, cfg),
    )
  }

  #[must_use]
  pub fn home(&self) -> &Path {
    &self.home
  }

  #[must_use]
  pub fn socket(&self) -> &Path {
    &self.socket
  }

  #[must_use]
  pub fn state_file(&self) -> &Path {
    &self.state
  }

  #[must_use]
  pub fn pid_file(&self) -> PathBuf {
    self.home.join("daemon.pid")
  }

  #[must_use]
  pub fn log_file(&self) -> PathBuf {
    self.home.join("daemon.log")
  }

  #[must_use]
  pub fn repos_dir(&self) -> PathBuf {
    self.home.join("repos")
  }

  /// Main checkout of a tracked repository.
  #[must_use]
  pub fn repo_checkout(&self, repo: &str) -> PathBuf {
    self.repos_dir().join(repo)
  }

  #[must_use]
  pub fn worktrees_dir(&self) -> PathBuf {
    self.home.join("wts")
  }

  #[must_use]
  pub fn worktree(&self, repo: &str, agent: &str) -> PathBuf {
    self.worktrees_dir().join(repo).join(agent)
  }

  #[must_use]
  pub fn messages_dir(&self) -> PathBuf {
    self.home.join("messages")
  }
}

#[derive(Debug, Clone)]
pub struct AppContext {
  pub paths: MulticlaudePaths,
  pub config: MulticlaudeConfig,
}

impl AppContext {
  /// Resolve the home directory, load configuration and compute paths.
  ///
  /// # Errors
  /// Returns an error if a config file cannot be read or parsed.
  pub fn load() -> Result<Self> {
    let home = resolve_home();
    let config = load_config(&home)?;
    let paths = MulticlaudePaths::resolve(&home, &config);
    Ok(Self { paths, config })
  }
}

/// `$MULTICLAUDE_HOME`, else `~/.multiclaude`.
#[must_use]
pub fn resolve_home() -> PathBuf {
  if let Ok(home) = std::env::var(HOME_ENV)
    && !home.trim().is_empty()
  {
    return PathBuf::from(home);
  }
  let base = std::env::var("HOME").map_or_else(|_| PathBuf::from("."), PathBuf::from);
  base.join(".multiclaude")
}

/// Compute the daemon socket path.
///
/// Precedence:
/// 1) `MULTICLAUDE_SOCKET_PATH` environment variable
/// 2) `config.daemon.socket_path` if set
/// 3) `<home>/daemon.sock`
#[must_use]
pub fn compute_socket_path(home: &Path, cfg: &MulticlaudeConfig) -> PathBuf {
  if let Ok(env_path) = std::env::var(SOCKET_ENV)
    && !env_path.trim().is_empty()
  {
    return PathBuf::from(env_path);
  }
  if let Some(ref daemon) = cfg.daemon
    && let Some(ref p) = daemon.socket_path
  {
    return PathBuf::from(p);
  }
  home.join("daemon.sock")
}

#[must_use]
pub fn compute_state_path(home: &Path, cfg: &MulticlaudeConfig) -> PathBuf {
  if let Some(ref daemon) = cfg.daemon
    && let Some(ref p) = daemon.state_path
  {
    return PathBuf::from(p);
  }
  home.join("state.json")
}

fn merge_values(base: &mut TomlValue, overlay: TomlValue) {
  match (base, overlay) {
    (TomlValue::Table(base_tbl), TomlValue::Table(overlay_tbl)) => {
      for (k, v) in overlay_tbl {
        match base_tbl.get_mut(&k) {
          Some(existing) => merge_values(existing, v),
          None => {
            base_tbl.insert(k, v);
          }
        }
      }
    }
    // Arrays and scalars: replace last-wins
    (base_slot, new_v) => *base_slot = new_v,
  }
}

fn warn_keys(table: &toml::Table, known: &[&str], prefix: &str, file_path: &Path) {
  for key in table.keys() {
    if !known.contains(&key.as_str()) {
      eprintln!(
        "{}: unknown config key '{prefix}{key}' in {} (known keys: {})",
        "warning".yellow(),
        file_path.display(),
        known.join(", ")
      );
    }
  }
}

/// Warn about unknown keys in a parsed TOML config file.
fn warn_unknown_keys(val: &TomlValue, file_path: &Path) {
  let TomlValue::Table(table) = val else {
    return;
  };
  warn_keys(table, KNOWN_TOP_LEVEL_KEYS, "", file_path);

  if let Some(TomlValue::Table(daemon)) = table.get("daemon") {
    warn_keys(daemon, KNOWN_DAEMON_KEYS, "daemon.", file_path);
  }
  if let Some(TomlValue::Table(agent)) = table.get("agent") {
    warn_keys(agent, KNOWN_AGENT_KEYS, "agent.", file_path);
  }
  if let Some(TomlValue::Table(tmux)) = table.get("tmux") {
    warn_keys(tmux, KNOWN_TMUX_KEYS, "tmux.", file_path);
  }
  if let Some(TomlValue::Table(agents)) = table.get("agents") {
    for (agent_type, agent_val) in agents {
      if agent_type.parse::<AgentType>().is_err() {
        eprintln!(
          "{}: unknown agent type 'agents.{agent_type}' in {}",
          "warning".yellow(),
          file_path.display(),
        );
      }
      if let TomlValue::Table(agent_table) = agent_val {
        warn_keys(
          agent_table,
          KNOWN_AGENT_KEYS,
          &format!("agents.{agent_type}."),
          file_path,
        );
      }
    }
  }
}

fn merge_file(merged: &mut TomlValue, path: &Path) -> Result<()> {
  let data =
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
  let val: TomlValue =
    toml::from_str(&data).with_context(|| format!("invalid TOML in {}", path.display()))?;
  warn_unknown_keys(&val, path);
  merge_values(merged, val);
  Ok(())
}

/// Load and merge configuration from defaults, the global file and `<home>/config.toml`.
///
/// # Errors
/// Returns an error if any of the config files cannot be read or parsed
/// as valid TOML.
pub fn load_config(home: &Path) -> Result<MulticlaudeConfig> {
  let mut merged: TomlValue =
    toml::from_str(DEFAULT_TOML).context("invalid embedded default config")?;

  let xdg = xdg::BaseDirectories::with_prefix("multiclaude");
  if let Some(global_path) = xdg.find_config_file("multiclaude.toml") {
    merge_file(&mut merged, &global_path)?;
  }

  let home_cfg = home.join("config.toml");
  if home_cfg.exists() {
    merge_file(&mut merged, &home_cfg)?;
  }

  let merged_str = toml::to_string(&merged).context("failed to serialize merged config")?;
  let cfg: MulticlaudeConfig =
    toml::from_str(&merged_str).context("failed to parse merged config")?;
  Ok(cfg)
}
