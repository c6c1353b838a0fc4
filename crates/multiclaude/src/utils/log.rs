/// Token styling helpers.
///
/// The `t` module stands for "tokens". Use these helpers to style
/// specific values inside info messages consistently across the CLI.
pub mod t {
  use std::fmt::Display;

  use owo_colors::OwoColorize as _;

  pub fn id(value: impl Display) -> String {
    format!("{}", value.to_string().blue())
  }

  pub fn path(p: impl Display) -> String {
    format!("{}", p.to_string().cyan())
  }

  pub fn name(name: impl Display) -> String {
    format!("{}", name.to_string().magenta())
  }

  pub fn ok(s: impl Display) -> String {
    format!("{}", s.to_string().green())
  }

  pub fn warn(s: impl Display) -> String {
    format!("{}", s.to_string().yellow())
  }

  pub fn err(s: impl Display) -> String {
    format!("{}", s.to_string().red())
  }
}

// CLI output macros: info = neutral, success/warn/error = full-line tint.
// Use `t::*` helpers to highlight tokens in info messages only.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
  Info,
  Success,
  Warn,
  Error,
}

pub fn emit(level: LogLevel, text: &str) {
  match level {
    LogLevel::Info | LogLevel::Success => anstream::println!("{text}"),
    LogLevel::Warn | LogLevel::Error => anstream::eprintln!("{text}"),
  }
}

#[macro_export]
macro_rules! log_info {
  ($fmt:literal $(, $args:expr )* $(,)?) => {{
    $crate::utils::log::emit(
      $crate::utils::log::LogLevel::Info,
      &format!($fmt $(, $args )*)
    );
  }};
}

#[macro_export]
macro_rules! log_success {
  ($fmt:literal $(, $args:expr )* $(,)?) => {{
    $crate::utils::log::emit(
      $crate::utils::log::LogLevel::Success,
      &$crate::utils::log::t::ok(format!($fmt $(, $args )*))
    );
  }};
}

#[macro_export]
macro_rules! log_warn {
  ($fmt:literal $(, $args:expr )* $(,)?) => {{
    $crate::utils::log::emit(
      $crate::utils::log::LogLevel::Warn,
      &$crate::utils::log::t::warn(format!($fmt $(, $args )*))
    );
  }};
}

#[macro_export]
macro_rules! log_error {
  ($fmt:literal $(, $args:expr )* $(,)?) => {{
    $crate::utils::log::emit(
      $crate::utils::log::LogLevel::Error,
      &$crate::utils::log::t::err(format!($fmt $(, $args )*))
    );
  }};
}

#[cfg(test)]
mod tests {
  use super::t;

  #[test]
  fn tinted_tokens_keep_their_text() {
    for styled in [t::ok("done"), t::warn("done"), t::err("done"), t::name("done")] {
      assert!(styled.contains("done"));
      assert!(styled.contains("\u{1b}["));
    }
  }

  #[test]
  fn macros_no_panic() {
    crate::log_info!("A {}", 1);
    crate::log_success!("B");
    crate::log_warn!("C");
    crate::log_error!("D");
  }
}
