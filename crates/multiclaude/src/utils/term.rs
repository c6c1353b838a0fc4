use std::sync::OnceLock;

use owo_colors::OwoColorize as _;
use regex::Regex;

fn ansi_regex() -> &'static Regex {
  static ANSI_RE: OnceLock<Regex> = OnceLock::new();
  ANSI_RE.get_or_init(|| {
    // CSI sequences and OSC sequences terminated by BEL or ST
    Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]|\x1B\][^\x07\x1B]*(?:\x07|\x1B\\)")
      .expect("valid ANSI regex")
  })
}

#[must_use]
pub fn strip_ansi(input: &str) -> String {
  ansi_regex().replace_all(input, "").into_owned()
}

fn visible_len(s: &str) -> usize {
  strip_ansi(s).chars().count()
}

/// Render rows under dimmed headers, columns padded to their widest visible cell.
#[must_use]
pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> Vec<String> {
  let cols = headers.len();
  let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
  for row in rows {
    for (i, cell) in row.iter().enumerate().take(cols) {
      widths[i] = widths[i].max(visible_len(cell));
    }
  }

  let pad_line = |cells: &mut dyn Iterator<Item = &str>| {
    let mut line = String::new();
    for (i, cell) in cells.enumerate().take(cols) {
      line.push_str(cell);
      if i + 1 < cols {
        let spaces = widths[i].saturating_sub(visible_len(cell)) + 1;
        line.push_str(&" ".repeat(spaces));
      }
    }
    line
  };

  let mut out = Vec::with_capacity(rows.len() + 1);
  let header = pad_line(&mut headers.iter().copied());
  out.push(format!("{}", header.dimmed()));
  for row in rows {
    out.push(pad_line(&mut row.iter().map(String::as_str)));
  }
  out
}

pub fn print_table(headers: &[&str], rows: &[Vec<String>]) {
  for line in render_table(headers, rows) {
    anstream::println!("{line}");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::utils::log::t;

  #[test]
  fn columns_align_on_visible_width() {
    let rows = vec![
      vec![t::name("calm-otter"), "worker".to_string()],
      vec!["supervisor".to_string(), "supervisor".to_string()],
    ];
    let lines: Vec<String> = render_table(&["NAME", "TYPE"], &rows)
      .iter()
      .map(|l| strip_ansi(l))
      .collect();
    assert_eq!(lines[0], "NAME       TYPE");
    assert_eq!(lines[1], "calm-otter worker");
    assert_eq!(lines[2], "supervisor supervisor");
  }
}
