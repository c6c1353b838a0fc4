use std::collections::HashMap;

use anyhow::{Result, bail};

/// Split an argv into program and arguments, rejecting empty commands.
pub fn split_argv(argv: &[String]) -> Result<(&str, &[String])> {
  let Some((program, args)) = argv.split_first() else {
    bail!("command is empty");
  };
  if program.trim().is_empty() {
    bail!("command program is empty");
  }
  Ok((program, args))
}

/// Expand "$VAR" references in argv using `env`. Does not support `${}` forms.
///
/// Unknown variables expand to the empty string; a `$` not followed by a
/// name is kept literally.
#[must_use]
pub fn expand_vars_in_argv(argv: &[String], env: &HashMap<String, String>) -> Vec<String> {
  argv.iter().map(|s| expand_vars(s, env)).collect()
}

fn expand_vars(s: &str, env: &HashMap<String, String>) -> String {
  let mut out = String::with_capacity(s.len());
  let mut rest = s;
  while let Some(pos) = rest.find('$') {
    out.push_str(&rest[..pos]);
    let after = &rest[pos + 1..];
    // Variable name: [A-Za-z_][A-Za-z0-9_]*
    let len = after
      .char_indices()
      .take_while(|&(i, c)| c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()))
      .count();
    if len == 0 {
      out.push('$');
    } else if let Some(val) = env.get(&after[..len]) {
      out.push_str(val);
    }
    rest = &after[len..];
  }
  out.push_str(rest);
  out
}
