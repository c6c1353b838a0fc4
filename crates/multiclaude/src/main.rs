use owo_colors::OwoColorize as _;

fn main() {
  if let Err(err) = multiclaude::run() {
    anstream::eprintln!("{}", format!("{err:#}").red());
    std::process::exit(multiclaude::exit_code(&err));
  }
}
