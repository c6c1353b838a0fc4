pub mod command;
pub mod fs;
pub mod git;
pub mod log;
pub mod term;
pub mod tmux;
