use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};

use gix as git;

/// Open the main checkout of a tracked repository.
pub fn open_checkout(path: &Path) -> Result<git::Repository> {
  git::open(path).with_context(|| format!("failed to open git repository at {}", path.display()))
}

pub fn branch_exists(repo: &git::Repository, name: &str) -> bool {
  repo.find_reference(format!("refs/heads/{name}").as_str()).is_ok()
}

/// Clone `url` into `dest` unless a checkout is already there.
pub fn ensure_clone(url: &str, dest: &Path) -> Result<()> {
  if dest.join(".git").exists() {
    return Ok(());
  }
  if let Some(parent) = dest.parent() {
    std::fs::create_dir_all(parent)
      .with_context(|| format!("failed to create {}", parent.display()))?;
  }
  let dest_str = dest.to_string_lossy();
  let parent = dest.parent().unwrap_or(Path::new("."));
  run_git(&["clone", "--quiet", url, dest_str.as_ref()], parent)
}

/// Create a linked worktree at `wt_path` on `branch`.
///
/// The branch is created from `base` when it does not exist yet. An existing
/// worktree directory is reused as is.
pub fn add_worktree(repo: &git::Repository, wt_path: &Path, branch: &str, base: &str) -> Result<()> {
  if wt_path.exists() {
    return Ok(());
  }
  let workdir = repo
    .workdir()
    .ok_or_else(|| anyhow::anyhow!("no main worktree: cannot add linked worktree"))?;
  if let Some(parent) = wt_path.parent() {
    std::fs::create_dir_all(parent)
      .with_context(|| format!("failed to create {}", parent.display()))?;
  }
  let wt = wt_path.to_string_lossy();
  if branch_exists(repo, branch) {
    run_git(&["worktree", "add", "--quiet", wt.as_ref(), branch], workdir)
  } else {
    run_git(
      &["worktree", "add", "--quiet", "-b", branch, wt.as_ref(), base],
      workdir,
    )
  }
}

/// Remove a linked worktree, falling back to `git worktree prune`.
///
/// Returns whether the worktree directory is gone afterwards.
pub fn remove_worktree(repo: &git::Repository, wt_path: &Path) -> Result<bool> {
  if !wt_path.exists() {
    return Ok(true);
  }
  let workdir = repo
    .workdir()
    .ok_or_else(|| anyhow::anyhow!("no main worktree: cannot remove linked worktree"))?;
  let wt = wt_path.to_string_lossy();
  if run_git(&["worktree", "remove", "--force", wt.as_ref()], workdir).is_err() {
    let _ = run_git(&["worktree", "prune"], workdir);
  }
  Ok(!wt_path.exists())
}

fn run_git(args: &[&str], cwd: &Path) -> Result<()> {
  // Run git quietly: suppress stdout/stderr to keep daemon logs clean.
  let status = Command::new("git")
    .current_dir(cwd)
    .args(args)
    .stdout(Stdio::null())
    .stderr(Stdio::null())
    .status()
    .with_context(|| format!("failed to run git {}", args.join(" ")))?;
  if !status.success() {
    bail!("git {} exited with status {}", args.join(" "), status);
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn git_available() -> bool {
    Command::new("git")
      .arg("--version")
      .stdout(Stdio::null())
      .status()
      .is_ok_and(|s| s.success())
  }

  fn init_repo(dir: &Path) {
    let git = |args: &[&str]| {
      let status = Command::new("git")
        .current_dir(dir)
        .args(["-c", "user.name=t", "-c", "user.email=t@example.com"])
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
      assert!(status.success(), "git {args:?} failed");
    };
    git(&["init", "--quiet", "-b", "main"]);
    std::fs::write(dir.join("README.md"), "hi\n").unwrap();
    git(&["add", "."]);
    git(&["commit", "--quiet", "-m", "init"]);
  }

  #[test]
  fn worktree_add_and_remove() {
    if !git_available() {
      eprintln!("Skipping: git not available");
      return;
    }
    let root = tempfile::tempdir().unwrap();
    let checkout = root.path().join("repo");
    std::fs::create_dir_all(&checkout).unwrap();
    init_repo(&checkout);

    let repo = open_checkout(&checkout).unwrap();
    assert!(!branch_exists(&repo, "work/calm-otter"));

    let wt = root.path().join("wts").join("calm-otter");
    add_worktree(&repo, &wt, "work/calm-otter", "main").unwrap();
    assert!(wt.join("README.md").exists());

    let repo = open_checkout(&checkout).unwrap();
    assert!(branch_exists(&repo, "work/calm-otter"));

    // Second add on an existing directory is a no-op
    add_worktree(&repo, &wt, "work/calm-otter", "main").unwrap();

    assert!(remove_worktree(&repo, &wt).unwrap());
    assert!(!wt.exists());
  }

  #[test]
  fn open_checkout_fails_outside_repo() {
    let dir = tempfile::tempdir().unwrap();
    let err = open_checkout(dir.path()).unwrap_err();
    assert!(format!("{err:#}").contains("failed to open git repository"));
  }
}
