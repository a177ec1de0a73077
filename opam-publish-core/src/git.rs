//! [`Git`] implementation that shells out to the `git` binary.

use std::path::Path;
use std::process::{Command, Output};

use tracing::{debug, error, info};

use crate::contract::{Git, GitError};

/// Runs `git` as an external command; a non-zero exit is a [`GitError::Failed`].
#[derive(Debug, Default, Clone)]
pub struct CommandGit;

impl CommandGit {
    pub fn new() -> Self {
        CommandGit
    }

    fn output(&self, dir: Option<&Path>, args: &[&str]) -> Result<Output, GitError> {
        let mut command = Command::new("git");
        if let Some(dir) = dir {
            command.arg("-C").arg(dir);
        }
        command.args(args);
        let rendered = args.join(" ");
        match command.output() {
            Ok(out) => Ok(out),
            Err(e) => {
                error!(error = ?e, command = %rendered, "Failed to launch git process");
                Err(GitError::Launch {
                    command: rendered,
                    source: e,
                })
            }
        }
    }

    fn run(&self, dir: Option<&Path>, args: &[&str]) -> Result<Output, GitError> {
        let out = self.output(dir, args)?;
        let rendered = args.join(" ");
        if out.status.success() {
            debug!(command = %rendered, "git command succeeded");
            Ok(out)
        } else {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            error!(
                command = %rendered,
                status = %out.status,
                stderr = %stderr,
                "Git exited with non-zero code"
            );
            Err(GitError::Failed {
                command: rendered,
                status: out.status.to_string(),
                stderr,
            })
        }
    }

    fn stdout(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        let out = self.run(Some(dir), args)?;
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

impl Git for CommandGit {
    fn clone_repo(&self, url: &str, dir: &Path) -> Result<(), GitError> {
        let dir_arg = dir.to_string_lossy();
        self.run(None, &["clone", url, dir_arg.as_ref()])?;
        info!(url, path = %dir.display(), "Successfully cloned git repository");
        Ok(())
    }

    fn remote_add(&self, dir: &Path, name: &str, url: &str) -> Result<(), GitError> {
        self.run(Some(dir), &["remote", "add", name, url])?;
        info!(remote = name, url, "Added git remote");
        Ok(())
    }

    fn remote_url(&self, dir: &Path, name: &str) -> Result<Option<String>, GitError> {
        let key = format!("remote.{}.url", name);
        let out = self.output(Some(dir), &["config", "--get", key.as_str()])?;
        // `git config --get` exits with 1 when the key is unset.
        match out.status.code() {
            Some(0) => Ok(Some(
                String::from_utf8_lossy(&out.stdout).trim().to_string(),
            )),
            Some(1) => Ok(None),
            _ => Err(GitError::Failed {
                command: format!("config --get {}", key),
                status: out.status.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            }),
        }
    }

    fn fetch(&self, dir: &Path, remotes: &[String]) -> Result<(), GitError> {
        let mut args = vec!["fetch", "--multiple"];
        args.extend(remotes.iter().map(String::as_str));
        self.run(Some(dir), &args)?;
        info!(remotes = ?remotes, path = %dir.display(), "Fetched remotes");
        Ok(())
    }

    fn default_branch(&self, dir: &Path, remote: &str) -> Result<String, GitError> {
        let head = format!("refs/remotes/{}/HEAD", remote);
        let out = self.output(Some(dir), &["symbolic-ref", "--short", head.as_str()])?;
        if out.status.success() {
            let target = String::from_utf8_lossy(&out.stdout).trim().to_string();
            let prefix = format!("{}/", remote);
            return Ok(target
                .strip_prefix(prefix.as_str())
                .unwrap_or(&target)
                .to_string());
        }
        debug!(remote, "Remote HEAD unset, assuming master");
        Ok("master".to_string())
    }

    fn reset_hard(&self, dir: &Path, rev: &str) -> Result<(), GitError> {
        self.run(Some(dir), &["reset", "--hard", rev])?;
        info!(rev, path = %dir.display(), "Reset working tree");
        Ok(())
    }

    fn remove(&self, dir: &Path, path: &str) -> Result<(), GitError> {
        self.run(Some(dir), &["rm", "-r", "-q", "--ignore-unmatch", "--", path])?;
        Ok(())
    }

    fn add(&self, dir: &Path, path: &str) -> Result<(), GitError> {
        self.run(Some(dir), &["add", "--", path])?;
        Ok(())
    }

    fn has_staged_changes(&self, dir: &Path) -> Result<bool, GitError> {
        let out = self.output(Some(dir), &["diff", "--cached", "--quiet"])?;
        match out.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(GitError::Failed {
                command: "diff --cached --quiet".to_string(),
                status: out.status.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            }),
        }
    }

    fn commit(&self, dir: &Path, message: &str) -> Result<(), GitError> {
        self.run(Some(dir), &["commit", "-q", "-m", message])?;
        info!(message, "Committed");
        Ok(())
    }

    fn push(&self, dir: &Path, remote: &str, branch: &str, force: bool) -> Result<(), GitError> {
        let refspec = format!("HEAD:refs/heads/{}", branch);
        let mut args = vec!["push"];
        if force {
            args.push("--force");
        }
        args.push(remote);
        args.push(refspec.as_str());
        self.run(Some(dir), &args)?;
        info!(remote, branch, force, "Pushed branch");
        Ok(())
    }

    fn ref_exists(&self, dir: &Path, rev: &str) -> Result<bool, GitError> {
        let commit = format!("{}^{{commit}}", rev);
        let out = self.output(Some(dir), &["rev-parse", "--verify", "--quiet", commit.as_str()])?;
        Ok(out.status.success())
    }

    fn is_ancestor(&self, dir: &Path, ancestor: &str, descendant: &str) -> Result<bool, GitError> {
        let out = self.output(Some(dir), &["merge-base", "--is-ancestor", ancestor, descendant])?;
        // Exit 1 means "not an ancestor"; anything else non-zero is a real failure.
        match out.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(GitError::Failed {
                command: format!("merge-base --is-ancestor {} {}", ancestor, descendant),
                status: out.status.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            }),
        }
    }

    fn list_files(&self, dir: &Path, rev: &str, path: &str) -> Result<Vec<String>, GitError> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let listing = self.stdout(
            dir,
            &["ls-tree", "-r", "--name-only", rev, "--", prefix.as_str()],
        )?;
        Ok(listing
            .lines()
            .filter_map(|line| line.strip_prefix(prefix.as_str()))
            .map(str::to_string)
            .collect())
    }

    fn show_file(&self, dir: &Path, rev: &str, path: &str) -> Result<Vec<u8>, GitError> {
        let object = format!("{}:{}", rev, path);
        let out = self.run(Some(dir), &["show", object.as_str()])?;
        Ok(out.stdout)
    }
}
