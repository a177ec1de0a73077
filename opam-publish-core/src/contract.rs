//! # contract: boundaries to the outside world
//!
//! The prepare and submit workflows only make decisions; every side effect beyond the local
//! filesystem goes through one of the traits below:
//!
//! - [`Git`]: primitive version-control commands run against a mirror directory.
//! - [`Forge`]: the forge's REST API (tokens, forks, pull requests).
//! - [`Fetcher`]: archive download and extraction.
//! - [`Operator`]: the person at the terminal (prompts, confirmations, browser).
//!
//! ## Mocking & Testing
//! - Every trait is annotated for `mockall`; the generated `MockGit`, `MockForge`, `MockFetcher`
//!   and `MockOperator` are exported through the default `test-export-mocks` feature so
//!   integration tests can drive the workflows without network, git or a terminal.
//!
//! ## Errors
//! - Forge failures come in two shapes, see [`ForgeError`]: the forge refused the request and
//!   said why, or something unexpected happened on the way.
//! - Git failures carry the command line and the captured stderr.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::archive::Checksum;
use crate::error::PublishError;

/// Coordinates of a repository on the forge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoId {
    pub owner: String,
    pub name: String,
}

impl RepoId {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        RepoId {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepoId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((owner, name))
                if !owner.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(RepoId::new(owner, name.trim_end_matches(".git")))
            }
            _ => Err(format!("expected <owner>/<name>, got {:?}", s)),
        }
    }
}

/// An access token as listed by the forge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub note: Option<String>,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: u64,
    pub html_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPullRequest {
    pub title: String,
    pub body: String,
    /// `<user>:<branch>`
    pub head: String,
    pub base: String,
}

/// Failure reported by a [`Forge`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForgeError {
    /// The forge answered and refused the request.
    #[error("forge error: {message}")]
    Reported { message: String },
    /// Transport, decoding or any other fault.
    #[error("unexpected forge failure: {0}")]
    Unexpected(String),
}

/// Failure of a git command.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("failed to launch `git {command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`git {command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
}

/// Primitive version-control operations on a local checkout.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait Git: Send + Sync {
    /// Clones `url` into `dir`; the source becomes remote `origin`.
    fn clone_repo(&self, url: &str, dir: &Path) -> Result<(), GitError>;

    fn remote_add(&self, dir: &Path, name: &str, url: &str) -> Result<(), GitError>;

    /// Configured URL of a remote, `None` when the remote does not exist.
    fn remote_url(&self, dir: &Path, name: &str) -> Result<Option<String>, GitError>;

    fn fetch(&self, dir: &Path, remotes: &[String]) -> Result<(), GitError>;

    /// Branch the remote's HEAD points at.
    fn default_branch(&self, dir: &Path, remote: &str) -> Result<String, GitError>;

    fn reset_hard(&self, dir: &Path, rev: &str) -> Result<(), GitError>;

    /// Removes a path from the index and working tree; a missing path is not an error.
    fn remove(&self, dir: &Path, path: &str) -> Result<(), GitError>;

    fn add(&self, dir: &Path, path: &str) -> Result<(), GitError>;

    /// Whether the index differs from `HEAD`.
    fn has_staged_changes(&self, dir: &Path) -> Result<bool, GitError>;

    fn commit(&self, dir: &Path, message: &str) -> Result<(), GitError>;

    fn push(&self, dir: &Path, remote: &str, branch: &str, force: bool) -> Result<(), GitError>;

    fn ref_exists(&self, dir: &Path, rev: &str) -> Result<bool, GitError>;

    /// Whether `ancestor` is reachable from `descendant`.
    fn is_ancestor(&self, dir: &Path, ancestor: &str, descendant: &str) -> Result<bool, GitError>;

    /// Files under `path` at `rev`, relative to `path`.
    fn list_files(&self, dir: &Path, rev: &str, path: &str) -> Result<Vec<String>, GitError>;

    fn show_file(&self, dir: &Path, rev: &str, path: &str) -> Result<Vec<u8>, GitError>;
}

/// Operations on the forge's REST API used by the publish workflow.
///
/// Token management authenticates with the user's password; everything else uses the access
/// token obtained from it.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Forge: Send + Sync {
    async fn list_tokens(&self, user: &str, password: &str)
        -> Result<Vec<TokenRecord>, ForgeError>;

    async fn create_token(
        &self,
        user: &str,
        password: &str,
        note: &str,
    ) -> Result<String, ForgeError>;

    /// Asks for a fork of `repo` under the token's user. Forking an existing fork succeeds.
    async fn create_fork(&self, token: &str, repo: &RepoId) -> Result<(), ForgeError>;

    async fn repo_exists(&self, token: &str, repo: &RepoId) -> Result<bool, ForgeError>;

    /// The open pull request against `repo` whose head is `<user>:<branch>`, if any.
    async fn find_open_pull_request(
        &self,
        token: &str,
        repo: &RepoId,
        user: &str,
        branch: &str,
    ) -> Result<Option<PullRequest>, ForgeError>;

    async fn create_pull_request(
        &self,
        token: &str,
        repo: &RepoId,
        request: NewPullRequest,
    ) -> Result<PullRequest, ForgeError>;

    async fn update_pull_request(
        &self,
        token: &str,
        repo: &RepoId,
        number: u64,
        title: &str,
        body: &str,
    ) -> Result<PullRequest, ForgeError>;
}

/// Result of trying to download an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched {
        path: PathBuf,
        checksums: Vec<Checksum>,
    },
    NotAvailable {
        reason: String,
    },
}

/// Archive download and extraction.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Tries each url in turn and stores the first successful download under `dest`.
    async fn fetch(&self, urls: Vec<String>, dest: &Path) -> FetchOutcome;

    /// Unpacks `archive` into `dest`.
    fn extract(&self, archive: &Path, dest: &Path) -> Result<(), PublishError>;
}

/// The person running the tool.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait Operator: Send + Sync {
    fn ask_user(&self, prompt: &str) -> Result<String, PublishError>;

    /// Reads a secret without echoing it.
    fn ask_password(&self, prompt: &str) -> Result<String, PublishError>;

    fn confirm(&self, prompt: &str) -> Result<bool, PublishError>;

    /// Best effort: failures are ignored.
    fn open_url(&self, url: &str);
}
