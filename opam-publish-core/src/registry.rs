//! Repository registry: labels, and the identities derived from their mirrors.
//!
//! Nothing is stored besides the mirrors themselves. A label exists when `repos/<label>` does;
//! its repository is read back from the `origin` remote url and its forge user from the `user`
//! remote url. Editing those remotes by hand edits the registry.

use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{error, info};

use crate::config::PublishConfig;
use crate::contract::{Git, RepoId};
use crate::error::{PublishError, PublishResult};

/// Remote pointing at the upstream repository.
pub const UPSTREAM_REMOTE: &str = "origin";
/// Remote pointing at the operator's fork.
pub const FORK_REMOTE: &str = "user";

/// Lifecycle of a label's mirror. `Synced` is transient and not observable on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorState {
    Unregistered,
    Cloned,
    Forked,
}

/// What the registry knows about one label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorInfo {
    pub label: String,
    pub repo: RepoId,
    pub user: Option<String>,
    pub dir: PathBuf,
}

fn scp_like() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:[A-Za-z0-9._-]+@)?([A-Za-z0-9.-]+):([^/\s]+)/([^/\s]+?)(?:\.git)?/?$")
            .expect("valid regex")
    })
}

fn url_like() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:https?|git|ssh)://(?:[^@/\s]+@)?([A-Za-z0-9.-]+)(?::\d+)?/([^/\s]+)/([^/\s]+?)(?:\.git)?/?$",
        )
        .expect("valid regex")
    })
}

/// Splits a remote url of the form `host:owner/name` (or `https://host/owner/name`) into the host
/// and the repository coordinates.
pub fn parse_remote_url(url: &str) -> Option<(String, RepoId)> {
    let url = url.trim();
    url_like()
        .captures(url)
        .or_else(|| scp_like().captures(url))
        .map(|caps| (caps[1].to_string(), RepoId::new(&caps[2], &caps[3])))
}

/// Read-only view over the mirrors under the configured root.
pub struct Registry<'a, G: Git> {
    config: &'a PublishConfig,
    git: &'a G,
}

impl<'a, G: Git> Registry<'a, G> {
    pub fn new(config: &'a PublishConfig, git: &'a G) -> Self {
        Registry { config, git }
    }

    pub fn mirror_dir(&self, label: &str) -> PathBuf {
        self.config.mirror_dir(label)
    }

    pub fn exists(&self, label: &str) -> bool {
        self.mirror_dir(label).is_dir()
    }

    pub fn state(&self, label: &str) -> PublishResult<MirrorState> {
        if !self.exists(label) {
            return Ok(MirrorState::Unregistered);
        }
        match self.user(label)? {
            Some(_) => Ok(MirrorState::Forked),
            None => Ok(MirrorState::Cloned),
        }
    }

    /// Registered labels, sorted.
    pub fn labels(&self) -> PublishResult<Vec<String>> {
        let dir = self.config.repos_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&dir)
            .map_err(|e| PublishError::io(format!("listing {}", dir.display()), e))?;
        let mut labels = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| PublishError::io(format!("listing {}", dir.display()), e))?;
            if entry.path().is_dir() {
                labels.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        labels.sort();
        Ok(labels)
    }

    /// Upstream repository of a label, parsed from its `origin` remote.
    pub fn identity(&self, label: &str) -> PublishResult<RepoId> {
        if !self.exists(label) {
            return Err(PublishError::UnknownLabel {
                label: label.to_string(),
            });
        }
        let url = self
            .git
            .remote_url(&self.mirror_dir(label), UPSTREAM_REMOTE)?
            .ok_or_else(|| PublishError::RemoteUrl {
                url: format!("<no {} remote in {}>", UPSTREAM_REMOTE, label),
            })?;
        parse_remote_url(&url)
            .map(|(_, repo)| repo)
            .ok_or(PublishError::RemoteUrl { url })
    }

    /// Forge user recorded by the `user` remote, if the mirror has been forked.
    pub fn user(&self, label: &str) -> PublishResult<Option<String>> {
        let Some(url) = self.git.remote_url(&self.mirror_dir(label), FORK_REMOTE)? else {
            return Ok(None);
        };
        match parse_remote_url(&url) {
            Some((_, fork)) => Ok(Some(fork.owner)),
            None => Err(PublishError::RemoteUrl { url }),
        }
    }

    pub fn describe(&self, label: &str) -> PublishResult<MirrorInfo> {
        Ok(MirrorInfo {
            label: label.to_string(),
            repo: self.identity(label)?,
            user: self.user(label)?,
            dir: self.mirror_dir(label),
        })
    }

    pub fn list(&self) -> PublishResult<Vec<MirrorInfo>> {
        self.labels()?
            .iter()
            .map(|label| self.describe(label))
            .collect()
    }

    /// Fails when the label is bound to other coordinates than `requested`.
    pub fn check_repo(&self, label: &str, requested: &RepoId) -> PublishResult<()> {
        let existing = self.identity(label)?;
        if &existing != requested {
            error!(label, existing = %existing, requested = %requested, "Refusing to rebind label");
            return Err(PublishError::LabelRebind {
                label: label.to_string(),
                existing: existing.to_string(),
                requested: requested.to_string(),
            });
        }
        Ok(())
    }

    /// The user recorded for the label; fails when it contradicts `requested`.
    pub fn check_user(&self, label: &str, requested: Option<&str>) -> PublishResult<Option<String>> {
        let recorded = self.user(label)?;
        match (&recorded, requested) {
            (Some(recorded), Some(requested)) if recorded != requested => {
                error!(label, recorded = %recorded, requested, "Forge user contradicts mirror");
                Err(PublishError::UserMismatch {
                    label: label.to_string(),
                    recorded: recorded.clone(),
                    requested: requested.to_string(),
                })
            }
            _ => Ok(recorded),
        }
    }

    /// Deletes a label's mirror.
    pub fn remove(&self, label: &str) -> PublishResult<()> {
        let dir = self.mirror_dir(label);
        if !dir.is_dir() {
            return Err(PublishError::UnknownLabel {
                label: label.to_string(),
            });
        }
        fs::remove_dir_all(&dir)
            .map_err(|e| PublishError::io(format!("removing {}", dir.display()), e))?;
        info!(label, path = %dir.display(), "Removed mirror");
        Ok(())
    }
}
