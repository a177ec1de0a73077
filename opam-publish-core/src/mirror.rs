//! Mirror manager: moves a label through Unregistered → Cloned → Forked, and resynchronises it
//! (Synced) before every use.

use std::fs;

use tracing::{error, info, warn};

use crate::config::{ForkPoll, PublishConfig};
use crate::contract::{Forge, Git, RepoId};
use crate::error::{PublishError, PublishResult};
use crate::registry::{MirrorInfo, MirrorState, Registry, FORK_REMOTE, UPSTREAM_REMOTE};

pub struct MirrorManager<'a, G: Git> {
    config: &'a PublishConfig,
    git: &'a G,
}

impl<'a, G: Git> MirrorManager<'a, G> {
    pub fn new(config: &'a PublishConfig, git: &'a G) -> Self {
        MirrorManager { config, git }
    }

    pub fn registry(&self) -> Registry<'a, G> {
        Registry::new(self.config, self.git)
    }

    /// Unregistered → Cloned.
    pub fn clone_mirror(&self, label: &str, repo: &RepoId) -> PublishResult<()> {
        let dir = self.config.mirror_dir(label);
        let parent = self.config.repos_dir();
        fs::create_dir_all(&parent)
            .map_err(|e| PublishError::io(format!("creating {}", parent.display()), e))?;
        let url = self.config.remote_url(repo);
        info!(label, repo = %repo, path = %dir.display(), "Cloning mirror");
        if let Err(e) = self.git.clone_repo(&url, &dir) {
            error!(error = %e, label, "Clone failed, removing partial mirror");
            if dir.exists() {
                let _ = fs::remove_dir_all(&dir);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Cloned → Forked: requests the fork, waits for it and records it as the `user` remote.
    pub async fn fork<F: Forge>(
        &self,
        label: &str,
        repo: &RepoId,
        user: &str,
        forge: &F,
        token: &str,
    ) -> PublishResult<()> {
        info!(label, repo = %repo, user, "Forking repository");
        forge.create_fork(token, repo).await.map_err(|e| {
            error!(error = %e, repo = %repo, "Fork request failed");
            e
        })?;
        let fork = RepoId::new(user, &repo.name);
        wait_for_fork(forge, token, &fork, &self.config.fork_poll).await?;
        self.git.remote_add(
            &self.config.mirror_dir(label),
            FORK_REMOTE,
            &self.config.remote_url(&fork),
        )?;
        info!(label, fork = %fork, "Mirror forked");
        Ok(())
    }

    /// Brings a label to Forked, creating whatever is missing.
    ///
    /// Fails instead of rebinding when the label already exists with other coordinates or
    /// another user.
    pub async fn register<F: Forge>(
        &self,
        label: &str,
        repo: &RepoId,
        user: &str,
        forge: &F,
        token: &str,
    ) -> PublishResult<MirrorInfo> {
        let registry = self.registry();
        let state = registry.state(label)?;
        if state != MirrorState::Unregistered {
            registry.check_repo(label, repo)?;
            registry.check_user(label, Some(user))?;
        }
        if state == MirrorState::Unregistered {
            self.clone_mirror(label, repo)?;
        }
        if state != MirrorState::Forked {
            self.fork(label, repo, user, forge, token).await?;
        } else {
            info!(label, "Mirror already registered");
        }
        registry.describe(label)
    }

    /// Fetches both remotes and hard-resets to the upstream default branch, discarding any local
    /// state. Returns the default branch name.
    pub fn sync(&self, label: &str) -> PublishResult<String> {
        let registry = self.registry();
        if !registry.exists(label) {
            return Err(PublishError::UnknownLabel {
                label: label.to_string(),
            });
        }
        let dir = self.config.mirror_dir(label);
        let mut remotes = vec![UPSTREAM_REMOTE.to_string()];
        if registry.user(label)?.is_some() {
            remotes.push(FORK_REMOTE.to_string());
        }
        self.git.fetch(&dir, &remotes)?;
        let branch = self.git.default_branch(&dir, UPSTREAM_REMOTE)?;
        self.git
            .reset_hard(&dir, &format!("{}/{}", UPSTREAM_REMOTE, branch))?;
        info!(label, branch = %branch, "Mirror synced to upstream");
        Ok(branch)
    }
}

/// Polls until `fork` exists on the forge, at most `poll.attempts` times.
pub async fn wait_for_fork<F: Forge>(
    forge: &F,
    token: &str,
    fork: &RepoId,
    poll: &ForkPoll,
) -> PublishResult<()> {
    for attempt in 1..=poll.attempts {
        match forge.repo_exists(token, fork).await {
            Ok(true) => {
                info!(fork = %fork, attempt, "Fork is available");
                return Ok(());
            }
            Ok(false) => {
                info!(fork = %fork, attempt, "Waiting for fork to become available");
            }
            Err(e) => {
                warn!(error = %e, fork = %fork, attempt, "Fork availability check failed");
            }
        }
        if attempt < poll.attempts {
            tokio::time::sleep(poll.interval()).await;
        }
    }
    error!(fork = %fork, attempts = poll.attempts, "Fork did not appear in time");
    Err(PublishError::ForkTimeout {
        fork: fork.to_string(),
        attempts: poll.attempts,
    })
}
