use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::contract::RepoId;

/// Label that may bootstrap its own mirror on first use.
pub const DEFAULT_LABEL: &str = "default";

/// Note attached to access tokens created by this tool.
pub const DEFAULT_TOKEN_NOTE: &str = "opam-publish access token";

/// Runtime settings shared by every command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Holds `repos/<label>` mirrors and `tokens/<user>` files.
    pub root: PathBuf,
    pub forge: ForgeSettings,
    /// Repository the default label is bound to.
    pub default_repo: String,
    pub fork_poll: ForkPoll,
    pub token_note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeSettings {
    /// Host used in git remote urls (`git@<host>:owner/name`).
    pub host: String,
    pub api_url: String,
}

impl Default for ForgeSettings {
    fn default() -> Self {
        ForgeSettings {
            host: "github.com".to_string(),
            api_url: "https://api.github.com".to_string(),
        }
    }
}

/// How long to wait for a requested fork to appear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkPoll {
    pub interval_ms: u64,
    pub attempts: u32,
}

impl Default for ForkPoll {
    fn default() -> Self {
        ForkPoll {
            interval_ms: 1500,
            attempts: 20,
        }
    }
}

impl ForkPoll {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl PublishConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        PublishConfig {
            root: root.into(),
            forge: ForgeSettings::default(),
            default_repo: "ocaml/opam-repository".to_string(),
            fork_poll: ForkPoll::default(),
            token_note: DEFAULT_TOKEN_NOTE.to_string(),
        }
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.root.join("repos")
    }

    pub fn mirror_dir(&self, label: &str) -> PathBuf {
        self.repos_dir().join(label)
    }

    pub fn tokens_dir(&self) -> PathBuf {
        self.root.join("tokens")
    }

    pub fn default_repo_id(&self) -> Result<RepoId, String> {
        self.default_repo.parse()
    }

    /// Remote url for a repository on the configured forge.
    pub fn remote_url(&self, repo: &RepoId) -> String {
        format!("git@{}:{}/{}", self.forge.host, repo.owner, repo.name)
    }

    pub fn trace_loaded(&self) {
        info!(
            root = %self.root.display(),
            forge_host = %self.forge.host,
            default_repo = %self.default_repo,
            "Loaded PublishConfig"
        );
        debug!(?self, "PublishConfig loaded (full debug)");
    }
}

/// Where the pin overlay of the active opam switch lives, threaded explicitly into prepare.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentContext {
    /// `<opam root>/<switch>/overlay`, when a switch is active.
    pub overlay_root: Option<PathBuf>,
}

impl EnvironmentContext {
    pub fn none() -> Self {
        EnvironmentContext::default()
    }

    pub fn with_overlay_root(root: impl AsRef<Path>) -> Self {
        EnvironmentContext {
            overlay_root: Some(root.as_ref().to_path_buf()),
        }
    }

    pub fn overlay_dir(&self, package_name: &str) -> Option<PathBuf> {
        self.overlay_root.as_ref().map(|r| r.join(package_name))
    }
}
