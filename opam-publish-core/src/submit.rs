//! Publish pipeline: validate, sync the mirror, commit the bundle, push it to the fork and open or
//! update the pull request.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::config::{PublishConfig, DEFAULT_LABEL};
use crate::contract::{Fetcher, Forge, Git, NewPullRequest, Operator, RepoId};
use crate::error::{PublishError, PublishResult};
use crate::mirror::MirrorManager;
use crate::opam_file::{Descr, OpamFile};
use crate::package::PackageId;
use crate::prepare::list_tree;
use crate::registry::{MirrorState, FORK_REMOTE};
use crate::token::{acquire_token, TokenStore};
use crate::validate::{validate_bundle, DESCR_FILE, MANIFEST_FILE};

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub label: String,
    pub user: Option<String>,
    pub bundle_dir: PathBuf,
    /// Taken from the bundle directory name when unset.
    pub package: Option<PackageId>,
    /// Offer to continue when validation fails.
    pub force: bool,
}

impl SubmitRequest {
    pub fn new(bundle_dir: impl Into<PathBuf>) -> Self {
        SubmitRequest {
            label: DEFAULT_LABEL.to_string(),
            user: None,
            bundle_dir: bundle_dir.into(),
            package: None,
            force: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReport {
    pub package: PackageId,
    pub number: u64,
    pub url: String,
    /// False when an open pull request was updated.
    pub created: bool,
    pub branch: String,
}

/// Repository, user and token a submission runs with.
struct Target {
    repo: RepoId,
    user: String,
    token: String,
}

fn package_of(request: &SubmitRequest) -> PublishResult<PackageId> {
    if let Some(package) = &request.package {
        return Ok(package.clone());
    }
    let dir = request
        .bundle_dir
        .canonicalize()
        .unwrap_or_else(|_| request.bundle_dir.clone());
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    PackageId::parse(&name)
}

fn user_or_ask<O: Operator>(requested: Option<&str>, operator: &O) -> PublishResult<String> {
    match requested {
        Some(user) => Ok(user.to_string()),
        None => operator.ask_user("Forge user name"),
    }
}

async fn resolve_target<G, F, O>(
    config: &PublishConfig,
    manager: &MirrorManager<'_, G>,
    forge: &F,
    operator: &O,
    request: &SubmitRequest,
) -> PublishResult<Target>
where
    G: Git,
    F: Forge,
    O: Operator,
{
    let label = request.label.as_str();
    let registry = manager.registry();
    let store = TokenStore::new(config.tokens_dir());

    match registry.state(label)? {
        MirrorState::Unregistered if label == DEFAULT_LABEL => {
            let repo = config
                .default_repo_id()
                .map_err(|reason| PublishError::InvalidRepo {
                    input: config.default_repo.clone(),
                    reason,
                })?;
            info!(label, repo = %repo, "Bootstrapping default repository");
            let user = user_or_ask(request.user.as_deref(), operator)?;
            let token = acquire_token(&store, forge, operator, &user, &config.token_note).await?;
            manager.register(label, &repo, &user, forge, &token).await?;
            Ok(Target { repo, user, token })
        }
        MirrorState::Unregistered => {
            error!(label, "Unknown repository label");
            Err(PublishError::UnknownLabel {
                label: label.to_string(),
            })
        }
        MirrorState::Cloned => {
            let repo = registry.identity(label)?;
            warn!(label, "Mirror has no fork yet, completing registration");
            let user = user_or_ask(request.user.as_deref(), operator)?;
            let token = acquire_token(&store, forge, operator, &user, &config.token_note).await?;
            manager.fork(label, &repo, &user, forge, &token).await?;
            Ok(Target { repo, user, token })
        }
        MirrorState::Forked => {
            let repo = registry.identity(label)?;
            let user = match registry.check_user(label, request.user.as_deref())? {
                Some(user) => user,
                None => user_or_ask(request.user.as_deref(), operator)?,
            };
            let token = acquire_token(&store, forge, operator, &user, &config.token_note).await?;
            Ok(Target { repo, user, token })
        }
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> PublishResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| PublishError::io(format!("setting permissions of {}", path.display()), e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> PublishResult<()> {
    Ok(())
}

/// Copies the bundle into `dest`: files 0644, directories 0755.
fn copy_bundle(bundle: &Path, dest: &Path) -> PublishResult<()> {
    fs::create_dir_all(dest)
        .map_err(|e| PublishError::io(format!("creating {}", dest.display()), e))?;
    set_mode(dest, 0o755)?;
    for relative in list_tree(bundle)? {
        let to = dest.join(&relative);
        if let Some(parent) = to.parent() {
            if !parent.is_dir() {
                fs::create_dir_all(parent)
                    .map_err(|e| PublishError::io(format!("creating {}", parent.display()), e))?;
                set_mode(parent, 0o755)?;
            }
        }
        fs::copy(bundle.join(&relative), &to)
            .map_err(|e| PublishError::io(format!("copying {}", relative.display()), e))?;
        set_mode(&to, 0o644)?;
    }
    Ok(())
}

/// Pull request body: the package links followed by its description.
pub fn pull_request_body(bundle: &Path, package: &PackageId) -> String {
    let manifest = fs::read_to_string(bundle.join(MANIFEST_FILE))
        .ok()
        .and_then(|text| OpamFile::parse(&text).ok());
    let descr = fs::read_to_string(bundle.join(DESCR_FILE))
        .map(|text| Descr::parse(&text))
        .ok();

    let mut body = format!("### `{}`\n\n", package);
    if let Some(descr) = descr {
        body.push_str(&descr.full_text());
        body.push_str("\n\n");
    }
    if let Some(manifest) = manifest {
        let links = [
            ("Homepage", manifest.homepage()),
            ("Source repo", manifest.dev_repo()),
            ("Bug tracker", manifest.bug_reports()),
        ];
        let links: Vec<String> = links
            .iter()
            .filter_map(|(label, value)| value.map(|v| format!("* {}: {}", label, v)))
            .collect();
        if !links.is_empty() {
            body.push_str("---\n");
            body.push_str(&links.join("\n"));
            body.push('\n');
        }
    }
    body.push_str("\n:camel: Pull-request generated by opam-publish\n");
    body
}

/// Publishes a prepared bundle and returns the pull request it ended up in.
pub async fn submit<G, F, X, O>(
    config: &PublishConfig,
    git: &G,
    forge: &F,
    fetcher: &X,
    operator: &O,
    request: &SubmitRequest,
) -> PublishResult<SubmitReport>
where
    G: Git,
    F: Forge,
    X: Fetcher,
    O: Operator,
{
    let package = package_of(request)?;
    info!(package = %package, label = %request.label, "Submitting");

    let report = validate_bundle(&request.bundle_dir, fetcher).await;
    if !report.passed() {
        if !request.force {
            error!(package = %package, "Bundle failed validation");
            return Err(PublishError::ValidationFailed { report });
        }
        warn!(package = %package, "Bundle failed validation, asking before continuing");
        if !operator.confirm(&format!("{}\nSubmit {} anyway?", report, package))? {
            return Err(PublishError::Aborted);
        }
    }

    let manager = MirrorManager::new(config, git);
    let target = resolve_target(config, &manager, forge, operator, request).await?;
    let base = manager.sync(&request.label)?;

    let mirror = config.mirror_dir(&request.label);
    let path = package.repo_path();
    let branch = package.branch_name();
    git.remove(&mirror, &path)?;
    let dest = mirror.join(&path);
    if dest.exists() {
        fs::remove_dir_all(&dest)
            .map_err(|e| PublishError::io(format!("removing {}", dest.display()), e))?;
    }
    copy_bundle(&request.bundle_dir, &dest)?;
    git.add(&mirror, &path)?;
    if !git.has_staged_changes(&mirror)? {
        error!(package = %package, label = %request.label, "Bundle is identical to the published one");
        return Err(PublishError::AlreadyPublished {
            package: package.to_string(),
            label: request.label.clone(),
        });
    }
    git.commit(&mirror, &format!("{} - via opam-publish", package))?;
    git.push(&mirror, FORK_REMOTE, &branch, true)?;
    info!(package = %package, branch = %branch, "Pushed submission to fork");

    let title = package.to_string();
    let body = pull_request_body(&request.bundle_dir, &package);
    let existing = forge
        .find_open_pull_request(&target.token, &target.repo, &target.user, &branch)
        .await?;
    let (pull_request, created) = match existing {
        Some(open) => {
            let updated = forge
                .update_pull_request(&target.token, &target.repo, open.number, &title, &body)
                .await
                .map_err(|e| {
                    error!(error = %e, number = open.number, "Updating pull request failed");
                    e
                })?;
            info!(number = updated.number, url = %updated.html_url, "Pull request updated");
            (updated, false)
        }
        None => {
            let request = NewPullRequest {
                title,
                body,
                head: format!("{}:{}", target.user, branch),
                base,
            };
            let created = forge
                .create_pull_request(&target.token, &target.repo, request)
                .await
                .map_err(|e| {
                    error!(error = %e, repo = %target.repo, "Creating pull request failed");
                    e
                })?;
            info!(number = created.number, url = %created.html_url, "Pull request created");
            (created, true)
        }
    };

    operator.open_url(&pull_request.html_url);
    Ok(SubmitReport {
        package,
        number: pull_request.number,
        url: pull_request.html_url,
        created,
        branch,
    })
}
