//! Metadata resolver: builds a `<name>.<version>` bundle from a source archive.
//!
//! The manifest (with its `files/`) and the description are picked independently from the first
//! candidate that has them, in this order:
//!
//! 1. the pin overlay of the active switch,
//! 2. an existing `<output>/<name>.<version>` directory,
//! 3. the submission in the mirror: the pushed fork branch while it carries unmerged work, else
//!    the published `packages/<name>/<name>.<version>`,
//! 4. the metadata shipped inside the archive.
//!
//! Descriptions equal to the template (or empty) do not count, and the description alone falls
//! back to the highest published version of the package. The `url` file is always regenerated from
//! the archive that was just downloaded.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::archive::{self, Checksum, HashKind};
use crate::config::{EnvironmentContext, PublishConfig, DEFAULT_LABEL};
use crate::contract::{FetchOutcome, Fetcher, Git};
use crate::error::{PublishError, PublishResult};
use crate::mirror::MirrorManager;
use crate::opam_file::{descr_is_unspecified, OpamFile, UrlFile, DESCR_TEMPLATE};
use crate::package::{compare_versions, PackageId};
use crate::registry::{FORK_REMOTE, UPSTREAM_REMOTE};
use crate::validate::{DESCR_FILE, FILES_DIR, MANIFEST_FILE, URL_FILE};

#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub archive_url: String,
    pub name: Option<String>,
    pub version: Option<String>,
    /// Label whose mirror is searched for earlier submissions; `default` when unset.
    pub repo_label: Option<String>,
    /// Directory receiving `<name>.<version>`.
    pub output_dir: PathBuf,
}

/// What a prepare run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedBundle {
    pub package: PackageId,
    pub dir: PathBuf,
    pub checksum: Checksum,
    /// Candidate the manifest and `files/` came from.
    pub manifest_source: String,
    /// Candidate the description came from, `None` when the template was written.
    pub descr_source: Option<String>,
}

enum Origin {
    Dir(PathBuf),
    /// A bundle inside a git revision of the mirror; `entries` are relative to `path`.
    Revision {
        mirror: PathBuf,
        rev: String,
        path: String,
        entries: Vec<String>,
    },
}

struct Candidate {
    name: String,
    origin: Origin,
}

impl Candidate {
    fn dir(name: impl Into<String>, dir: PathBuf) -> Self {
        Candidate {
            name: name.into(),
            origin: Origin::Dir(dir),
        }
    }

    fn read<G: Git>(&self, git: &G, file: &str) -> PublishResult<Option<Vec<u8>>> {
        match &self.origin {
            Origin::Dir(dir) => {
                let path = dir.join(file);
                if !path.is_file() {
                    return Ok(None);
                }
                fs::read(&path)
                    .map(Some)
                    .map_err(|e| PublishError::io(format!("reading {}", path.display()), e))
            }
            Origin::Revision {
                mirror,
                rev,
                path,
                entries,
            } => {
                if !entries.iter().any(|entry| entry == file) {
                    return Ok(None);
                }
                let bytes = git.show_file(mirror, rev, &format!("{}/{}", path, file))?;
                Ok(Some(bytes))
            }
        }
    }

    /// Auxiliary files as (path relative to `files/`, content).
    fn aux_files<G: Git>(&self, git: &G) -> PublishResult<Vec<(PathBuf, Vec<u8>)>> {
        match &self.origin {
            Origin::Dir(dir) => {
                let root = dir.join(FILES_DIR);
                let mut files = Vec::new();
                for relative in list_tree(&root)? {
                    let path = root.join(&relative);
                    let bytes = fs::read(&path)
                        .map_err(|e| PublishError::io(format!("reading {}", path.display()), e))?;
                    files.push((relative, bytes));
                }
                Ok(files)
            }
            Origin::Revision {
                mirror,
                rev,
                path,
                entries,
            } => {
                let prefix = format!("{}/", FILES_DIR);
                let mut files = Vec::new();
                for entry in entries {
                    if let Some(relative) = entry.strip_prefix(&prefix) {
                        let bytes = git.show_file(mirror, rev, &format!("{}/{}", path, entry))?;
                        files.push((PathBuf::from(relative), bytes));
                    }
                }
                Ok(files)
            }
        }
    }
}

/// Regular files below `root`, relative to it and sorted. A missing root has no files.
pub fn list_tree(root: &Path) -> PublishResult<Vec<PathBuf>> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> PublishResult<()> {
        let entries = fs::read_dir(dir)
            .map_err(|e| PublishError::io(format!("listing {}", dir.display()), e))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| PublishError::io(format!("listing {}", dir.display()), e))?;
            let path = entry.path();
            if path.is_dir() {
                walk(root, &path, out)?;
            } else if let Ok(relative) = path.strip_prefix(root) {
                out.push(relative.to_path_buf());
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    if root.is_dir() {
        walk(root, root, &mut out)?;
    }
    out.sort();
    Ok(out)
}

/// The directory of an unpacked archive that holds its metadata.
///
/// A single top-level directory is descended into; inside it, an `opam/` directory holds the
/// metadata when present, otherwise the root itself does.
fn archive_metadata_dir(unpacked: &Path) -> PublishResult<PathBuf> {
    let entries: Vec<PathBuf> = fs::read_dir(unpacked)
        .map_err(|e| PublishError::io(format!("listing {}", unpacked.display()), e))?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .collect();
    let root = match entries.as_slice() {
        [single] if single.is_dir() => single.clone(),
        _ => unpacked.to_path_buf(),
    };
    let nested = root.join("opam");
    if nested.is_dir() {
        Ok(nested)
    } else {
        Ok(root)
    }
}

fn pick<'a>(explicit: Option<&'a str>, embedded: Option<&'a str>, what: &str) -> Option<&'a str> {
    match (explicit, embedded) {
        (Some(explicit), Some(embedded)) if explicit != embedded => {
            warn!(
                explicit,
                embedded, "Package {} differs from the archive's opam file, using {}", what, explicit
            );
            Some(explicit)
        }
        (Some(explicit), _) => Some(explicit),
        (None, embedded) => embedded,
    }
}

/// Highest published version of `name` in the mirror's working tree.
fn latest_published(mirror: &Path, name: &str) -> Option<PathBuf> {
    let dir = mirror.join("packages").join(name);
    let entries = fs::read_dir(&dir).ok()?;
    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let id = PackageId::parse(&entry.file_name().to_string_lossy()).ok()?;
            (id.name() == name).then(|| (id.version().to_string(), entry.path()))
        })
        .max_by(|(a, _), (b, _)| compare_versions(a, b))
        .map(|(_, path)| path)
}

/// Candidates from the mirror of `label`, synced first. Empty when the mirror does not exist.
fn mirror_candidates<G: Git>(
    config: &PublishConfig,
    git: &G,
    label: &str,
    package: &PackageId,
) -> PublishResult<(Vec<Candidate>, Option<PathBuf>)> {
    let manager = MirrorManager::new(config, git);
    if !manager.registry().exists(label) {
        warn!(label, "No mirror for this label, skipping published metadata");
        return Ok((Vec::new(), None));
    }
    let base = manager.sync(label)?;
    let mirror = config.mirror_dir(label);
    let path = package.repo_path();

    let branch = format!("{}/{}", FORK_REMOTE, package.branch_name());
    let upstream = format!("{}/{}", UPSTREAM_REMOTE, base);
    let pending = git.ref_exists(&mirror, &branch)? && {
        let merged = git.is_ancestor(&mirror, &branch, &upstream)?;
        if merged {
            debug!(branch = %branch, upstream = %upstream, "Fork branch already merged, ignoring it");
        }
        !merged
    };
    let candidate = if pending {
        let entries = git.list_files(&mirror, &branch, &path)?;
        debug!(branch = %branch, entries = entries.len(), "Found pushed submission");
        Candidate {
            name: format!("fork branch {}", branch),
            origin: Origin::Revision {
                mirror: mirror.clone(),
                rev: branch,
                path,
                entries,
            },
        }
    } else {
        Candidate::dir(format!("{} mirror", label), mirror.join(&path))
    };
    let latest = latest_published(&mirror, package.name());
    Ok((vec![candidate], latest))
}

fn write_file(path: &Path, contents: &[u8]) -> PublishResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| PublishError::io(format!("creating {}", parent.display()), e))?;
    }
    fs::write(path, contents).map_err(|e| PublishError::io(format!("writing {}", path.display()), e))
}

/// The manifest with `name:` and `version:` removed.
fn strip_identity(manifest: &str, package: &PackageId, source: &str) -> String {
    let file = match OpamFile::parse(manifest) {
        Ok(file) => file,
        Err(e) => {
            warn!(source, error = %e, "Manifest does not parse, copying it unchanged");
            return manifest.to_string();
        }
    };
    if let Some(name) = file.name() {
        if name != package.name() {
            warn!(source, found = name, expected = package.name(), "Stripping inconsistent name field");
        }
    }
    if let Some(version) = file.version() {
        if version != package.version() {
            warn!(source, found = version, expected = package.version(), "Stripping inconsistent version field");
        }
    }
    if file.has_field("name") || file.has_field("version") {
        file.without_fields(&["name", "version"])
    } else {
        manifest.to_string()
    }
}

/// Downloads the archive and writes the resolved bundle to `<output>/<name>.<version>`.
pub async fn prepare<X, G>(
    config: &PublishConfig,
    env: &EnvironmentContext,
    fetcher: &X,
    git: &G,
    request: &PrepareRequest,
) -> PublishResult<PreparedBundle>
where
    X: Fetcher,
    G: Git,
{
    let scratch =
        tempfile::tempdir().map_err(|e| PublishError::io("creating scratch directory", e))?;

    info!(url = %request.archive_url, "Downloading archive");
    let (archive, checksums) = match fetcher
        .fetch(vec![request.archive_url.clone()], &scratch.path().join("download"))
        .await
    {
        FetchOutcome::Fetched { path, checksums } => (path, checksums),
        FetchOutcome::NotAvailable { reason } => {
            error!(url = %request.archive_url, reason = %reason, "Archive download failed");
            return Err(PublishError::ArchiveUnavailable {
                url: request.archive_url.clone(),
                reason,
            });
        }
    };
    let checksum = match checksums.into_iter().find(|c| c.kind == HashKind::Sha256) {
        Some(checksum) => checksum,
        None => archive::file_checksum(&archive)?,
    };

    let unpacked = scratch.path().join("src");
    fetcher.extract(&archive, &unpacked)?;
    let archive_dir = archive_metadata_dir(&unpacked)?;

    let embedded = match fs::read_to_string(archive_dir.join(MANIFEST_FILE)) {
        Ok(text) => match OpamFile::parse(&text) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(error = %e, "Archive opam file does not parse, ignoring it");
                None
            }
        },
        Err(_) => None,
    };
    let name = pick(
        request.name.as_deref(),
        embedded.as_ref().and_then(OpamFile::name),
        "name",
    )
    .ok_or(PublishError::MissingName)?
    .to_string();
    let version = pick(
        request.version.as_deref(),
        embedded.as_ref().and_then(OpamFile::version),
        "version",
    )
    .ok_or(PublishError::MissingVersion)?
    .to_string();
    let package = PackageId::new(name, version)?;
    info!(package = %package, checksum = %checksum, "Resolving metadata");

    let target = request.output_dir.join(package.dir_name());
    let mut candidates = Vec::new();
    if let Some(overlay) = env.overlay_dir(package.name()) {
        if overlay.is_dir() {
            candidates.push(Candidate::dir("pin overlay", overlay));
        }
    }
    if target.is_dir() {
        candidates.push(Candidate::dir("working directory", target.clone()));
    }
    let label = request.repo_label.as_deref().unwrap_or(DEFAULT_LABEL);
    let (published, latest) = mirror_candidates(config, git, label, &package)?;
    candidates.extend(published);
    candidates.push(Candidate::dir("archive", archive_dir));

    let mut manifest = None;
    for candidate in &candidates {
        if let Some(bytes) = candidate.read(git, MANIFEST_FILE)? {
            manifest = Some((candidate, bytes));
            break;
        }
    }
    let Some((manifest_source, manifest)) = manifest else {
        error!(package = %package, "No opam file in any candidate");
        return Err(PublishError::NoManifest {
            package: package.to_string(),
        });
    };
    info!(source = %manifest_source.name, "Using opam file");

    let mut descr = None;
    for candidate in &candidates {
        if let Some(bytes) = candidate.read(git, DESCR_FILE)? {
            if !descr_is_unspecified(&String::from_utf8_lossy(&bytes)) {
                descr = Some((candidate.name.clone(), bytes));
                break;
            }
        }
    }
    if descr.is_none() {
        if let Some(dir) = latest {
            let fallback = Candidate::dir(format!("latest published {}", dir.display()), dir);
            if let Some(bytes) = fallback.read(git, DESCR_FILE)? {
                if !descr_is_unspecified(&String::from_utf8_lossy(&bytes)) {
                    descr = Some((fallback.name, bytes));
                }
            }
        }
    }
    match &descr {
        Some((source, _)) => info!(source = %source, "Using description"),
        None => warn!(package = %package, "No description found, writing the template"),
    }

    fs::create_dir_all(&request.output_dir).map_err(|e| {
        PublishError::io(format!("creating {}", request.output_dir.display()), e)
    })?;
    let staging_root = tempfile::tempdir_in(&request.output_dir)
        .map_err(|e| PublishError::io("creating staging directory", e))?;
    let staging = staging_root.path().join(package.dir_name());

    let manifest_text = String::from_utf8_lossy(&manifest);
    let stripped = strip_identity(&manifest_text, &package, &manifest_source.name);
    write_file(&staging.join(MANIFEST_FILE), stripped.as_bytes())?;
    for (relative, bytes) in manifest_source.aux_files(git)? {
        write_file(&staging.join(FILES_DIR).join(relative), &bytes)?;
    }
    let descr_source = match descr {
        Some((source, bytes)) => {
            write_file(&staging.join(DESCR_FILE), &bytes)?;
            Some(source)
        }
        None => {
            write_file(&staging.join(DESCR_FILE), DESCR_TEMPLATE.as_bytes())?;
            None
        }
    };
    let url = UrlFile {
        kind: "src".to_string(),
        address: request.archive_url.clone(),
        mirrors: Vec::new(),
        checksum: Some(checksum.to_string()),
    };
    write_file(&staging.join(URL_FILE), url.render().as_bytes())?;

    if target.exists() {
        fs::remove_dir_all(&target)
            .map_err(|e| PublishError::io(format!("removing {}", target.display()), e))?;
    }
    fs::rename(&staging, &target)
        .map_err(|e| PublishError::io(format!("moving bundle to {}", target.display()), e))?;
    info!(package = %package, path = %target.display(), "Bundle prepared");

    Ok(PreparedBundle {
        package,
        dir: target,
        checksum,
        manifest_source: manifest_source.name.clone(),
        descr_source,
    })
}
