/// # opam-publish CLI Interface (Module)
///
/// Command parsing and orchestration for the `opam-publish` binary. Every decision lives in
/// [`opam-publish-core`]; this module wires the concrete collaborators (git command, HTTP fetcher,
/// GitHub client, terminal) into the core workflows and prints their outcome.
///
/// ## Commands
/// - `prepare <archive-url>`: build a `<name>.<version>` bundle in the current directory.
/// - `submit <dir>`: validate a bundle and publish it as a pull request.
/// - `check <dir>`: only validate a bundle.
/// - `repo add|remove|list`: manage repository labels and their mirrors.
///
/// For programmatic or integration use, call [`run`] with a constructed [`Cli`].
///
/// [`opam-publish-core`]: ../../opam-publish-core/
use crate::github::GitHubClient;
use crate::load_config::{environment_context, load_config};
use crate::terminal::TerminalOperator;
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use opam_publish_core::archive::HttpFetcher;
use opam_publish_core::config::{PublishConfig, DEFAULT_LABEL};
use opam_publish_core::contract::RepoId;
use opam_publish_core::error::PublishError;
use opam_publish_core::git::CommandGit;
use opam_publish_core::mirror::MirrorManager;
use opam_publish_core::package::PackageId;
use opam_publish_core::prepare::{prepare, PrepareRequest};
use opam_publish_core::registry::MirrorState;
use opam_publish_core::submit::{submit, SubmitRequest};
use opam_publish_core::token::{acquire_token, TokenStore};
use opam_publish_core::validate::validate_bundle;
use std::path::PathBuf;

/// Publish opam packages to a package repository through pull requests.
#[derive(Parser)]
#[clap(
    name = "opam-publish",
    version,
    about = "Prepare opam package metadata from a release archive and submit it as a pull request"
)]
pub struct Cli {
    /// YAML settings file (default: <root>/config.yaml)
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download a release archive and gather its metadata into <name>.<version>/
    Prepare {
        /// URL of the release archive
        url: String,
        /// Package name, when the archive's opam file does not say
        #[clap(long)]
        name: Option<String>,
        /// Package version, when the archive's opam file does not say
        #[clap(long = "version")]
        version: Option<String>,
        /// Repository label whose mirror is searched for earlier metadata
        #[clap(long)]
        repo: Option<String>,
        /// Directory receiving the bundle
        #[clap(long, default_value = ".")]
        output: PathBuf,
    },
    /// Validate a prepared bundle and open or update its pull request
    Submit {
        /// Bundle directory, named <name>.<version>
        dir: PathBuf,
        /// Forge user owning the fork
        #[clap(long)]
        user: Option<String>,
        /// Repository label
        #[clap(long, default_value = DEFAULT_LABEL)]
        repo: String,
        /// Offer to submit even when validation fails
        #[clap(long)]
        force: bool,
    },
    /// Validate a prepared bundle
    Check {
        /// Bundle directory
        dir: PathBuf,
    },
    /// Manage repository labels
    Repo {
        #[clap(subcommand)]
        command: RepoCommands,
    },
}

#[derive(Subcommand)]
pub enum RepoCommands {
    /// Register a repository under a label, cloning (and forking, with --user) it
    Add {
        label: String,
        /// Repository as <owner>/<name>
        repo: String,
        #[clap(long)]
        user: Option<String>,
    },
    /// Delete a label's mirror
    Remove { label: String },
    /// Show registered labels
    List,
}

async fn repo_add(
    config: &PublishConfig,
    label: &str,
    repo: &str,
    user: Option<String>,
) -> Result<()> {
    let repo: RepoId = repo.parse().map_err(|reason| PublishError::InvalidRepo {
        input: repo.to_string(),
        reason,
    })?;
    let git = CommandGit::new();
    let manager = MirrorManager::new(config, &git);

    match user {
        Some(user) => {
            let forge = GitHubClient::new(&config.forge.api_url)?;
            let operator = TerminalOperator::new();
            let store = TokenStore::new(config.tokens_dir());
            let token =
                acquire_token(&store, &forge, &operator, &user, &config.token_note).await?;
            let info = manager.register(label, &repo, &user, &forge, &token).await?;
            println!("{}: {} (forked by {})", info.label, info.repo, user);
        }
        None => {
            let registry = manager.registry();
            if registry.state(label)? == MirrorState::Unregistered {
                manager.clone_mirror(label, &repo)?;
            } else {
                registry.check_repo(label, &repo)?;
            }
            println!("{}: {} (not forked)", label, repo);
        }
    }
    Ok(())
}

fn repo_list(config: &PublishConfig) -> Result<()> {
    let git = CommandGit::new();
    let manager = MirrorManager::new(config, &git);
    let mirrors = manager.registry().list()?;
    if mirrors.is_empty() {
        println!("No repositories registered under {}", config.repos_dir().display());
    }
    for mirror in mirrors {
        println!(
            "{}\t{}\t{}",
            mirror.label,
            mirror.repo,
            mirror.user.as_deref().unwrap_or("not forked")
        );
    }
    Ok(())
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Prepare {
            url,
            name,
            version,
            repo,
            output,
        } => {
            tracing::info!(command = "prepare", url = %url, "Preparing bundle");
            let request = PrepareRequest {
                archive_url: url,
                name,
                version,
                repo_label: repo,
                output_dir: output,
            };
            let prepared = prepare(
                &config,
                &environment_context(),
                &HttpFetcher::new(),
                &CommandGit::new(),
                &request,
            )
            .await
            .context("prepare failed")?;
            println!(
                "Prepared {} in {} (opam from {}, descr from {})",
                prepared.package,
                prepared.dir.display(),
                prepared.manifest_source,
                prepared.descr_source.as_deref().unwrap_or("template")
            );
            if prepared.descr_source.is_none() {
                println!("Please fill in {}", prepared.dir.join("descr").display());
            }
            Ok(())
        }
        Commands::Submit {
            dir,
            user,
            repo,
            force,
        } => {
            tracing::info!(command = "submit", dir = %dir.display(), label = %repo, "Submitting bundle");
            let forge = GitHubClient::new(&config.forge.api_url)?;
            let request = SubmitRequest {
                label: repo,
                user,
                bundle_dir: dir,
                package: None,
                force,
            };
            match submit(
                &config,
                &CommandGit::new(),
                &forge,
                &HttpFetcher::new(),
                &TerminalOperator::new(),
                &request,
            )
            .await
            {
                Ok(report) => {
                    let verb = if report.created { "Opened" } else { "Updated" };
                    println!(
                        "{} pull request #{} for {}: {}",
                        verb, report.number, report.package, report.url
                    );
                    Ok(())
                }
                Err(PublishError::ValidationFailed { report }) => {
                    tracing::error!(command = "submit", "Validation failed");
                    eprint!("{}", report);
                    Err(anyhow!(
                        "{} failed validation; fix it or pass --force",
                        report.bundle.display()
                    ))
                }
                Err(e) => {
                    tracing::error!(command = "submit", error = %e, "Submission failed");
                    Err(anyhow::Error::new(e).context("submit failed"))
                }
            }
        }
        Commands::Check { dir } => {
            tracing::info!(command = "check", dir = %dir.display(), "Checking bundle");
            let report = validate_bundle(&dir, &HttpFetcher::new()).await;
            if report.passed() {
                let name = dir
                    .canonicalize()
                    .ok()
                    .and_then(|d| d.file_name().map(|n| n.to_string_lossy().to_string()))
                    .and_then(|n| PackageId::parse(&n).ok())
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| dir.display().to_string());
                println!("{}: all checks passed", name);
                Ok(())
            } else {
                print!("{}", report);
                Err(anyhow!("{} failed validation", dir.display()))
            }
        }
        Commands::Repo { command } => match command {
            RepoCommands::Add { label, repo, user } => {
                tracing::info!(command = "repo add", label = %label, repo = %repo, "Registering repository");
                repo_add(&config, &label, &repo, user).await
            }
            RepoCommands::Remove { label } => {
                tracing::info!(command = "repo remove", label = %label, "Removing repository");
                let git = CommandGit::new();
                MirrorManager::new(&config, &git).registry().remove(&label)?;
                println!("Removed {}", label);
                Ok(())
            }
            RepoCommands::List => repo_list(&config),
        },
    }
}
