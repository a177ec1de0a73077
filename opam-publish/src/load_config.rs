/// `load_config` module: turns the optional YAML settings file and the process environment into
/// a [`PublishConfig`] and the [`EnvironmentContext`] handed to `prepare`.
///
/// # Sources, strongest first
/// - `OPAM_PUBLISH_ROOT` (root directory only)
/// - the YAML file given with `--config`, else `<root>/config.yaml` when it exists
/// - built-in defaults (`~/.opam-publish`, github.com, `ocaml/opam-repository`)
///
/// Every key of the YAML file is optional:
///
/// ```yaml
/// root: /home/me/.opam-publish
/// forge:
///   host: github.com
///   api_url: https://api.github.com
/// default_repo: ocaml/opam-repository
/// fork_poll:
///   interval_ms: 1500
///   attempts: 20
/// token_note: opam-publish access token
/// ```
///
/// # Errors
/// All errors use `anyhow::Error` and surface at the CLI boundary.
use anyhow::{anyhow, Result};
use opam_publish_core::config::{EnvironmentContext, PublishConfig};
use opam_publish_core::contract::RepoId;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

pub const ROOT_ENV: &str = "OPAM_PUBLISH_ROOT";
pub const CONFIG_FILE_NAME: &str = "config.yaml";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub root: Option<PathBuf>,
    pub forge: Option<ForgeSection>,
    pub default_repo: Option<String>,
    pub fork_poll: Option<ForkPollSection>,
    pub token_note: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForgeSection {
    pub host: Option<String>,
    pub api_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForkPollSection {
    pub interval_ms: Option<u64>,
    pub attempts: Option<u32>,
}

fn default_root() -> Result<PathBuf> {
    if let Ok(root) = env::var(ROOT_ENV) {
        return Ok(PathBuf::from(root));
    }
    dirs::home_dir()
        .map(|home| home.join(".opam-publish"))
        .ok_or_else(|| anyhow!("cannot determine the home directory; set {}", ROOT_ENV))
}

/// Reads and parses one YAML settings file.
pub fn read_config_file<P: AsRef<Path>>(path: P) -> Result<ConfigFile> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => {
            info!(config_path = ?path_ref, "Config file read successfully");
            content
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    // An empty file is a valid, empty configuration.
    if config_content.trim().is_empty() {
        return Ok(ConfigFile::default());
    }

    match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            Ok(conf)
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            Err(anyhow!("Failed to parse config YAML {:?}: {e}", path_ref))
        }
    }
}

/// Builds the runtime configuration from an explicit file, the default file and the environment.
pub fn load_config(explicit: Option<&Path>) -> Result<PublishConfig> {
    let root = default_root()?;
    let file = match explicit {
        Some(path) => read_config_file(path)?,
        None => {
            let implicit = root.join(CONFIG_FILE_NAME);
            if implicit.is_file() {
                read_config_file(&implicit)?
            } else {
                debug!(path = %implicit.display(), "No configuration file, using defaults");
                ConfigFile::default()
            }
        }
    };

    let root = if env::var_os(ROOT_ENV).is_some() {
        root
    } else {
        file.root.clone().unwrap_or(root)
    };
    let mut config = PublishConfig::with_root(root);
    if let Some(forge) = file.forge {
        if let Some(host) = forge.host {
            config.forge.host = host;
        }
        if let Some(api_url) = forge.api_url {
            config.forge.api_url = api_url.trim_end_matches('/').to_string();
        }
    }
    if let Some(repo) = file.default_repo {
        repo.parse::<RepoId>()
            .map_err(|e| anyhow!("Invalid default_repo in configuration: {e}"))?;
        config.default_repo = repo;
    }
    if let Some(poll) = file.fork_poll {
        if let Some(interval_ms) = poll.interval_ms {
            config.fork_poll.interval_ms = interval_ms;
        }
        if let Some(attempts) = poll.attempts {
            if attempts == 0 {
                return Err(anyhow!("fork_poll.attempts must be at least 1"));
            }
            config.fork_poll.attempts = attempts;
        }
    }
    if let Some(note) = file.token_note {
        config.token_note = note;
    }

    config.trace_loaded();
    Ok(config)
}

/// Reads the `switch:` entry of an opam root's `config` file.
fn configured_switch(opam_root: &Path) -> Option<String> {
    let content = fs::read_to_string(opam_root.join("config")).ok()?;
    content.lines().find_map(|line| {
        let value = line.trim().strip_prefix("switch:")?;
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Overlay location for an opam root and switch.
pub fn environment_context_from(
    opam_root: Option<PathBuf>,
    switch: Option<String>,
) -> EnvironmentContext {
    let Some(opam_root) = opam_root else {
        return EnvironmentContext::none();
    };
    let switch = switch.or_else(|| configured_switch(&opam_root));
    match switch {
        Some(switch) => {
            let overlay = opam_root.join(&switch).join("overlay");
            debug!(switch = %switch, overlay = %overlay.display(), "Active opam switch");
            EnvironmentContext::with_overlay_root(overlay)
        }
        None => EnvironmentContext::none(),
    }
}

/// The active switch's overlay, from `OPAMROOT`/`OPAMSWITCH` or `~/.opam/config`.
pub fn environment_context() -> EnvironmentContext {
    let opam_root = env::var_os("OPAMROOT")
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|home| home.join(".opam")));
    let switch = env::var("OPAMSWITCH").ok().filter(|s| !s.is_empty());
    environment_context_from(opam_root, switch)
}
