//! Access token cache and acquisition.
//!
//! A token is looked up in `<root>/tokens/<user>` first and used verbatim when present; it is
//! never revalidated. Otherwise the operator's password is exchanged for a token (reusing one the
//! forge already lists under our note) and the result is written to the cache before it is
//! returned.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::contract::{Forge, Operator};
use crate::error::{PublishError, PublishResult};

/// Token files, one per forge user.
#[derive(Debug, Clone)]
pub struct TokenStore {
    dir: PathBuf,
}

impl TokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        TokenStore { dir: dir.into() }
    }

    pub fn path_for(&self, user: &str) -> PathBuf {
        self.dir.join(user)
    }

    pub fn load(&self, user: &str) -> PublishResult<Option<String>> {
        let path = self.path_for(user);
        if !path.is_file() {
            return Ok(None);
        }
        let token = fs::read_to_string(&path)
            .map_err(|e| PublishError::io(format!("reading {}", path.display()), e))?;
        Ok(Some(token.trim().to_string()))
    }

    /// Writes the token readable by the owner only.
    pub fn save(&self, user: &str, token: &str) -> PublishResult<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| PublishError::io(format!("creating {}", self.dir.display()), e))?;
        let path = self.path_for(user);
        let mut file = owner_only()
            .open(&path)
            .map_err(|e| PublishError::io(format!("creating {}", path.display()), e))?;
        // A file left by an earlier run keeps its old mode on open.
        restrict_to_owner(&path)?;
        file.write_all(token.as_bytes())
            .map_err(|e| PublishError::io(format!("writing {}", path.display()), e))?;
        info!(user, path = %path.display(), "Stored access token");
        Ok(())
    }
}

#[cfg(unix)]
fn owner_only() -> OpenOptions {
    use std::os::unix::fs::OpenOptionsExt;
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true).mode(0o600);
    options
}

#[cfg(not(unix))]
fn owner_only() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    options
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> PublishResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|e| PublishError::io(format!("restricting {}", path.display()), e))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> PublishResult<()> {
    Ok(())
}

/// Returns the cached token for `user`, or obtains and caches a new one.
pub async fn acquire_token<F, O>(
    store: &TokenStore,
    forge: &F,
    operator: &O,
    user: &str,
    note: &str,
) -> PublishResult<String>
where
    F: Forge,
    O: Operator,
{
    if let Some(token) = store.load(user)? {
        info!(user, "Using cached access token");
        return Ok(token);
    }

    info!(user, "No cached token, requesting one from the forge");
    let password = operator.ask_password(&format!("Forge password for {}", user))?;

    let existing = forge.list_tokens(user, &password).await.map_err(|e| {
        error!(error = %e, user, "Listing access tokens failed");
        e
    })?;
    let token = match existing
        .into_iter()
        .find(|t| t.note.as_deref() == Some(note) && !t.token.is_empty())
    {
        Some(record) => {
            info!(user, "Reusing existing access token");
            record.token
        }
        None => forge
            .create_token(user, &password, note)
            .await
            .map_err(|e| {
                error!(error = %e, user, "Creating access token failed");
                e
            })?,
    };

    store.save(user, &token)?;
    Ok(token)
}
