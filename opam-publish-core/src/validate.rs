//! Metadata validator.
//!
//! Checks a bundle directory in four areas (directory shape, `opam`, `descr`, `url`) and always
//! goes through all of them, so a single run reports every problem. Nothing here returns an
//! error: unreadable or malformed files become warnings, and any warning fails its area.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::archive::{self, Checksum};
use crate::contract::{FetchOutcome, Fetcher};
use crate::opam_file::{descr_is_unspecified, Descr, OpamFile, UrlFile};

pub const MANIFEST_FILE: &str = "opam";
pub const DESCR_FILE: &str = "descr";
pub const URL_FILE: &str = "url";
pub const FILES_DIR: &str = "files";

/// Warnings collected for one file (or for the bundle directory itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub path: PathBuf,
    pub warnings: Vec<String>,
}

impl FileReport {
    fn new(path: PathBuf, warnings: Vec<String>) -> Self {
        for warning in &warnings {
            warn!(path = %path.display(), warning = %warning, "Validation warning");
        }
        FileReport { path, warnings }
    }

    pub fn passed(&self) -> bool {
        self.warnings.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub bundle: PathBuf,
    pub shape: FileReport,
    pub manifest: FileReport,
    pub descr: FileReport,
    pub url: FileReport,
}

impl ValidationReport {
    pub fn areas(&self) -> [&FileReport; 4] {
        [&self.shape, &self.manifest, &self.descr, &self.url]
    }

    /// Logical AND of the four areas.
    pub fn passed(&self) -> bool {
        self.areas().iter().all(|area| area.passed())
    }

    pub fn warnings(&self) -> Vec<String> {
        self.areas()
            .iter()
            .flat_map(|area| area.warnings.iter().cloned())
            .collect()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for area in self.areas() {
            if area.passed() {
                continue;
            }
            writeln!(f, "In {}:", area.path.display())?;
            for warning in &area.warnings {
                writeln!(f, "  - {}", warning)?;
            }
        }
        Ok(())
    }
}

/// Runs every check over the bundle in `dir`.
pub async fn validate_bundle<X: Fetcher>(dir: &Path, fetcher: &X) -> ValidationReport {
    info!(bundle = %dir.display(), "Validating bundle");
    let shape = FileReport::new(dir.to_path_buf(), check_shape(dir));
    let manifest_path = dir.join(MANIFEST_FILE);
    let manifest = FileReport::new(manifest_path.clone(), check_manifest(&manifest_path));
    let descr_path = dir.join(DESCR_FILE);
    let descr = FileReport::new(descr_path.clone(), check_descr(&descr_path));
    let url_path = dir.join(URL_FILE);
    let url = FileReport::new(url_path.clone(), check_url(&url_path, fetcher).await);

    let report = ValidationReport {
        bundle: dir.to_path_buf(),
        shape,
        manifest,
        descr,
        url,
    };
    info!(
        bundle = %dir.display(),
        passed = report.passed(),
        warnings = report.warnings().len(),
        "Validation finished"
    );
    report
}

/// Reports anything besides the three metadata files and the `files` directory.
pub fn check_shape(dir: &Path) -> Vec<String> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => return vec![format!("cannot read bundle directory: {}", e)],
    };
    let mut names: Vec<(String, bool)> = entries
        .filter_map(Result::ok)
        .map(|entry| {
            (
                entry.file_name().to_string_lossy().to_string(),
                entry.path().is_dir(),
            )
        })
        .collect();
    names.sort();

    let mut warnings = Vec::new();
    for (name, is_dir) in names {
        if is_dir {
            if name != FILES_DIR {
                warnings.push(format!("extra directory: {}", name));
            }
        } else if ![MANIFEST_FILE, DESCR_FILE, URL_FILE].contains(&name.as_str()) {
            warnings.push(format!("extra file: {}", name));
        }
    }
    warnings
}

fn read(path: &Path) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("cannot read file: {}", e))
}

pub fn check_manifest(path: &Path) -> Vec<String> {
    let text = match read(path) {
        Ok(text) => text,
        Err(warning) => return vec![warning],
    };
    let file = match OpamFile::parse(&text) {
        Ok(file) => file,
        Err(e) => return vec![format!("parse error: {}", e)],
    };
    let mut warnings = file.lint();
    if file.has_field("name") {
        warnings.push(
            "field 'name' should not be set: the name comes from the bundle directory".to_string(),
        );
    }
    if file.has_field("version") {
        warnings.push(
            "field 'version' should not be set: the version comes from the bundle directory"
                .to_string(),
        );
    }
    warnings
}

pub fn check_descr(path: &Path) -> Vec<String> {
    let text = match read(path) {
        Ok(text) => text,
        Err(warning) => return vec![warning],
    };
    if descr_is_unspecified(&text) {
        return vec!["description unspecified".to_string()];
    }
    let descr = Descr::parse(&text);
    let mut warnings = Vec::new();
    if descr.synopsis.trim().is_empty() {
        warnings.push("short description is empty".to_string());
    }
    if descr.body.trim().is_empty() {
        warnings.push("long description is empty".to_string());
    }
    warnings
}

/// Why an address cannot be used as a source, or `None` if it is a plain http(s)/ftp url.
pub fn reject_address(kind: &str, address: &str) -> Option<String> {
    if !matches!(kind, "src" | "archive" | "http") {
        return Some(format!("{} address {} is not an archive url", kind, address));
    }
    let scheme = address.split_once("://").map(|(scheme, _)| scheme);
    match scheme {
        Some("http") | Some("https") | Some("ftp") => {}
        Some(other) => {
            return Some(format!(
                "unsupported address {} (scheme {:?}, expected http, https or ftp)",
                address, other
            ))
        }
        None => return Some(format!("{} is not a url", address)),
    }
    if address.contains('#') {
        return Some(format!("address {} carries a qualifier", address));
    }
    None
}

pub async fn check_url<X: Fetcher>(path: &Path, fetcher: &X) -> Vec<String> {
    let text = match read(path) {
        Ok(text) => text,
        Err(warning) => return vec![warning],
    };
    let url = match UrlFile::parse(&text) {
        Ok(url) => url,
        Err(e) => return vec![format!("parse error: {}", e)],
    };

    let mut warnings = Vec::new();
    let checksum = match url.checksum.as_deref().map(str::parse::<Checksum>) {
        None => {
            warnings.push("no checksum".to_string());
            None
        }
        Some(Err(e)) => {
            warnings.push(format!("invalid checksum: {}", e));
            None
        }
        Some(Ok(checksum)) => Some(checksum),
    };

    let scratch = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            warnings.push(format!("cannot create scratch directory: {}", e));
            return warnings;
        }
    };
    for (i, address) in url.addresses().into_iter().enumerate() {
        let kind = if i == 0 { url.kind.as_str() } else { "src" };
        if let Some(reason) = reject_address(kind, address) {
            warnings.push(reason);
            continue;
        }
        let dest = scratch.path().join(i.to_string());
        match fetcher.fetch(vec![address.to_string()], &dest).await {
            FetchOutcome::NotAvailable { reason } => {
                warnings.push(format!("source at {} is not available: {}", address, reason));
            }
            FetchOutcome::Fetched { path, .. } => {
                let Some(expected) = &checksum else { continue };
                match archive::verify(&path, expected) {
                    Ok(true) => info!(address, "Checksum verified"),
                    Ok(false) => warnings.push(format!("bad checksum for {}", address)),
                    Err(e) => warnings.push(format!("cannot checksum {}: {}", address, e)),
                }
            }
        }
    }
    warnings
}
