//! Archive download, digest and extraction.
//!
//! [`HttpFetcher`] is the production [`Fetcher`]: it downloads http(s) urls with `reqwest` and ftp
//! urls with `suppaftp`, then hashes the file with SHA-256. [`extract_archive`] unpacks tarballs
//! (plain, gzip, bzip2, xz) and zip files in-process.

use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sha2::{Digest, Sha256, Sha512};
use suppaftp::types::FileType;
use suppaftp::FtpStream;
use tracing::{debug, error, info, warn};

use crate::contract::{FetchOutcome, Fetcher};
use crate::error::{PublishError, PublishResult};

const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Sha256,
    Sha512,
}

impl HashKind {
    fn label(self) -> &'static str {
        match self {
            HashKind::Sha256 => "sha256",
            HashKind::Sha512 => "sha512",
        }
    }
}

/// A digest as written in a `url` file: `sha256=<hex>`, `sha512=<hex>` or bare hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub kind: HashKind,
    pub hex: String,
}

impl Checksum {
    pub fn sha256(hex: impl Into<String>) -> Self {
        Checksum {
            kind: HashKind::Sha256,
            hex: hex.into(),
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.kind.label(), self.hex)
    }
}

impl FromStr for Checksum {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (kind, hex) = match s.split_once('=') {
            Some(("sha256", hex)) => (HashKind::Sha256, hex),
            Some(("sha512", hex)) => (HashKind::Sha512, hex),
            Some((other, _)) => return Err(format!("unsupported checksum algorithm {:?}", other)),
            None => match s.len() {
                64 => (HashKind::Sha256, s),
                128 => (HashKind::Sha512, s),
                _ => return Err(format!("unrecognised checksum {:?}", s)),
            },
        };
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("checksum {:?} is not hexadecimal", s));
        }
        Ok(Checksum {
            kind,
            hex: hex.to_ascii_lowercase(),
        })
    }
}

/// Digest of a file with the given algorithm, as lowercase hex.
pub fn file_digest(path: &Path, kind: HashKind) -> PublishResult<String> {
    let mut file = File::open(path)
        .map_err(|e| PublishError::io(format!("opening {}", path.display()), e))?;
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut sha256 = Sha256::new();
    let mut sha512 = Sha512::new();
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|e| PublishError::io(format!("reading {}", path.display()), e))?;
        if read == 0 {
            break;
        }
        match kind {
            HashKind::Sha256 => sha256.update(&buffer[..read]),
            HashKind::Sha512 => sha512.update(&buffer[..read]),
        }
    }
    Ok(match kind {
        HashKind::Sha256 => format!("{:x}", sha256.finalize()),
        HashKind::Sha512 => format!("{:x}", sha512.finalize()),
    })
}

/// SHA-256 checksum of a file.
pub fn file_checksum(path: &Path) -> PublishResult<Checksum> {
    Ok(Checksum::sha256(file_digest(path, HashKind::Sha256)?))
}

/// Whether the file at `path` matches `expected`.
pub fn verify(path: &Path, expected: &Checksum) -> PublishResult<bool> {
    Ok(file_digest(path, expected.kind)? == expected.hex)
}

/// Last path segment of a url, used as the local file name.
pub fn file_name_of(url: &str) -> String {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    trimmed
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .filter(|segment| !segment.contains(':'))
        .unwrap_or("archive")
        .to_string()
}

/// Container and compression of a downloaded archive, told apart by its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarBz2,
    TarXz,
    Zip,
}

impl ArchiveFormat {
    /// Sniffs the format from the first bytes of the file; anything unrecognised is read as tar.
    pub fn detect(path: &Path) -> PublishResult<Self> {
        let mut file = File::open(path)
            .map_err(|e| PublishError::io(format!("opening {}", path.display()), e))?;
        let mut magic = [0u8; 6];
        let mut filled = 0;
        while filled < magic.len() {
            let read = file
                .read(&mut magic[filled..])
                .map_err(|e| PublishError::io(format!("reading {}", path.display()), e))?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        let magic = &magic[..filled];
        Ok(if magic.starts_with(&[0x1f, 0x8b]) {
            ArchiveFormat::TarGz
        } else if magic.starts_with(b"BZh") {
            ArchiveFormat::TarBz2
        } else if magic.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            ArchiveFormat::TarXz
        } else if magic.starts_with(b"PK\x03\x04") || magic.starts_with(b"PK\x05\x06") {
            ArchiveFormat::Zip
        } else {
            ArchiveFormat::Tar
        })
    }
}

fn unpack_tar<R: Read>(reader: R, dest: &Path) -> std::io::Result<()> {
    tar::Archive::new(reader).unpack(dest)
}

/// Unpacks a tar (plain, gzip, bzip2 or xz) or zip archive into `dest`.
pub fn extract_archive(archive: &Path, dest: &Path) -> PublishResult<()> {
    fs::create_dir_all(dest)
        .map_err(|e| PublishError::io(format!("creating {}", dest.display()), e))?;
    let format = ArchiveFormat::detect(archive)?;
    let file = File::open(archive)
        .map_err(|e| PublishError::io(format!("opening {}", archive.display()), e))?;

    let result = match format {
        ArchiveFormat::Tar => unpack_tar(file, dest).map_err(|e| e.to_string()),
        ArchiveFormat::TarGz => {
            unpack_tar(flate2::read::GzDecoder::new(file), dest).map_err(|e| e.to_string())
        }
        ArchiveFormat::TarBz2 => {
            unpack_tar(bzip2::read::BzDecoder::new(file), dest).map_err(|e| e.to_string())
        }
        ArchiveFormat::TarXz => {
            unpack_tar(xz2::read::XzDecoder::new(file), dest).map_err(|e| e.to_string())
        }
        ArchiveFormat::Zip => zip::ZipArchive::new(file)
            .and_then(|mut zip| zip.extract(dest))
            .map_err(|e| e.to_string()),
    };

    match result {
        Ok(()) => {
            info!(archive = %archive.display(), dest = %dest.display(), format = ?format, "Extracted archive");
            Ok(())
        }
        Err(reason) => {
            error!(archive = %archive.display(), format = ?format, error = %reason, "Failed to extract archive");
            Err(PublishError::Metadata {
                path: archive.to_path_buf(),
                reason: format!("could not extract archive: {}", reason),
            })
        }
    }
}

/// Downloads archives over HTTP(S) and FTP.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("opam-publish/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        HttpFetcher { client }
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, String> {
        let parsed = reqwest::Url::parse(url).map_err(|e| e.to_string())?;
        if parsed.scheme() == "ftp" {
            return tokio::task::spawn_blocking(move || ftp_download(&parsed))
                .await
                .map_err(|e| e.to_string())?;
        }
        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {}", status));
        }
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(bytes.to_vec())
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<std::path::PathBuf, String> {
        let bytes = self.fetch_bytes(url).await?;
        fs::create_dir_all(dest).map_err(|e| e.to_string())?;
        let path = dest.join(file_name_of(url));
        fs::write(&path, &bytes).map_err(|e| e.to_string())?;
        debug!(url, path = %path.display(), size = bytes.len(), "Downloaded file");
        Ok(path)
    }
}

/// Retrieves an `ftp://` url in passive binary mode, anonymously unless the url names a user.
fn ftp_download(url: &reqwest::Url) -> Result<Vec<u8>, String> {
    let host = url
        .host_str()
        .ok_or_else(|| format!("{} has no host", url))?;
    let port = url.port_or_known_default().unwrap_or(21);
    let mut ftp = FtpStream::connect((host, port)).map_err(|e| format!("FTP connect: {}", e))?;
    let user = match url.username() {
        "" => "anonymous",
        user => user,
    };
    ftp.login(user, url.password().unwrap_or("anonymous@"))
        .map_err(|e| format!("FTP login: {}", e))?;
    ftp.transfer_type(FileType::Binary)
        .map_err(|e| format!("FTP TYPE: {}", e))?;
    let data = ftp
        .retr_as_buffer(url.path())
        .map_err(|e| format!("FTP RETR {}: {}", url.path(), e))?
        .into_inner();
    if let Err(e) = ftp.quit() {
        debug!(error = %e, "FTP QUIT failed");
    }
    Ok(data)
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, urls: Vec<String>, dest: &Path) -> FetchOutcome {
        let mut reasons = Vec::new();
        for url in &urls {
            match self.download(url, dest).await {
                Ok(path) => match file_checksum(&path) {
                    Ok(checksum) => {
                        info!(url = %url, checksum = %checksum, "Fetched archive");
                        return FetchOutcome::Fetched {
                            path,
                            checksums: vec![checksum],
                        };
                    }
                    Err(e) => reasons.push(format!("{}: {}", url, e)),
                },
                Err(reason) => {
                    warn!(url = %url, reason = %reason, "Download failed");
                    reasons.push(format!("{}: {}", url, reason));
                }
            }
        }
        if reasons.is_empty() {
            reasons.push("no url given".to_string());
        }
        FetchOutcome::NotAvailable {
            reason: reasons.join("; "),
        }
    }

    fn extract(&self, archive: &Path, dest: &Path) -> Result<(), PublishError> {
        extract_archive(archive, dest)
    }
}
