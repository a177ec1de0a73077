//! Package identifiers and the names derived from them.
//!
//! A [`PackageId`] is the `(name, version)` pair every other part of the tool keys on: the
//! prepared working directory is `<name>.<version>`, the bundle lives at
//! `packages/<name>/<name>.<version>` inside the repository, and the pull request is carried by a
//! branch whose name is a pure function of the identifier (see [`PackageId::branch_name`]).

use std::cmp::Ordering;
use std::fmt;

use crate::error::{PublishError, PublishResult};

/// An immutable `(name, version)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageId {
    name: String,
    version: String,
}

impl PackageId {
    /// Builds an identifier, rejecting names and versions that cannot be used as path components.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> PublishResult<Self> {
        let name = name.into();
        let version = version.into();
        validate_name(&name)?;
        validate_version(&version)?;
        Ok(PackageId { name, version })
    }

    /// Parses `<name>.<version>`, splitting at the first dot (names never contain one).
    pub fn parse(input: &str) -> PublishResult<Self> {
        match input.split_once('.') {
            Some((name, version)) => PackageId::new(name, version),
            None => Err(PublishError::InvalidPackage {
                input: input.to_string(),
                reason: "expected <name>.<version>".to_string(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Directory name of a prepared bundle, `<name>.<version>`.
    pub fn dir_name(&self) -> String {
        self.to_string()
    }

    /// Path of the bundle inside a package repository checkout.
    pub fn repo_path(&self) -> String {
        format!("packages/{}/{}", self.name, self)
    }

    /// Branch carrying the pull request for this identifier.
    ///
    /// Every character outside `[A-Za-z0-9-._]` becomes `-`. The same identifier always maps to the
    /// same branch, so resubmitting updates the existing pull request. Identifiers that differ only
    /// in substituted characters (`1.0+beta` vs `1.0~beta`) share a branch.
    pub fn branch_name(&self) -> String {
        self.to_string()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.version)
    }
}

fn validate_name(name: &str) -> PublishResult<()> {
    let invalid = |reason: &str| {
        Err(PublishError::InvalidPackage {
            input: name.to_string(),
            reason: reason.to_string(),
        })
    };
    let Some(first) = name.chars().next() else {
        return invalid("empty package name");
    };
    if !(first.is_ascii_alphanumeric() || first == '_') {
        return invalid("package names start with a letter, a digit or '_'");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+'))
    {
        return invalid("package names only contain letters, digits, '_', '-' and '+'");
    }
    Ok(())
}

fn validate_version(version: &str) -> PublishResult<()> {
    if version.is_empty() {
        return Err(PublishError::InvalidPackage {
            input: version.to_string(),
            reason: "empty version".to_string(),
        });
    }
    if version.chars().any(|c| c.is_whitespace() || c == '/' || c == '"') {
        return Err(PublishError::InvalidPackage {
            input: version.to_string(),
            reason: "versions cannot contain whitespace, '/' or '\"'".to_string(),
        });
    }
    Ok(())
}

/// Orders version strings the way opam does (Debian-style).
///
/// Versions are compared as alternating runs of non-digits and digits. Non-digit runs compare
/// character by character where `~` sorts before anything (even the end of the string) and letters
/// sort before other symbols; digit runs compare numerically.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut a = a.as_bytes();
    let mut b = b.as_bytes();
    loop {
        let (a_str, a_rest) = split_run(a, |c| !c.is_ascii_digit());
        let (b_str, b_rest) = split_run(b, |c| !c.is_ascii_digit());
        match compare_non_digits(a_str, b_str) {
            Ordering::Equal => {}
            other => return other,
        }
        let (a_num, a_rest) = split_run(a_rest, |c| c.is_ascii_digit());
        let (b_num, b_rest) = split_run(b_rest, |c| c.is_ascii_digit());
        match compare_digits(a_num, b_num) {
            Ordering::Equal => {}
            other => return other,
        }
        if a_rest.is_empty() && b_rest.is_empty() {
            return Ordering::Equal;
        }
        a = a_rest;
        b = b_rest;
    }
}

fn split_run(s: &[u8], keep: impl Fn(&u8) -> bool) -> (&[u8], &[u8]) {
    let end = s.iter().position(|c| !keep(c)).unwrap_or(s.len());
    s.split_at(end)
}

fn char_weight(c: Option<u8>) -> i32 {
    match c {
        Some(b'~') => -1,
        None => 0,
        Some(c) if c.is_ascii_alphabetic() => c as i32,
        Some(c) => c as i32 + 256,
    }
}

fn compare_non_digits(a: &[u8], b: &[u8]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let ord = char_weight(a.get(i).copied()).cmp(&char_weight(b.get(i).copied()));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn compare_digits(a: &[u8], b: &[u8]) -> Ordering {
    let trim = |s: &[u8]| -> Vec<u8> {
        let start = s.iter().position(|c| *c != b'0').unwrap_or(s.len());
        s[start..].to_vec()
    };
    let a = trim(a);
    let b = trim(b);
    a.len().cmp(&b.len()).then_with(|| a.cmp(&b))
}
