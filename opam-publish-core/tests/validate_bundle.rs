use std::fs;
use std::path::{Path, PathBuf};

use opam_publish_core::archive::file_checksum;
use opam_publish_core::contract::{FetchOutcome, MockFetcher};
use opam_publish_core::opam_file::DESCR_TEMPLATE;
use opam_publish_core::validate::{check_descr, check_shape, reject_address, validate_bundle};
use tempfile::{tempdir, TempDir};

const MANIFEST: &str = r#"opam-version: "1.2"
maintainer: "dev@example.com"
homepage: "https://example.com/pkg"
build: [make]
depends: ["ocamlfind" {build}]
"#;

const DESCR: &str = "A small package\n\nIt packages small things.\n";

/// A bundle whose url points at `archive`, with the archive's real checksum.
fn write_bundle(root: &Path, archive: &Path) -> PathBuf {
    let dir = root.join("pkg.1.2");
    fs::create_dir_all(dir.join("files")).unwrap();
    fs::write(dir.join("opam"), MANIFEST).unwrap();
    fs::write(dir.join("descr"), DESCR).unwrap();
    fs::write(dir.join("files/fix.patch"), "--- a\n+++ b\n").unwrap();
    let checksum = file_checksum(archive).unwrap();
    fs::write(
        dir.join("url"),
        format!(
            "src: \"http://example.test/pkg-1.2.tar.gz\"\nchecksum: \"{}\"\n",
            checksum
        ),
    )
    .unwrap();
    dir
}

fn fixture() -> (TempDir, PathBuf, PathBuf) {
    let tmp = tempdir().unwrap();
    let archive = tmp.path().join("pkg-1.2.tar.gz");
    fs::write(&archive, b"not really a tarball").unwrap();
    let bundle = write_bundle(tmp.path(), &archive);
    (tmp, archive, bundle)
}

fn serving(archive: PathBuf) -> MockFetcher {
    let mut fetcher = MockFetcher::new();
    fetcher
        .expect_fetch()
        .returning(move |_urls, _dest| FetchOutcome::Fetched {
            path: archive.clone(),
            checksums: vec![],
        });
    fetcher
}

#[tokio::test]
async fn test_valid_bundle_passes() {
    let (_tmp, archive, bundle) = fixture();
    let fetcher = serving(archive);

    let report = validate_bundle(&bundle, &fetcher).await;
    assert!(report.passed(), "unexpected warnings:\n{}", report);
    assert!(report.warnings().is_empty());
}

#[tokio::test]
async fn test_extra_file_fails_shape_check() {
    let (_tmp, archive, bundle) = fixture();
    let fetcher = serving(archive);

    fs::write(bundle.join("notes.txt"), "remember the milk").unwrap();
    let report = validate_bundle(&bundle, &fetcher).await;
    assert!(!report.passed());
    assert!(!report.shape.passed());
    assert!(report.manifest.passed() && report.descr.passed() && report.url.passed());
    assert!(report.shape.warnings.iter().any(|w| w.contains("notes.txt")));
    assert!(report.to_string().contains("extra file: notes.txt"));

    fs::remove_file(bundle.join("notes.txt")).unwrap();
    assert!(validate_bundle(&bundle, &fetcher).await.passed());
}

#[test]
fn test_extra_directory_is_reported() {
    let tmp = tempdir().unwrap();
    fs::create_dir_all(tmp.path().join("files")).unwrap();
    fs::create_dir_all(tmp.path().join("patches")).unwrap();
    fs::write(tmp.path().join("opam"), MANIFEST).unwrap();
    assert_eq!(check_shape(tmp.path()), vec!["extra directory: patches"]);
}

#[tokio::test]
async fn test_validation_is_idempotent() {
    let (_tmp, archive, bundle) = fixture();
    let fetcher = serving(archive);
    fs::write(bundle.join("descr"), DESCR_TEMPLATE).unwrap();

    let first = validate_bundle(&bundle, &fetcher).await;
    let second = validate_bundle(&bundle, &fetcher).await;
    assert!(!first.passed());
    assert_eq!(first, second);
}

#[test]
fn test_unspecified_descriptions() {
    struct TestCase {
        content: &'static str,
        unspecified: bool,
    }

    let cases = [
        TestCase {
            content: DESCR_TEMPLATE,
            unspecified: true,
        },
        TestCase {
            content: "",
            unspecified: true,
        },
        TestCase {
            content: "  \n\n\t \n",
            unspecified: true,
        },
        TestCase {
            content: DESCR,
            unspecified: false,
        },
    ];

    let tmp = tempdir().unwrap();
    let path = tmp.path().join("descr");
    for case in cases {
        fs::write(&path, case.content).unwrap();
        let warnings = check_descr(&path);
        assert_eq!(
            warnings == vec!["description unspecified".to_string()],
            case.unspecified,
            "{:?} gave {:?}",
            case.content,
            warnings
        );
    }
}

#[test]
fn test_descr_without_body_is_flagged() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("descr");
    fs::write(&path, "Just a synopsis\n").unwrap();
    assert_eq!(check_descr(&path), vec!["long description is empty"]);
}

#[tokio::test]
async fn test_manifest_with_name_and_unknown_field() {
    let (_tmp, archive, bundle) = fixture();
    let fetcher = serving(archive);
    fs::write(
        bundle.join("opam"),
        format!("{}name: \"pkg\"\nfrobnicate: true\n", MANIFEST),
    )
    .unwrap();

    let report = validate_bundle(&bundle, &fetcher).await;
    assert!(!report.manifest.passed());
    let warnings = &report.manifest.warnings;
    assert!(warnings.iter().any(|w| w.contains("unknown field 'frobnicate'")));
    assert!(warnings.iter().any(|w| w.contains("field 'name' should not be set")));
}

#[tokio::test]
async fn test_unparsable_manifest_is_a_warning() {
    let (_tmp, archive, bundle) = fixture();
    let fetcher = serving(archive);
    fs::write(bundle.join("opam"), "depends: [ \"a\"\n").unwrap();

    let report = validate_bundle(&bundle, &fetcher).await;
    assert_eq!(report.manifest.warnings.len(), 1);
    assert!(report.manifest.warnings[0].starts_with("parse error"));
    assert!(report.url.passed());
}

#[test]
fn test_address_allow_list() {
    let cases = [
        ("src", "http://example.test/a.tgz", true),
        ("archive", "https://example.test/a.tgz", true),
        ("http", "ftp://example.test/a.tgz", true),
        ("git", "https://github.com/a/b.git", false),
        ("src", "git+https://github.com/a/b.git", false),
        ("src", "https://example.test/a.tgz#v1", false),
        ("src", "file:///tmp/a.tgz", false),
        ("src", "/tmp/a.tgz", false),
    ];
    for (kind, address, accepted) in cases {
        assert_eq!(
            reject_address(kind, address).is_none(),
            accepted,
            "{}: {}",
            kind,
            address
        );
    }
}

#[tokio::test]
async fn test_vcs_address_is_rejected_without_fetching() {
    let (_tmp, _archive, bundle) = fixture();
    fs::write(
        bundle.join("url"),
        "git: \"https://github.com/example/pkg.git\"\nchecksum: \"sha256=00\"\n",
    )
    .unwrap();
    let mut fetcher = MockFetcher::new();
    fetcher.expect_fetch().times(0);

    let report = validate_bundle(&bundle, &fetcher).await;
    assert!(!report.url.passed());
    assert!(report.url.warnings.iter().any(|w| w.contains("not an archive url")));
}

#[tokio::test]
async fn test_checksum_mismatch_and_fetch_failure_are_warnings() {
    let (tmp, archive, bundle) = fixture();
    let other = tmp.path().join("other.tar.gz");
    fs::write(&other, b"different bytes").unwrap();
    let checksum = file_checksum(&archive).unwrap();
    fs::write(
        bundle.join("url"),
        format!(
            "src: \"http://example.test/pkg-1.2.tar.gz\"\nmirrors: [\"http://mirror.test/pkg-1.2.tar.gz\" \"http://down.test/pkg-1.2.tar.gz\"]\nchecksum: \"{}\"\n",
            checksum
        ),
    )
    .unwrap();

    let mut fetcher = MockFetcher::new();
    fetcher
        .expect_fetch()
        .times(3)
        .returning(move |urls: Vec<String>, _dest: &Path| match urls[0].as_str() {
            "http://example.test/pkg-1.2.tar.gz" => FetchOutcome::Fetched {
                path: archive.clone(),
                checksums: vec![],
            },
            "http://mirror.test/pkg-1.2.tar.gz" => FetchOutcome::Fetched {
                path: other.clone(),
                checksums: vec![],
            },
            _ => FetchOutcome::NotAvailable {
                reason: "connection refused".to_string(),
            },
        });

    let report = validate_bundle(&bundle, &fetcher).await;
    assert_eq!(
        report.url.warnings,
        vec![
            "bad checksum for http://mirror.test/pkg-1.2.tar.gz".to_string(),
            "source at http://down.test/pkg-1.2.tar.gz is not available: connection refused"
                .to_string(),
        ]
    );
    assert!(report.shape.passed() && report.manifest.passed() && report.descr.passed());
}

#[tokio::test]
async fn test_missing_checksum_is_reported() {
    let (_tmp, archive, bundle) = fixture();
    let fetcher = serving(archive);
    fs::write(bundle.join("url"), "src: \"http://example.test/pkg-1.2.tar.gz\"\n").unwrap();

    let report = validate_bundle(&bundle, &fetcher).await;
    assert_eq!(report.url.warnings, vec!["no checksum".to_string()]);
}
