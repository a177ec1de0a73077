use std::cmp::Ordering;

use opam_publish_core::error::PublishError;
use opam_publish_core::package::{compare_versions, PackageId};

#[test]
fn test_branch_name_is_deterministic() {
    struct TestCase {
        name: &'static str,
        version: &'static str,
        expected: &'static str,
    }

    let cases = [
        TestCase {
            name: "pkg",
            version: "1.2",
            expected: "pkg.1.2",
        },
        TestCase {
            name: "lwt_ssl",
            version: "1.0-rc1",
            expected: "lwt_ssl.1.0-rc1",
        },
        TestCase {
            name: "foo+bar",
            version: "1.0+beta",
            expected: "foo-bar.1.0-beta",
        },
        TestCase {
            name: "foo",
            version: "1.0~beta",
            expected: "foo.1.0-beta",
        },
    ];

    for case in cases {
        let id = PackageId::new(case.name, case.version).unwrap();
        assert_eq!(id.branch_name(), case.expected);
        let again = PackageId::new(case.name, case.version).unwrap();
        assert_eq!(id.branch_name(), again.branch_name());
    }
}

#[test]
fn test_substituted_characters_share_a_branch() {
    let plus = PackageId::new("foo", "1.0+beta").unwrap();
    let tilde = PackageId::new("foo", "1.0~beta").unwrap();
    assert_ne!(plus, tilde);
    assert_eq!(plus.branch_name(), tilde.branch_name());
}

#[test]
fn test_paths_derive_from_identifier() {
    let id = PackageId::parse("pkg.1.2.3").unwrap();
    assert_eq!(id.name(), "pkg");
    assert_eq!(id.version(), "1.2.3");
    assert_eq!(id.dir_name(), "pkg.1.2.3");
    assert_eq!(id.repo_path(), "packages/pkg/pkg.1.2.3");
}

#[test]
fn test_rejects_invalid_identifiers() {
    for input in ["pkg", ".1.0", "pkg.", "-pkg.1.0", "p/kg.1.0", "pkg.1 0"] {
        let result = PackageId::parse(input);
        assert!(
            matches!(result, Err(PublishError::InvalidPackage { .. })),
            "{} should be rejected, got {:?}",
            input,
            result
        );
    }
}

#[test]
fn test_version_ordering() {
    let cases = [
        ("1.0", "1.0", Ordering::Equal),
        ("1.2", "1.10", Ordering::Less),
        ("1.0~beta", "1.0", Ordering::Less),
        ("1.0", "1.0.1", Ordering::Less),
        ("1.0a", "1.0+", Ordering::Less),
        ("2.0", "1.99", Ordering::Greater),
        ("0.9", "v1", Ordering::Less),
    ];
    for (a, b, expected) in cases {
        assert_eq!(compare_versions(a, b), expected, "{} vs {}", a, b);
    }
}
