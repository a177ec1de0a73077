use serial_test::serial;
use std::env;
use std::fs::{self, write};
use std::path::PathBuf;
use tempfile::{tempdir, NamedTempFile};

use opam_publish::load_config::{environment_context_from, load_config, read_config_file};

/// Every key is optional; an explicit file overrides the defaults it names.
#[test]
#[serial]
fn test_load_config_from_explicit_file() {
    env::remove_var("OPAM_PUBLISH_ROOT");
    let config_yaml = r#"
root: /srv/opam-publish
forge:
  host: github.example.com
  api_url: https://github.example.com/api/v3/
default_repo: example/opam-repository
fork_poll:
  attempts: 5
"#;
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), config_yaml).unwrap();

    let config = load_config(Some(config_file.path())).expect("Config should load");

    assert_eq!(config.root, PathBuf::from("/srv/opam-publish"));
    assert_eq!(config.forge.host, "github.example.com");
    assert_eq!(config.forge.api_url, "https://github.example.com/api/v3");
    assert_eq!(config.default_repo, "example/opam-repository");
    assert_eq!(config.fork_poll.attempts, 5);
    assert_eq!(config.fork_poll.interval_ms, 1500);
    assert_eq!(config.token_note, "opam-publish access token");
}

#[test]
#[serial]
fn test_root_env_overrides_file_and_default() {
    let root = tempdir().unwrap();
    env::set_var("OPAM_PUBLISH_ROOT", root.path());
    write(root.path().join("config.yaml"), "root: /elsewhere\ntoken_note: custom\n").unwrap();

    let config = load_config(None).expect("Config should load");
    env::remove_var("OPAM_PUBLISH_ROOT");

    assert_eq!(config.root, root.path());
    assert_eq!(config.token_note, "custom");
    assert_eq!(config.mirror_dir("default"), root.path().join("repos/default"));
    assert_eq!(config.default_repo, "ocaml/opam-repository");
}

#[test]
#[serial]
fn test_defaults_without_config_file() {
    let root = tempdir().unwrap();
    env::set_var("OPAM_PUBLISH_ROOT", root.path());
    let config = load_config(None).expect("Config should load");
    env::remove_var("OPAM_PUBLISH_ROOT");

    assert_eq!(config.forge.host, "github.com");
    assert_eq!(config.forge.api_url, "https://api.github.com");
    assert_eq!(config.fork_poll.attempts, 20);
}

#[test]
#[serial]
fn test_invalid_config_files() {
    let cases = [
        ("default_repo: nope\n", "Invalid default_repo"),
        ("fork_poll:\n  attempts: 0\n", "at least 1"),
        ("colour: blue\n", "Failed to parse config YAML"),
    ];
    for (yaml, expected) in cases {
        let config_file = NamedTempFile::new().expect("temp file");
        write(config_file.path(), yaml).unwrap();
        let err = load_config(Some(config_file.path())).expect_err(yaml);
        assert!(
            err.to_string().contains(expected),
            "{:?}: got {}",
            yaml,
            err
        );
    }
}

#[test]
fn test_missing_explicit_file_fails() {
    let dir = tempdir().unwrap();
    let err = read_config_file(dir.path().join("absent.yaml")).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
fn test_environment_context() {
    let opam_root = tempdir().unwrap();

    let none = environment_context_from(None, Some("4.14".to_string()));
    assert_eq!(none.overlay_root, None);

    let unset = environment_context_from(Some(opam_root.path().to_path_buf()), None);
    assert_eq!(unset.overlay_root, None);

    fs::write(
        opam_root.path().join("config"),
        "opam-version: \"1.2\"\nswitch: \"4.14.1\"\njobs: 4\n",
    )
    .unwrap();
    let configured = environment_context_from(Some(opam_root.path().to_path_buf()), None);
    assert_eq!(
        configured.overlay_dir("pkg"),
        Some(opam_root.path().join("4.14.1/overlay/pkg"))
    );

    let explicit =
        environment_context_from(Some(opam_root.path().to_path_buf()), Some("dev".to_string()));
    assert_eq!(
        explicit.overlay_root,
        Some(opam_root.path().join("dev/overlay"))
    );
}
