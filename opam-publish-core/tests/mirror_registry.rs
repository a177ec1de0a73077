use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use opam_publish_core::config::{ForkPoll, PublishConfig};
use opam_publish_core::contract::{MockForge, MockGit, RepoId};
use opam_publish_core::error::PublishError;
use opam_publish_core::mirror::{wait_for_fork, MirrorManager};
use opam_publish_core::registry::{parse_remote_url, MirrorState, Registry};
use tempfile::tempdir;

type Remotes = Arc<Mutex<HashMap<String, String>>>;

/// A git double whose remotes live in memory. `clone_repo` creates the directory.
fn git_with_remotes(remotes: Remotes) -> MockGit {
    let mut git = MockGit::new();
    let cloned = remotes.clone();
    git.expect_clone_repo()
        .returning(move |url: &str, dir: &Path| {
            fs::create_dir_all(dir).unwrap();
            cloned
                .lock()
                .unwrap()
                .insert("origin".to_string(), url.to_string());
            Ok(())
        });
    let added = remotes.clone();
    git.expect_remote_add()
        .returning(move |_dir: &Path, name: &str, url: &str| {
            added
                .lock()
                .unwrap()
                .insert(name.to_string(), url.to_string());
            Ok(())
        });
    git.expect_remote_url()
        .returning(move |_dir: &Path, name: &str| Ok(remotes.lock().unwrap().get(name).cloned()));
    git
}

fn quick_poll(attempts: u32) -> ForkPoll {
    ForkPoll {
        interval_ms: 1,
        attempts,
    }
}

#[test]
fn test_parse_remote_url() {
    let cases = [
        ("git@github.com:ocaml/opam-repository", Some(("github.com", "ocaml", "opam-repository"))),
        ("git@github.com:ocaml/opam-repository.git", Some(("github.com", "ocaml", "opam-repository"))),
        ("github.com:alice/opam-repository", Some(("github.com", "alice", "opam-repository"))),
        ("https://github.com/alice/opam-repository.git", Some(("github.com", "alice", "opam-repository"))),
        ("ssh://git@git.example.com:2222/team/repo", Some(("git.example.com", "team", "repo"))),
        ("/srv/git/opam-repository", None),
        ("git@github.com:opam-repository", None),
    ];
    for (url, expected) in cases {
        let parsed = parse_remote_url(url);
        let expected = expected.map(|(host, owner, name)| (host.to_string(), RepoId::new(owner, name)));
        assert_eq!(parsed, expected, "{}", url);
    }
}

#[test]
fn test_repo_id_from_str() {
    assert_eq!(
        "ocaml/opam-repository".parse::<RepoId>().unwrap(),
        RepoId::new("ocaml", "opam-repository")
    );
    assert!("opam-repository".parse::<RepoId>().is_err());
    assert!("a/b/c".parse::<RepoId>().is_err());
}

#[test]
fn test_identity_and_user_come_from_remotes() {
    let tmp = tempdir().unwrap();
    let config = PublishConfig::with_root(tmp.path());
    fs::create_dir_all(config.mirror_dir("default")).unwrap();
    let remotes: Remotes = Arc::default();
    remotes.lock().unwrap().insert(
        "origin".to_string(),
        "git@github.com:ocaml/opam-repository".to_string(),
    );
    let git = git_with_remotes(remotes.clone());
    let registry = Registry::new(&config, &git);

    assert_eq!(registry.state("default").unwrap(), MirrorState::Cloned);
    assert_eq!(
        registry.identity("default").unwrap(),
        RepoId::new("ocaml", "opam-repository")
    );
    assert_eq!(registry.user("default").unwrap(), None);

    remotes.lock().unwrap().insert(
        "user".to_string(),
        "git@github.com:alice/opam-repository".to_string(),
    );
    assert_eq!(registry.state("default").unwrap(), MirrorState::Forked);
    assert_eq!(registry.user("default").unwrap(), Some("alice".to_string()));
    assert_eq!(registry.state("missing").unwrap(), MirrorState::Unregistered);
    assert!(matches!(
        registry.identity("missing"),
        Err(PublishError::UnknownLabel { .. })
    ));
}

#[test]
fn test_label_cannot_rebind_or_change_user() {
    let tmp = tempdir().unwrap();
    let config = PublishConfig::with_root(tmp.path());
    fs::create_dir_all(config.mirror_dir("default")).unwrap();
    let remotes: Remotes = Arc::default();
    {
        let mut map = remotes.lock().unwrap();
        map.insert("origin".to_string(), "git@github.com:ocaml/opam-repository".to_string());
        map.insert("user".to_string(), "git@github.com:alice/opam-repository".to_string());
    }
    let git = git_with_remotes(remotes);
    let registry = Registry::new(&config, &git);

    assert!(registry
        .check_repo("default", &RepoId::new("ocaml", "opam-repository"))
        .is_ok());
    match registry.check_repo("default", &RepoId::new("janestreet", "opam-repository")) {
        Err(PublishError::LabelRebind { existing, requested, .. }) => {
            assert_eq!(existing, "ocaml/opam-repository");
            assert_eq!(requested, "janestreet/opam-repository");
        }
        other => panic!("expected LabelRebind, got {:?}", other),
    }

    assert_eq!(
        registry.check_user("default", None).unwrap(),
        Some("alice".to_string())
    );
    assert_eq!(
        registry.check_user("default", Some("alice")).unwrap(),
        Some("alice".to_string())
    );
    assert!(matches!(
        registry.check_user("default", Some("bob")),
        Err(PublishError::UserMismatch { recorded, requested, .. }) if recorded == "alice" && requested == "bob"
    ));
}

#[test]
fn test_list_and_remove_labels() {
    let tmp = tempdir().unwrap();
    let config = PublishConfig::with_root(tmp.path());
    for label in ["work", "default"] {
        fs::create_dir_all(config.mirror_dir(label)).unwrap();
    }
    let remotes: Remotes = Arc::default();
    remotes.lock().unwrap().insert(
        "origin".to_string(),
        "git@github.com:ocaml/opam-repository".to_string(),
    );
    let git = git_with_remotes(remotes);
    let registry = Registry::new(&config, &git);

    let listed = registry.list().unwrap();
    let labels: Vec<&str> = listed.iter().map(|m| m.label.as_str()).collect();
    assert_eq!(labels, vec!["default", "work"]);

    registry.remove("work").unwrap();
    assert!(!config.mirror_dir("work").exists());
    assert_eq!(registry.labels().unwrap(), vec!["default".to_string()]);
    assert!(matches!(
        registry.remove("work"),
        Err(PublishError::UnknownLabel { .. })
    ));
}

#[tokio::test]
async fn test_fork_poll_returns_on_first_check() {
    let mut forge = MockForge::new();
    forge
        .expect_repo_exists()
        .times(1)
        .returning(|_token: &str, _repo: &RepoId| Ok(true));

    let fork = RepoId::new("alice", "opam-repository");
    wait_for_fork(&forge, "token", &fork, &quick_poll(20))
        .await
        .expect("fork already exists");
}

#[tokio::test]
async fn test_fork_poll_times_out() {
    let mut forge = MockForge::new();
    forge
        .expect_repo_exists()
        .times(3)
        .returning(|_token: &str, _repo: &RepoId| Ok(false));

    let fork = RepoId::new("alice", "opam-repository");
    let result = wait_for_fork(&forge, "token", &fork, &quick_poll(3)).await;
    assert!(matches!(
        result,
        Err(PublishError::ForkTimeout { attempts: 3, .. })
    ));
}

#[tokio::test]
async fn test_register_clones_and_forks() {
    let tmp = tempdir().unwrap();
    let mut config = PublishConfig::with_root(tmp.path());
    config.fork_poll = quick_poll(5);
    let remotes: Remotes = Arc::default();
    let git = git_with_remotes(remotes.clone());

    let polls = Arc::new(Mutex::new(0));
    let seen = polls.clone();
    let mut forge = MockForge::new();
    forge
        .expect_create_fork()
        .times(1)
        .returning(|_token: &str, repo: &RepoId| {
            assert_eq!(repo.to_string(), "ocaml/opam-repository");
            Ok(())
        });
    forge
        .expect_repo_exists()
        .times(2)
        .returning(move |_token: &str, repo: &RepoId| {
            assert_eq!(repo.to_string(), "alice/opam-repository");
            let mut count = seen.lock().unwrap();
            *count += 1;
            Ok(*count > 1)
        });

    let manager = MirrorManager::new(&config, &git);
    let repo = RepoId::new("ocaml", "opam-repository");
    let info = manager
        .register("default", &repo, "alice", &forge, "token")
        .await
        .expect("register succeeds");

    assert_eq!(info.repo, repo);
    assert_eq!(info.user.as_deref(), Some("alice"));
    assert_eq!(info.dir, config.mirror_dir("default"));
    assert_eq!(*polls.lock().unwrap(), 2);
    let remotes = remotes.lock().unwrap();
    assert_eq!(remotes["origin"], "git@github.com:ocaml/opam-repository");
    assert_eq!(remotes["user"], "git@github.com:alice/opam-repository");
}

#[tokio::test]
async fn test_register_refuses_other_user() {
    let tmp = tempdir().unwrap();
    let config = PublishConfig::with_root(tmp.path());
    fs::create_dir_all(config.mirror_dir("default")).unwrap();
    let remotes: Remotes = Arc::default();
    {
        let mut map = remotes.lock().unwrap();
        map.insert("origin".to_string(), "git@github.com:ocaml/opam-repository".to_string());
        map.insert("user".to_string(), "git@github.com:alice/opam-repository".to_string());
    }
    let git = git_with_remotes(remotes);
    let forge = MockForge::new();

    let manager = MirrorManager::new(&config, &git);
    let result = manager
        .register(
            "default",
            &RepoId::new("ocaml", "opam-repository"),
            "bob",
            &forge,
            "token",
        )
        .await;
    assert!(matches!(result, Err(PublishError::UserMismatch { .. })));
}

#[test]
fn test_sync_resets_to_upstream_default_branch() {
    let tmp = tempdir().unwrap();
    let config = PublishConfig::with_root(tmp.path());
    fs::create_dir_all(config.mirror_dir("default")).unwrap();
    let remotes: Remotes = Arc::default();
    {
        let mut map = remotes.lock().unwrap();
        map.insert("origin".to_string(), "git@github.com:ocaml/opam-repository".to_string());
        map.insert("user".to_string(), "git@github.com:alice/opam-repository".to_string());
    }
    let mut git = git_with_remotes(remotes);
    git.expect_fetch()
        .times(1)
        .returning(|_dir: &Path, remotes: &[String]| {
            assert_eq!(remotes, ["origin".to_string(), "user".to_string()]);
            Ok(())
        });
    git.expect_default_branch()
        .returning(|_dir: &Path, remote: &str| {
            assert_eq!(remote, "origin");
            Ok("main".to_string())
        });
    git.expect_reset_hard()
        .times(1)
        .returning(|_dir: &Path, rev: &str| {
            assert_eq!(rev, "origin/main");
            Ok(())
        });

    let manager = MirrorManager::new(&config, &git);
    assert_eq!(manager.sync("default").unwrap(), "main");
    assert!(matches!(
        manager.sync("other"),
        Err(PublishError::UnknownLabel { .. })
    ));
}
