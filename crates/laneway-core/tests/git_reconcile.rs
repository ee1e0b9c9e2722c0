//! Reconciler against real repositories built with the `git` binary.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use laneway_core::config::ProjectConfig;
use laneway_core::emit::{TransitionRequest, emit_transition};
use laneway_core::lane::Lane;
use laneway_core::reconcile::{GitCli, Phase, RepoHistory, reconcile, reconcile_project};
use laneway_core::store::EventLogStore;

const FEATURE: &str = "034-auth-retry";

fn git(repo: &Path, args: &[&str]) {
    let status = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(args)
        .env("GIT_AUTHOR_NAME", "Dev")
        .env("GIT_AUTHOR_EMAIL", "dev@example.test")
        .env("GIT_COMMITTER_NAME", "Dev")
        .env("GIT_COMMITTER_EMAIL", "dev@example.test")
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("HOME", repo)
        .output()
        .expect("spawn git");
    assert!(
        status.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&status.stderr)
    );
}

fn commit(repo: &Path, file: &str, message: &str) {
    std::fs::write(repo.join(file), message).expect("write file");
    git(repo, &["add", file]);
    git(repo, &["commit", "-q", "-m", message]);
}

/// `main` with one commit, plus:
/// - `034-auth-retry-WP01` with one commit of its own (unmerged)
/// - `034-auth-retry-WP02` merged into main with `--no-ff`
/// - `034-auth-retry-WP03` created but never committed to
/// - a commit on main whose subject names WP04
fn fixture_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("temp dir");
    let repo = dir.path();
    git(repo, &["init", "-q", "-b", "main"]);
    commit(repo, "README", "initial");

    git(repo, &["checkout", "-q", "-b", "034-auth-retry-WP01"]);
    commit(repo, "wp01.txt", "retry loop skeleton");
    git(repo, &["checkout", "-q", "main"]);

    git(repo, &["checkout", "-q", "-b", "034-auth-retry-WP02"]);
    commit(repo, "wp02.txt", "backoff settings");
    git(repo, &["checkout", "-q", "main"]);
    git(
        repo,
        &["merge", "-q", "--no-ff", "-m", "merge WP02", "034-auth-retry-WP02"],
    );

    git(repo, &["branch", "034-auth-retry-WP03"]);
    commit(repo, "notes.txt", "feat(034-auth-retry): WP04 docs stub");
    dir
}

#[test]
fn scan_links_branches_and_messages() {
    let dir = fixture_repo();
    let cli = GitCli::open(dir.path()).expect("open");
    let scan = cli.scan_commits(FEATURE).expect("scan");

    assert!(!scan.timed_out);
    assert_eq!(scan.commits["WP01"].len(), 1);
    assert_eq!(scan.commits["WP01"][0].message, "retry loop skeleton");
    assert_eq!(
        scan.commits["WP01"][0].branch.as_deref(),
        Some("034-auth-retry-WP01")
    );
    assert_eq!(scan.commits["WP02"].len(), 1);
    assert!(!scan.commits.contains_key("WP03"));
    assert!(scan.commits["WP04"][0].branch.is_none());
}

#[test]
fn merged_ignores_fresh_branches() {
    let dir = fixture_repo();
    let cli = GitCli::open(dir.path()).expect("open");
    let merged = cli.merged_wps(FEATURE).expect("merged");
    assert_eq!(merged.into_iter().collect::<Vec<_>>(), vec!["WP02"]);
}

#[test]
fn fast_forward_merge_counts_when_tip_names_the_wp() {
    let dir = tempfile::tempdir().expect("temp dir");
    let repo = dir.path();
    git(repo, &["init", "-q", "-b", "main"]);
    commit(repo, "README", "initial");

    git(repo, &["checkout", "-q", "-b", "034-auth-retry-WP05"]);
    commit(repo, "wp05.txt", "WP05 token parser");
    git(repo, &["checkout", "-q", "main"]);
    git(repo, &["merge", "-q", "--ff-only", "034-auth-retry-WP05"]);
    // Cut after the fast-forward: its tip is WP05's commit, not its own.
    git(repo, &["branch", "034-auth-retry-WP06"]);

    let cli = GitCli::open(repo).expect("open");
    let merged = cli.merged_wps(FEATURE).expect("merged");
    assert_eq!(merged.into_iter().collect::<Vec<_>>(), vec!["WP05"]);
}

#[test]
fn no_matches_is_an_empty_scan() {
    let dir = fixture_repo();
    let cli = GitCli::open(dir.path()).expect("open");
    let scan = cli.scan_commits("999-nothing").expect("scan");
    assert!(scan.commits.is_empty());
}

#[test]
fn zero_budget_returns_partial_results() {
    let dir = fixture_repo();
    let cli = GitCli::open(dir.path())
        .expect("open")
        .with_timeout(Duration::ZERO);
    let scan = cli.scan_commits(FEATURE).expect("scan");
    assert!(scan.timed_out);
    assert!(scan.commits.is_empty());
}

#[test]
fn plain_directory_is_not_a_repository() {
    let dir = tempfile::tempdir().expect("temp dir");
    assert!(GitCli::open(dir.path()).is_err());
}

#[test]
fn apply_against_real_history() {
    let dir = fixture_repo();
    let store = EventLogStore::new(dir.path().join("features"));
    for to in [Lane::Claimed, Lane::InProgress] {
        emit_transition(&store, TransitionRequest::new(FEATURE, "WP02", to, "dev")).unwrap();
    }

    let cli = GitCli::open(dir.path()).expect("open");
    let result = reconcile(&store, FEATURE, &[&cli], Phase::DualWrite, false).expect("apply");

    let proposals: Vec<_> = result
        .suggested_events
        .iter()
        .map(|e| (e.wp_id.as_str(), e.from_lane, e.to_lane))
        .collect();
    assert_eq!(
        proposals,
        vec![
            ("WP01", Lane::Planned, Lane::Claimed),
            ("WP02", Lane::InProgress, Lane::ForReview),
            ("WP04", Lane::Planned, Lane::Claimed),
        ]
    );
    assert!(result.errors.is_empty());
    assert_eq!(store.read_events(FEATURE).unwrap().len(), 5);
}

#[test]
fn project_config_records_missing_repos() {
    let dir = fixture_repo();
    let mut config = ProjectConfig::default();
    config.reconcile.repos.push("does-not-exist".into());

    let result = reconcile_project(dir.path(), &config, FEATURE, true).expect("dry run");
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.repos_scanned, 1);
    assert!(result.drift_detected);
    assert!(!config.status.store(dir.path()).events_path(FEATURE).exists());
}
