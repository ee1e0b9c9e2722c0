//! Read-only view of git history used by the reconciler.
//!
//! [`RepoHistory`] is the seam: [`GitCli`] shells out to the `git` binary,
//! tests and other hosts can plug in their own source of commits.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ErrorCode;

static WP_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bWP(\d+)").expect("WP_ID_RE regex should compile"));

/// Default wall-clock budget for one repository scan.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(30);

/// Commits read per WP branch.
const BRANCH_LOG_LIMIT: usize = 20;

const FIELD_SEP: char = '\u{1f}';
const RECORD_SEP: char = '\u{1e}';
const LOG_FORMAT: &str = "--format=%H%x1f%an%x1f%aI%x1f%s%x1e";

/// One commit linked to a work package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitInfo {
    pub sha: String,
    /// Branch the commit was found on; `None` for message-grep hits.
    pub branch: Option<String>,
    pub message: String,
    pub author: String,
    pub date: DateTime<Utc>,
}

/// Commits grouped by WP id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub commits: BTreeMap<String, Vec<CommitInfo>>,
    /// The scan hit its deadline; `commits` holds what was gathered so far.
    pub timed_out: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("not a git repository: {}", .path.display())]
    NotARepository { path: PathBuf },

    #[error("failed to spawn git: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("git {args} failed ({status}): {stderr}")]
    CommandFailed {
        args: String,
        status: String,
        stderr: String,
    },

    #[error("git {args} exceeded the scan deadline")]
    Timeout { args: String },

    #[error("invalid branch pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl GitError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotARepository { .. } => ErrorCode::RepositoryNotFound,
            Self::Spawn(_)
            | Self::CommandFailed { .. }
            | Self::Timeout { .. }
            | Self::Pattern(_) => ErrorCode::GitCommandFailed,
        }
    }
}

/// Source of commit and merge evidence for one repository.
pub trait RepoHistory {
    /// Human-readable name used in details and errors.
    fn label(&self) -> String;

    /// Commits mentioning WPs of `feature_slug`, on WP branches or in
    /// commit messages.
    ///
    /// # Errors
    ///
    /// Fails when the repository cannot be queried at all. A deadline hit
    /// after some results is reported through [`ScanOutcome::timed_out`].
    fn scan_commits(&self, feature_slug: &str) -> Result<ScanOutcome, GitError>;

    /// WPs whose branch has been merged into the feature's mainline.
    ///
    /// # Errors
    ///
    /// Fails when the repository cannot be queried.
    fn merged_wps(&self, feature_slug: &str) -> Result<BTreeSet<String>, GitError>;
}

/// [`RepoHistory`] backed by the `git` command line.
#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
    mainline: Option<String>,
    timeout: Duration,
}

impl GitCli {
    /// Open a working tree or bare repository at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`GitError::NotARepository`] if `root` does not exist or git
    /// does not recognize it.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, GitError> {
        let root = root.into();
        let cli = Self {
            root,
            mainline: None,
            timeout: DEFAULT_SCAN_TIMEOUT,
        };
        if !cli.root.is_dir() {
            return Err(GitError::NotARepository { path: cli.root });
        }
        match cli.git(&["rev-parse", "--git-dir"], cli.deadline()) {
            Ok(_) => Ok(cli),
            Err(GitError::CommandFailed { .. }) => {
                Err(GitError::NotARepository { path: cli.root })
            }
            Err(err) => Err(err),
        }
    }

    /// Use `branch` as mainline instead of guessing.
    #[must_use]
    pub fn with_mainline(mut self, branch: impl Into<String>) -> Self {
        self.mainline = Some(branch.into());
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.timeout
    }

    /// Configured mainline, else the first existing of the feature branch,
    /// `main`, and `master`.
    fn resolve_mainline(
        &self,
        feature_slug: &str,
        deadline: Instant,
    ) -> Result<Option<String>, GitError> {
        if let Some(mainline) = &self.mainline {
            return Ok(Some(mainline.clone()));
        }
        for candidate in [feature_slug, "main", "master"] {
            let spec = format!("refs/heads/{candidate}");
            match self.git(&["rev-parse", "--verify", "--quiet", &spec], deadline) {
                Ok(_) => return Ok(Some(candidate.to_string())),
                Err(GitError::CommandFailed { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    fn first_parent_chain(
        &self,
        mainline: &str,
        deadline: Instant,
    ) -> Result<HashSet<String>, GitError> {
        let out = self.git(&["rev-list", "--first-parent", mainline, "--"], deadline)?;
        Ok(out.lines().map(str::to_string).collect())
    }

    /// `(branch, wp_id)` for every local or remote branch named `{slug}-WPnn`.
    fn wp_branches(
        &self,
        pattern: &Regex,
        extra: &[&str],
        deadline: Instant,
    ) -> Result<Vec<(String, String)>, GitError> {
        let mut args = vec!["branch", "-a", "--format=%(refname:short)"];
        args.extend_from_slice(extra);
        let out = self.git(&args, deadline)?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter_map(|branch| {
                pattern
                    .captures(branch)
                    .map(|caps| (branch.to_string(), caps[1].to_ascii_uppercase()))
            })
            .collect())
    }

    fn scan_inner(
        &self,
        feature_slug: &str,
        deadline: Instant,
        outcome: &mut ScanOutcome,
    ) -> Result<(), GitError> {
        let branch_pattern = branch_regex(feature_slug)?;
        let mainline_commits = match self.resolve_mainline(feature_slug, deadline)? {
            Some(mainline) => self.first_parent_chain(&mainline, deadline)?,
            None => HashSet::new(),
        };

        for (branch, wp_id) in self.wp_branches(&branch_pattern, &[], deadline)? {
            let limit = format!("-n{BRANCH_LOG_LIMIT}");
            let out = self.git(
                &["log", "--first-parent", &branch, &limit, LOG_FORMAT, "--"],
                deadline,
            )?;
            // Walk back from the tip until the branch rejoins mainline.
            let own = parse_log(&out)
                .into_iter()
                .take_while(|commit| !mainline_commits.contains(&commit.sha));
            for mut commit in own {
                commit.branch = Some(branch.clone());
                push_unique(&mut outcome.commits, &wp_id, commit);
            }
        }

        let grep = format!("--grep={}.*WP[0-9]+", ere_escape(feature_slug));
        let out = self.git(&["log", "--all", "-E", "-i", &grep, LOG_FORMAT], deadline)?;
        let message_pattern = message_regex(feature_slug)?;
        for commit in parse_log(&out) {
            for wp_id in wp_ids_in_message(&message_pattern, &commit.message) {
                push_unique(&mut outcome.commits, &wp_id, commit.clone());
            }
        }
        Ok(())
    }

    /// Run git with a deadline. Returns stdout on success.
    fn git(&self, args: &[&str], deadline: Instant) -> Result<String, GitError> {
        let rendered = args.join(" ");
        if Instant::now() >= deadline {
            return Err(GitError::Timeout { args: rendered });
        }

        let mut child = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(GitError::Spawn)?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            match child.try_wait().map_err(GitError::Spawn)? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    // Killing closes the pipes, so the readers finish.
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(GitError::Timeout { args: rendered });
                }
                None => thread::sleep(Duration::from_millis(5)),
            }
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        if !status.success() {
            return Err(GitError::CommandFailed {
                args: rendered,
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        debug!(repo = %self.root.display(), args = %rendered, "git ok");
        Ok(stdout)
    }
}

impl RepoHistory for GitCli {
    fn label(&self) -> String {
        self.root.display().to_string()
    }

    fn scan_commits(&self, feature_slug: &str) -> Result<ScanOutcome, GitError> {
        let deadline = self.deadline();
        let mut outcome = ScanOutcome::default();
        match self.scan_inner(feature_slug, deadline, &mut outcome) {
            Ok(()) => Ok(outcome),
            Err(GitError::Timeout { args }) => {
                warn!(
                    repo = %self.root.display(),
                    %args,
                    "git scan timed out; returning partial results"
                );
                outcome.timed_out = true;
                Ok(outcome)
            }
            Err(err) => Err(err),
        }
    }

    fn merged_wps(&self, feature_slug: &str) -> Result<BTreeSet<String>, GitError> {
        let deadline = self.deadline();
        let Some(mainline) = self.resolve_mainline(feature_slug, deadline)? else {
            debug!(repo = %self.root.display(), "no mainline branch; nothing counts as merged");
            return Ok(BTreeSet::new());
        };
        let chain = self.first_parent_chain(&mainline, deadline)?;
        let pattern = branch_regex(feature_slug)?;

        let mut merged = BTreeSet::new();
        for (branch, wp_id) in self.wp_branches(&pattern, &["--merged", &mainline], deadline)? {
            let tip = self.git(&["rev-parse", &branch], deadline)?;
            if !chain.contains(tip.trim()) {
                merged.insert(wp_id);
                continue;
            }
            // On the chain: either cut from mainline and never committed to,
            // or fast-forwarded. Only a tip that names the WP counts.
            let out = self.git(&["log", "-1", LOG_FORMAT, tip.trim(), "--"], deadline)?;
            let names_wp = parse_log(&out)
                .first()
                .is_some_and(|commit| mentions_wp(&commit.message, &wp_id));
            if names_wp {
                debug!(%branch, %wp_id, "fast-forward merge detected from tip message");
                merged.insert(wp_id);
            }
        }
        Ok(merged)
    }
}

// ─── private helpers ─────────────────────────────────────────────────────────

/// Read a child pipe to completion on its own thread so a chatty command
/// cannot fill the pipe and stall while we poll for exit.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn branch_regex(feature_slug: &str) -> Result<Regex, GitError> {
    let source = format!(r"^(?:.*/)?{}-(?i:(WP\d+))$", regex::escape(feature_slug));
    Ok(Regex::new(&source)?)
}

fn message_regex(feature_slug: &str) -> Result<Regex, GitError> {
    Ok(Regex::new(&format!("(?i){}", regex::escape(feature_slug)))?)
}

/// WP ids mentioned after the feature slug in a commit subject.
fn wp_ids_in_message(slug_pattern: &Regex, message: &str) -> BTreeSet<String> {
    slug_pattern.find(message).map_or_else(BTreeSet::new, |found| {
        WP_ID_RE
            .captures_iter(&message[found.end()..])
            .map(|caps| format!("WP{}", &caps[1]))
            .collect()
    })
}

fn mentions_wp(message: &str, wp_id: &str) -> bool {
    WP_ID_RE
        .captures_iter(message)
        .any(|caps| format!("WP{}", &caps[1]) == wp_id)
}

/// Escape POSIX ERE metacharacters for `git log -E --grep`.
fn ere_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if r".[]()*+?{}|^$\".contains(ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn parse_log(out: &str) -> Vec<CommitInfo> {
    out.split(RECORD_SEP)
        .map(str::trim)
        .filter(|record| !record.is_empty())
        .filter_map(|record| {
            let mut fields = record.splitn(4, FIELD_SEP);
            let sha = fields.next()?.to_string();
            let author = fields.next()?.to_string();
            let date = DateTime::parse_from_rfc3339(fields.next()?).ok()?;
            let message = fields.next().unwrap_or_default().to_string();
            Some(CommitInfo {
                sha,
                branch: None,
                message,
                author,
                date: date.with_timezone(&Utc),
            })
        })
        .collect()
}

fn push_unique(map: &mut BTreeMap<String, Vec<CommitInfo>>, wp_id: &str, commit: CommitInfo) {
    let commits = map.entry(wp_id.to_string()).or_default();
    if !commits.iter().any(|known| known.sha == commit.sha) {
        commits.push(commit);
    }
}
