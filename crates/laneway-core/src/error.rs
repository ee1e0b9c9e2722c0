use std::fmt;

/// Machine-readable error codes for agent-friendly decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    IllegalTransition,
    StaleFromLane,
    TerminalLane,
    MissingReviewEvidence,
    MissingForceReason,
    FeatureMismatch,
    CorruptEventLog,
    EventLogWriteFailed,
    SnapshotWriteFailed,
    LockContention,
    RepositoryNotFound,
    GitCommandFailed,
    ReconcileDisabled,
    ClockPersistFailed,
    QueueStorageFailed,
    ClockOverflow,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::IllegalTransition => "E2001",
            Self::StaleFromLane => "E2002",
            Self::TerminalLane => "E2003",
            Self::MissingReviewEvidence => "E2004",
            Self::MissingForceReason => "E2005",
            Self::FeatureMismatch => "E2006",
            Self::CorruptEventLog => "E3001",
            Self::EventLogWriteFailed => "E5001",
            Self::SnapshotWriteFailed => "E5002",
            Self::LockContention => "E5003",
            Self::RepositoryNotFound => "E6001",
            Self::GitCommandFailed => "E6002",
            Self::ReconcileDisabled => "E6003",
            Self::ClockPersistFailed => "E7001",
            Self::QueueStorageFailed => "E7002",
            Self::ClockOverflow => "E7003",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::IllegalTransition => "Illegal lane transition",
            Self::StaleFromLane => "Transition source lane does not match current lane",
            Self::TerminalLane => "Work package is in a terminal lane",
            Self::MissingReviewEvidence => "Transition to done requires review evidence",
            Self::MissingForceReason => "Forced transition requires a reason",
            Self::FeatureMismatch => "Event belongs to a different feature",
            Self::CorruptEventLog => "Corrupt status event log",
            Self::EventLogWriteFailed => "Status event log write failed",
            Self::SnapshotWriteFailed => "Status snapshot write failed",
            Self::LockContention => "Lock contention",
            Self::RepositoryNotFound => "Git repository not found",
            Self::GitCommandFailed => "Git command failed",
            Self::ReconcileDisabled => "Reconciliation apply is disabled at this phase",
            Self::ClockPersistFailed => "Lamport clock persistence failed",
            Self::QueueStorageFailed => "Offline queue storage failed",
            Self::ClockOverflow => "Lamport clock reached its maximum value",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and agents.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in .laneway/config.toml and retry."),
            Self::IllegalTransition => Some(
                "Follow planned -> claimed -> in_progress -> for_review -> done, or pass force with a reason.",
            ),
            Self::StaleFromLane => Some("Re-read the current lane and retry the transition."),
            Self::TerminalLane => Some("Terminal lanes only change through a forced override."),
            Self::MissingReviewEvidence => Some("Attach evidence with a reviewer and verdict."),
            Self::MissingForceReason => Some("Supply a reason explaining the override."),
            Self::FeatureMismatch => None,
            Self::CorruptEventLog => {
                Some("Inspect status.events.jsonl; only the trailing line may be repaired.")
            }
            Self::EventLogWriteFailed | Self::SnapshotWriteFailed => {
                Some("Check disk space and write permissions.")
            }
            Self::LockContention => Some("Retry after the other writer releases its lock."),
            Self::RepositoryNotFound => Some("Check the repository path passed to reconcile."),
            Self::GitCommandFailed => Some("Run the git command by hand to see the full error."),
            Self::ReconcileDisabled => {
                Some("Use a dry run, or raise [status] phase in .laneway/config.toml.")
            }
            Self::ClockPersistFailed | Self::QueueStorageFailed => {
                Some("Check disk space and permissions under ~/.laneway.")
            }
            Self::ClockOverflow => {
                Some("A peer sent an out-of-range lamport_clock; inspect the inbound event.")
            }
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
