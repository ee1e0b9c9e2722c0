//! Lane state machine.
//!
//! Pure and side-effect free: callers use it to check structural legality of
//! a transition independently of any workflow policy.
//!
//! ```text
//! planned -> claimed -> in_progress -> for_review -> done
//!    ^                    |     ^          |
//!    |                    v     |          |
//!    |                   blocked           |
//!    +-------------------------------------+   (rework)
//!
//! any non-terminal lane -> canceled
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::{fmt, str::FromStr};

/// Coarse-grained lifecycle state of a work package.
///
/// Declaration order is lifecycle order; `Ord` follows it so summaries and
/// sets print in a stable, readable order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Planned,
    Claimed,
    #[serde(alias = "doing")]
    InProgress,
    ForReview,
    Done,
    Blocked,
    Canceled,
}

impl Lane {
    /// Every lane, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Planned,
        Self::Claimed,
        Self::InProgress,
        Self::ForReview,
        Self::Done,
        Self::Blocked,
        Self::Canceled,
    ];

    /// Canonical snake_case name, as written to the event log.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Claimed => "claimed",
            Self::InProgress => "in_progress",
            Self::ForReview => "for_review",
            Self::Done => "done",
            Self::Blocked => "blocked",
            Self::Canceled => "canceled",
        }
    }

    /// `done` and `canceled` accept no further unforced transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Canceled)
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown lane name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown lane '{raw}': expected one of planned, claimed, in_progress, for_review, done, blocked, canceled")]
pub struct UnknownLane {
    pub raw: String,
}

impl FromStr for Lane {
    type Err = UnknownLane;

    /// Accepts canonical names plus the legacy `doing` alias for
    /// `in_progress`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "planned" => Ok(Self::Planned),
            "claimed" => Ok(Self::Claimed),
            "in_progress" | "doing" => Ok(Self::InProgress),
            "for_review" => Ok(Self::ForReview),
            "done" => Ok(Self::Done),
            "blocked" => Ok(Self::Blocked),
            "canceled" => Ok(Self::Canceled),
            _ => Err(UnknownLane { raw: s.to_string() }),
        }
    }
}

/// Lanes reachable from `from` in a single unforced hop.
#[must_use]
pub fn legal_transitions(from: Lane) -> BTreeSet<Lane> {
    let forward: &[Lane] = match from {
        Lane::Planned => &[Lane::Claimed],
        Lane::Claimed => &[Lane::InProgress],
        Lane::InProgress => &[Lane::ForReview, Lane::Blocked],
        Lane::ForReview => &[Lane::Done, Lane::Planned],
        Lane::Blocked => &[Lane::InProgress],
        Lane::Done | Lane::Canceled => &[],
    };

    let mut out: BTreeSet<Lane> = forward.iter().copied().collect();
    if !from.is_terminal() {
        out.insert(Lane::Canceled);
    }
    out
}

/// Whether `from -> to` is a single legal hop.
#[must_use]
pub fn is_legal(from: Lane, to: Lane) -> bool {
    legal_transitions(from).contains(&to)
}

/// Decompose `from -> to` into the shortest sequence of legal single hops.
///
/// Returns an empty list when `to` is unreachable or equal to `from`.
#[must_use]
pub fn advancement_chain(from: Lane, to: Lane) -> Vec<(Lane, Lane)> {
    if from == to {
        return Vec::new();
    }

    let mut previous: HashMap<Lane, Lane> = HashMap::new();
    let mut frontier = VecDeque::from([from]);

    while let Some(lane) = frontier.pop_front() {
        for next in legal_transitions(lane) {
            if next == from || previous.contains_key(&next) {
                continue;
            }
            previous.insert(next, lane);
            if next == to {
                return walk_back(&previous, from, to);
            }
            frontier.push_back(next);
        }
    }

    Vec::new()
}

fn walk_back(previous: &HashMap<Lane, Lane>, from: Lane, to: Lane) -> Vec<(Lane, Lane)> {
    let mut hops = Vec::new();
    let mut cursor = to;
    while cursor != from {
        let Some(&prior) = previous.get(&cursor) else {
            return Vec::new();
        };
        hops.push((prior, cursor));
        cursor = prior;
    }
    hops.reverse();
    hops
}
