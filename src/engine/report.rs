// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Results of engine operations.

use crate::{
    engine::marker::ActiveProfileMarker,
    store::{Snapshot, SnapshotRef},
    tunable::Value,
};

use std::fmt::{Display, Formatter, Result as FmtResult};

/// How apply should treat the host.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Write desired values.
    #[default]
    Real,

    /// Only report what would be written.
    DryRun,
}

/// What happened to a single tunable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Desired value was written over the prior one.
    Applied { from: Value, to: Value },

    /// Tunable does not exist on this host, or has no target for it.
    SkippedUnsupported,

    /// Write was attempted and failed.
    Failed(String),

    /// Dry run would write the desired value over the current one.
    Planned { current: Value, desired: Value },

    /// Prior value was written back.
    Restored(Value),
}

impl Outcome {
    /// Check if tunable reached the state the operation aimed for.
    pub fn is_effective(&self) -> bool {
        matches!(self, Self::Applied { .. } | Self::Planned { .. } | Self::Restored(_))
    }
}

impl Display for Outcome {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Applied { from, to } => write!(fmt, "applied ({from} -> {to})"),
            Self::SkippedUnsupported => fmt.write_str("skipped-unsupported"),
            Self::Failed(reason) => write!(fmt, "failed: {reason}"),
            Self::Planned { current, desired } => write!(fmt, "planned ({current} -> {desired})"),
            Self::Restored(value) => write!(fmt, "restored ({value})"),
        }
    }
}

/// Outcome of a named tunable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunableOutcome {
    pub tunable: String,
    pub outcome: Outcome,
}

impl TunableOutcome {
    pub fn new(tunable: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            tunable: tunable.into(),
            outcome,
        }
    }
}

/// Summary of an operation over all its tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overall {
    /// Every tunable reached its target.
    Complete,

    /// Some tunables failed or were skipped.
    Partial,

    /// Nothing could be written.
    Failed,
}

impl Overall {
    /// Summarize apply outcomes.
    ///
    /// Apply only counts as failed when not a single tunable was written.
    pub fn of_apply(outcomes: &[TunableOutcome]) -> Self {
        let effective = outcomes.iter().filter(|entry| entry.outcome.is_effective()).count();
        if effective == 0 {
            Self::Failed
        } else if effective == outcomes.len() {
            Self::Complete
        } else {
            Self::Partial
        }
    }

    /// Summarize restore outcomes.
    ///
    /// Records that were skipped never needed restoring, so they do not count
    /// against the result.
    pub fn of_restore(outcomes: &[TunableOutcome]) -> Self {
        let attempted = outcomes
            .iter()
            .filter(|entry| entry.outcome != Outcome::SkippedUnsupported)
            .collect::<Vec<_>>();
        let restored = attempted.iter().filter(|entry| entry.outcome.is_effective()).count();
        if attempted.is_empty() || restored == attempted.len() {
            Self::Complete
        } else if restored == 0 {
            Self::Failed
        } else {
            Self::Partial
        }
    }

    /// Process exit code for this result.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Complete => 0,
            Self::Partial => 1,
            Self::Failed => 2,
        }
    }
}

impl Display for Overall {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Failed => "failed",
        })
    }
}

/// Result of applying a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    pub profile: String,
    pub mode: Mode,

    /// Reference of persisted snapshot, absent for a dry run.
    pub snapshot_ref: Option<SnapshotRef>,

    /// Snapshot as recorded, or as it would have been for a dry run.
    pub snapshot: Snapshot,

    /// Outcomes in profile declaration order.
    pub outcomes: Vec<TunableOutcome>,
    pub overall: Overall,
}

/// Result of restoring a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreResult {
    pub snapshot_ref: SnapshotRef,
    pub profile: String,

    /// Outcomes in snapshot record order.
    pub outcomes: Vec<TunableOutcome>,
    pub overall: Overall,

    /// Active profile marker was removed.
    pub marker_cleared: bool,
}

/// How a live value compares with a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunableState {
    Matches(Value),
    Diverged { live: Value, desired: Value },
    Unsupported,
}

impl Display for TunableState {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Matches(value) => write!(fmt, "matches ({value})"),
            Self::Diverged { live, desired } => write!(fmt, "diverged ({live}, want {desired})"),
            Self::Unsupported => fmt.write_str("unsupported"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub tunable: String,
    pub state: TunableState,
}

/// Live state of tunables compared with a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Active profile marker, if a profile is applied.
    pub active: Option<ActiveProfileMarker>,

    /// Profile the entries were compared against.
    pub profile: Option<String>,
    pub entries: Vec<StatusEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    fn applied() -> TunableOutcome {
        TunableOutcome::new("a", Outcome::Applied { from: "0".into(), to: "1".into() })
    }

    fn skipped() -> TunableOutcome {
        TunableOutcome::new("b", Outcome::SkippedUnsupported)
    }

    fn failed() -> TunableOutcome {
        TunableOutcome::new("c", Outcome::Failed("denied".into()))
    }

    fn restored() -> TunableOutcome {
        TunableOutcome::new("d", Outcome::Restored("0".into()))
    }

    #[test_case(vec![applied(), applied()], Overall::Complete; "all written")]
    #[test_case(vec![applied(), skipped()], Overall::Partial; "some skipped")]
    #[test_case(vec![applied(), failed()], Overall::Partial; "some failed")]
    #[test_case(vec![skipped(), failed()], Overall::Failed; "nothing written")]
    #[test_case(vec![], Overall::Failed; "empty profile")]
    #[test]
    fn summarize_apply(outcomes: Vec<TunableOutcome>, expect: Overall) {
        pretty_assertions::assert_eq!(Overall::of_apply(&outcomes), expect);
    }

    #[test_case(vec![restored(), skipped()], Overall::Complete; "skipped records ignored")]
    #[test_case(vec![restored(), failed()], Overall::Partial; "some failed")]
    #[test_case(vec![failed()], Overall::Failed; "all failed")]
    #[test_case(vec![skipped()], Overall::Complete; "nothing to restore")]
    #[test]
    fn summarize_restore(outcomes: Vec<TunableOutcome>, expect: Overall) {
        pretty_assertions::assert_eq!(Overall::of_restore(&outcomes), expect);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(Overall::Complete.exit_code(), 0);
        assert_eq!(Overall::Partial.exit_code(), 1);
        assert_eq!(Overall::Failed.exit_code(), 2);
    }
}
