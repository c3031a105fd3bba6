//! State machine rules for the migration pipeline.
//!
//! Everything that decides whether a transition is legal lives here, so the
//! store can reject invalid walks and the scheduler can reason about which
//! rows are claimable without duplicating the graph.

use super::models::{MigrationKind, RepoState};

/// States a dispatch worker may claim. Some require extra row conditions,
/// expressed by [`claim_requirement`].
pub const WORKER_CLAIMABLE: &[RepoState] = &[
    RepoState::Pending,
    RepoState::DryRunQueued,
    RepoState::DryRunInProgress,
    RepoState::DryRunFailed,
    RepoState::DryRunComplete,
    RepoState::PreMigration,
    RepoState::ArchiveGenerating,
    RepoState::QueuedForMigration,
    RepoState::MigrationFailed,
    RepoState::PostMigration,
    RepoState::MigrationComplete,
];

/// States advanced exclusively by the manager's poll loop, provided the
/// matching external migration id is present on the row.
pub const POLL_OWNED: &[RepoState] = &[
    RepoState::DryRunInProgress,
    RepoState::ArchiveGenerating,
    RepoState::QueuedForMigration,
    RepoState::MigratingContent,
];

/// The live pipeline, in external-progress order. The poll loop advances
/// rows stepwise along this chain so every observed sequence is a valid walk.
pub const LIVE_CHAIN: &[RepoState] = &[
    RepoState::ArchiveGenerating,
    RepoState::QueuedForMigration,
    RepoState::MigratingContent,
    RepoState::PostMigration,
];

impl RepoState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RepoState::Complete | RepoState::WontMigrate | RepoState::RolledBack
        )
    }

    /// Which external migration kind a poll-owned state is waiting on.
    pub fn poll_kind(&self) -> Option<MigrationKind> {
        match self {
            RepoState::DryRunInProgress => Some(MigrationKind::DryRun),
            RepoState::ArchiveGenerating
            | RepoState::QueuedForMigration
            | RepoState::MigratingContent => Some(MigrationKind::Live),
            _ => None,
        }
    }

    /// The failed state a forge error maps to from this state, if any.
    pub fn failed_state(&self) -> Option<RepoState> {
        match self {
            RepoState::DryRunQueued | RepoState::DryRunInProgress => Some(RepoState::DryRunFailed),
            RepoState::PreMigration
            | RepoState::ArchiveGenerating
            | RepoState::QueuedForMigration
            | RepoState::MigratingContent
            | RepoState::PostMigration => Some(RepoState::MigrationFailed),
            _ => None,
        }
    }
}

/// Row-level condition a state must additionally satisfy to be claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimRequirement {
    None,
    /// Only claimable while dry-run attempts remain below the maximum.
    DryAttemptsRemaining,
    /// Only claimable while live attempts remain below the maximum.
    LiveAttemptsRemaining,
    /// Crash-resume claim: only while no dry-run migration id is persisted.
    MissingDryRunId,
    /// Crash-resume claim: only while no live migration id is persisted.
    MissingLiveId,
}

pub fn claim_requirement(state: RepoState) -> Option<ClaimRequirement> {
    match state {
        RepoState::Pending
        | RepoState::DryRunQueued
        | RepoState::DryRunComplete
        | RepoState::PreMigration
        | RepoState::PostMigration
        | RepoState::MigrationComplete => Some(ClaimRequirement::None),
        RepoState::DryRunFailed => Some(ClaimRequirement::DryAttemptsRemaining),
        RepoState::MigrationFailed => Some(ClaimRequirement::LiveAttemptsRemaining),
        RepoState::DryRunInProgress => Some(ClaimRequirement::MissingDryRunId),
        RepoState::ArchiveGenerating | RepoState::QueuedForMigration => {
            Some(ClaimRequirement::MissingLiveId)
        }
        _ => None,
    }
}

/// Whether `from -> to` is an edge of the pipeline graph.
///
/// Includes the administrative edges: `wont_migrate` is reachable from any
/// non-terminal state, `rolled_back` from `migration_failed`, and an explicit
/// admin reset returns a terminal row to `pending`.
pub fn edge_allowed(from: RepoState, to: RepoState) -> bool {
    use RepoState::*;

    // Admin cancel and reset.
    if to == WontMigrate && !from.is_terminal() {
        return true;
    }
    if to == Pending && from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Pending, RemediationRequired)
            | (Pending, DryRunQueued)
            | (RemediationRequired, Pending)
            | (DryRunQueued, DryRunInProgress)
            | (DryRunInProgress, DryRunComplete)
            | (DryRunInProgress, DryRunFailed)
            | (DryRunFailed, DryRunQueued)
            | (DryRunComplete, PreMigration)
            | (PreMigration, ArchiveGenerating)
            | (PreMigration, MigrationFailed)
            | (ArchiveGenerating, QueuedForMigration)
            | (ArchiveGenerating, MigrationFailed)
            | (QueuedForMigration, MigratingContent)
            | (QueuedForMigration, MigrationFailed)
            | (MigratingContent, PostMigration)
            | (MigratingContent, MigrationFailed)
            | (PostMigration, MigrationComplete)
            | (PostMigration, MigrationFailed)
            | (MigrationFailed, QueuedForMigration)
            | (MigrationFailed, RolledBack)
            | (MigrationComplete, Complete)
    )
}

/// Index of a state within [`LIVE_CHAIN`].
pub fn live_chain_index(state: RepoState) -> Option<usize> {
    LIVE_CHAIN.iter().position(|s| *s == state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use RepoState::*;

    #[test]
    fn test_happy_path_is_a_walk() {
        let path = [
            Pending,
            DryRunQueued,
            DryRunInProgress,
            DryRunComplete,
            PreMigration,
            ArchiveGenerating,
            QueuedForMigration,
            MigratingContent,
            PostMigration,
            MigrationComplete,
            Complete,
        ];
        for pair in path.windows(2) {
            assert!(
                edge_allowed(pair[0], pair[1]),
                "missing edge {} -> {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_terminal_states_are_sinks() {
        for from in [Complete, WontMigrate, RolledBack] {
            for to in [
                DryRunQueued,
                DryRunInProgress,
                MigratingContent,
                MigrationComplete,
            ] {
                assert!(!edge_allowed(from, to), "{from} -> {to} must not exist");
            }
            // Only the explicit admin reset leaves a terminal state.
            assert!(edge_allowed(from, Pending));
        }
    }

    #[test]
    fn test_cancel_reachable_from_non_terminal() {
        assert!(edge_allowed(MigratingContent, WontMigrate));
        assert!(edge_allowed(Pending, WontMigrate));
        assert!(!edge_allowed(Complete, WontMigrate));
        assert!(edge_allowed(MigrationFailed, RolledBack));
        assert!(!edge_allowed(DryRunFailed, RolledBack));
    }

    #[test]
    fn test_retry_edges() {
        assert!(edge_allowed(DryRunFailed, DryRunQueued));
        assert!(edge_allowed(MigrationFailed, QueuedForMigration));
    }

    #[test]
    fn test_failure_mapping() {
        assert_eq!(DryRunInProgress.failed_state(), Some(DryRunFailed));
        assert_eq!(QueuedForMigration.failed_state(), Some(MigrationFailed));
        assert_eq!(Complete.failed_state(), None);
    }

    #[test]
    fn test_claim_requirements() {
        assert_eq!(claim_requirement(Pending), Some(ClaimRequirement::None));
        assert_eq!(
            claim_requirement(DryRunInProgress),
            Some(ClaimRequirement::MissingDryRunId)
        );
        assert_eq!(claim_requirement(MigratingContent), None);
        assert_eq!(claim_requirement(Complete), None);
    }

    #[test]
    fn test_poll_kind() {
        assert_eq!(DryRunInProgress.poll_kind(), Some(MigrationKind::DryRun));
        assert_eq!(MigratingContent.poll_kind(), Some(MigrationKind::Live));
        assert_eq!(PostMigration.poll_kind(), None);
    }
}
