use std::fmt;

use errors::ErrorMetadata;

use super::index_validation_error;

/// Position of an index in the concurrent build lifecycle.
///
/// Legacy tooling stores this as two independent booleans (`indisready`,
/// `indisvalid`). Internally it's a single enum so the illegal combination
/// `{ready: false, valid: true}` can't be represented at all; the booleans
/// only exist on the serialized form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub enum IndexPhase {
    /// The record exists but writers don't maintain the index yet. The
    /// initial build scan is populating storage.
    Building,
    /// Writers maintain the index but its content may be incomplete, so the
    /// planner must not read it.
    Ready,
    /// Content is complete. The planner may use the index.
    Valid,
    /// A build or validation failed, or the index is being retired. Neither
    /// maintained nor readable; the operator should drop it.
    Failed,
}

/// One of the phase flags addressable through `set_flag`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexFlag {
    Ready,
    Valid,
    CheckXmin,
}

impl fmt::Display for IndexFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexFlag::Ready => write!(f, "indisready"),
            IndexFlag::Valid => write!(f, "indisvalid"),
            IndexFlag::CheckXmin => write!(f, "indcheckxmin"),
        }
    }
}

impl IndexPhase {
    /// Must writers maintain this index?
    pub fn is_ready(&self) -> bool {
        matches!(self, IndexPhase::Ready | IndexPhase::Valid)
    }

    /// May readers trust this index?
    pub fn is_valid(&self) -> bool {
        matches!(self, IndexPhase::Valid)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, IndexPhase::Failed)
    }

    /// `(indisready, indisvalid)`.
    pub fn legacy_flags(&self) -> (bool, bool) {
        (self.is_ready(), self.is_valid())
    }

    /// Rebuild a phase from its serialized booleans. `failed` disambiguates
    /// the two phases that share `{ready: false, valid: false}`.
    pub fn from_legacy_flags(ready: bool, valid: bool, failed: bool) -> anyhow::Result<Self> {
        match (ready, valid, failed) {
            (false, false, false) => Ok(IndexPhase::Building),
            (false, false, true) => Ok(IndexPhase::Failed),
            (true, false, false) => Ok(IndexPhase::Ready),
            (true, true, false) => Ok(IndexPhase::Valid),
            _ => anyhow::bail!(index_validation_error::illegal_phase_flags(ready, valid, failed)),
        }
    }

    /// The phase reached by setting one phase flag, or `InvalidIndexState`
    /// if that move isn't part of the lifecycle.
    ///
    /// Setting a flag to the value it already has is a no-op. `Failed` is
    /// terminal: the only way out is dropping the index.
    pub fn with_flag(self, flag: IndexFlag, value: bool) -> anyhow::Result<Self> {
        let (ready, valid) = self.legacy_flags();
        let (ready, valid) = match flag {
            IndexFlag::Ready => (value, valid),
            IndexFlag::Valid => (ready, value),
            IndexFlag::CheckXmin => return Ok(self),
        };
        if (ready, valid) == self.legacy_flags() {
            return Ok(self);
        }
        let next = match (self, ready, valid) {
            // Build progress.
            (IndexPhase::Building, true, false) => IndexPhase::Ready,
            (IndexPhase::Ready, true, true) => IndexPhase::Valid,
            // Retirement: stop reads first, then stop maintenance.
            (IndexPhase::Valid, true, false) => IndexPhase::Ready,
            (IndexPhase::Ready, false, false) => IndexPhase::Failed,
            _ => anyhow::bail!(illegal_transition(self, flag, value)),
        };
        Ok(next)
    }
}

fn illegal_transition(phase: IndexPhase, flag: IndexFlag, value: bool) -> ErrorMetadata {
    ErrorMetadata::invalid_index_state(
        "IllegalPhaseTransition",
        format!("Cannot set {flag}={value} on an index in phase {phase}"),
    )
}

impl fmt::Display for IndexPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexPhase::Building => write!(f, "Building"),
            IndexPhase::Ready => write!(f, "Ready"),
            IndexPhase::Valid => write!(f, "Valid"),
            IndexPhase::Failed => write!(f, "Failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use errors::ErrorMetadataAnyhowExt;
    use proptest::prelude::*;

    use super::{
        IndexFlag,
        IndexPhase,
    };

    proptest! {
        #![proptest_config(
            ProptestConfig { failure_persistence: None, ..ProptestConfig::default() }
        )]

        #[test]
        fn test_valid_implies_ready(phase in any::<IndexPhase>()) {
            let (ready, valid) = phase.legacy_flags();
            prop_assert!(!valid || ready);
            prop_assert_eq!(
                IndexPhase::from_legacy_flags(ready, valid, phase.is_failed()).unwrap(),
                phase
            );
        }

        #[test]
        fn test_transitions_never_produce_valid_without_ready(
            phase in any::<IndexPhase>(),
            value in any::<bool>(),
            flag in prop_oneof![
                Just(IndexFlag::Ready),
                Just(IndexFlag::Valid),
                Just(IndexFlag::CheckXmin),
            ],
        ) {
            if let Ok(next) = phase.with_flag(flag, value) {
                let (ready, valid) = next.legacy_flags();
                prop_assert!(!valid || ready);
            }
        }
    }

    #[test]
    fn test_ready_false_valid_true_is_rejected() {
        let err = IndexPhase::from_legacy_flags(false, true, false).unwrap_err();
        assert!(err.is_invalid_index_state());
        assert!(IndexPhase::from_legacy_flags(true, true, true).is_err());
    }

    #[test]
    fn test_lifecycle_transitions() -> anyhow::Result<()> {
        let phase = IndexPhase::Building.with_flag(IndexFlag::Ready, true)?;
        assert_eq!(phase, IndexPhase::Ready);
        let phase = phase.with_flag(IndexFlag::Valid, true)?;
        assert_eq!(phase, IndexPhase::Valid);
        // Dropping readiness while still valid would expose {ready=F, valid=T}.
        assert!(
            phase
                .with_flag(IndexFlag::Ready, false)
                .unwrap_err()
                .is_invalid_index_state()
        );
        let phase = phase.with_flag(IndexFlag::Valid, false)?;
        assert_eq!(phase, IndexPhase::Ready);
        let phase = phase.with_flag(IndexFlag::Ready, false)?;
        assert_eq!(phase, IndexPhase::Failed);
        assert!(phase.with_flag(IndexFlag::Ready, true).is_err());
        // Skipping Ready isn't allowed either.
        assert!(IndexPhase::Building.with_flag(IndexFlag::Valid, true).is_err());
        Ok(())
    }
}
