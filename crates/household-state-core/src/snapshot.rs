use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::fingerprint::compute_fingerprint;
use crate::merge::SnapshotInputs;
use crate::scoring::{DerivedState, Gates, LevelDescriptor, Metrics, Recommendation};
use crate::scoring::MAX_RECOMMENDATIONS;
use crate::{HouseholdId, SnapshotId, StateError};

/// One immutable, fully materialised version of a household's state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub household_id: HouseholdId,
    /// 1 for the first snapshot of a household, previous + 1 afterwards.
    pub version: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub inputs: SnapshotInputs,
    pub metrics: Metrics,
    pub gates: Gates,
    pub levels: LevelDescriptor,
    pub recommendations: Vec<Recommendation>,
    pub fingerprint: String,
}

impl Snapshot {
    /// Assemble the snapshot that follows `previous_version`.
    ///
    /// Recommendations beyond [`MAX_RECOMMENDATIONS`] are dropped before the
    /// fingerprint is taken.
    #[must_use]
    pub fn next(
        household_id: HouseholdId,
        previous_version: Option<u64>,
        inputs: SnapshotInputs,
        derived: DerivedState,
        created_at: OffsetDateTime,
    ) -> Self {
        let DerivedState { metrics, gates, levels, mut recommendations } = derived;
        recommendations.truncate(MAX_RECOMMENDATIONS);

        let mut snapshot = Self {
            id: SnapshotId::new(),
            household_id,
            version: previous_version.map_or(1, |version| version.saturating_add(1)),
            created_at,
            inputs,
            metrics,
            gates,
            levels,
            recommendations,
            fingerprint: String::new(),
        };
        snapshot.fingerprint = compute_fingerprint(&snapshot);
        snapshot
    }

    #[must_use]
    pub fn derived(&self) -> DerivedState {
        DerivedState {
            metrics: self.metrics.clone(),
            gates: self.gates.clone(),
            levels: self.levels.clone(),
            recommendations: self.recommendations.clone(),
        }
    }

    /// # Errors
    /// Returns [`StateError::Validation`] when the snapshot breaks a structural rule.
    pub fn validate(&self) -> Result<(), StateError> {
        if self.version == 0 {
            return Err(StateError::Validation("snapshot version MUST start at 1".to_string()));
        }
        if self.recommendations.len() > MAX_RECOMMENDATIONS {
            return Err(StateError::Validation(format!(
                "snapshot MUST carry at most {MAX_RECOMMENDATIONS} recommendations"
            )));
        }
        if !self.fingerprint.starts_with("sha256:") {
            return Err(StateError::Validation("snapshot fingerprint MUST be sha256".to_string()));
        }
        for (key, slot) in &self.inputs.slots {
            if key != &slot.key {
                return Err(StateError::Validation(format!(
                    "slot entry {} MUST match its key",
                    key.as_str()
                )));
            }
        }
        Ok(())
    }
}
