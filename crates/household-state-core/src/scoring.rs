//! Contracts for the external scoring and level/recommendation collaborators.
//!
//! The ratio formulas live outside this workspace; the engine only relies on
//! the shapes below and substitutes [`DerivedState::unscored`] parts when a
//! collaborator reports failure.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::slots::SlotMap;

/// Upper bound on recommendations kept per snapshot.
pub const MAX_RECOMMENDATIONS: usize = 2;

pub type Metrics = BTreeMap<String, Option<f64>>;
pub type Gates = BTreeMap<String, bool>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("collaborator failed: {0}")]
pub struct CollaboratorError(pub String);

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScoreOutput {
    pub metrics: Metrics,
    pub gates: Gates,
    #[serde(default)]
    pub normalized: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LevelDescriptor {
    pub level: u32,
    pub label: String,
}

impl LevelDescriptor {
    #[must_use]
    pub fn unscored() -> Self {
        Self { level: 0, label: "unscored".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Recommendation {
    pub id: String,
    pub title: String,
    pub rationale: String,
}

/// Canonical slots -> metrics and gates. Implementations must be pure.
pub trait Scorer: Send + Sync {
    /// # Errors
    /// Returns [`CollaboratorError`] when the scorer cannot produce output.
    fn compute(&self, slots: &SlotMap) -> Result<ScoreOutput, CollaboratorError>;
}

/// Metrics and gates -> level label and recommendations. Implementations must be pure.
pub trait LevelPolicy: Send + Sync {
    /// # Errors
    /// Returns [`CollaboratorError`] when no level can be assigned.
    fn assign_level(&self, metrics: &Metrics, gates: &Gates)
        -> Result<LevelDescriptor, CollaboratorError>;

    /// # Errors
    /// Returns [`CollaboratorError`] when recommendations cannot be produced.
    fn recommend(
        &self,
        metrics: &Metrics,
        gates: &Gates,
    ) -> Result<Vec<Recommendation>, CollaboratorError>;
}

/// Collaborator outputs attached to a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DerivedState {
    pub metrics: Metrics,
    pub gates: Gates,
    pub levels: LevelDescriptor,
    pub recommendations: Vec<Recommendation>,
}

impl DerivedState {
    #[must_use]
    pub fn unscored() -> Self {
        Self {
            metrics: Metrics::new(),
            gates: Gates::new(),
            levels: LevelDescriptor::unscored(),
            recommendations: Vec::new(),
        }
    }
}

/// Placeholder collaborator used when no external scorer is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnscoredPolicy;

impl Scorer for UnscoredPolicy {
    fn compute(&self, _slots: &SlotMap) -> Result<ScoreOutput, CollaboratorError> {
        Ok(ScoreOutput::default())
    }
}

impl LevelPolicy for UnscoredPolicy {
    fn assign_level(
        &self,
        _metrics: &Metrics,
        _gates: &Gates,
    ) -> Result<LevelDescriptor, CollaboratorError> {
        Ok(LevelDescriptor::unscored())
    }

    fn recommend(
        &self,
        _metrics: &Metrics,
        _gates: &Gates,
    ) -> Result<Vec<Recommendation>, CollaboratorError> {
        Ok(Vec::new())
    }
}
