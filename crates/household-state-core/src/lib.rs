//! Canonical household financial state: the slot vocabulary, coercion of raw
//! caller input into typed slots, the pure merge operations that produce new
//! snapshot inputs, order-independent fingerprints, and entitlement math.
//!
//! Nothing in this crate performs I/O.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub mod canonical;
pub mod entitlement;
pub mod fingerprint;
pub mod merge;
pub mod scoring;
pub mod slots;
pub mod snapshot;

pub use canonical::{canonicalize, coerce, coerce_with, normalize_key, UnknownKeyPolicy};
pub use entitlement::{Entitlement, Plan, SubscriptionStatus, Usage};
pub use fingerprint::{compute_fingerprint, stable_stringify, try_compute_fingerprint};
pub use merge::{
    apply_deltas, merge_deltas, merge_full, single_slot_patch, MergeOptions, MergeOutcome,
    SlotUpdate, SnapshotInputs,
};
pub use scoring::{
    CollaboratorError, DerivedState, Gates, LevelDescriptor, LevelPolicy, Metrics,
    Recommendation, ScoreOutput, Scorer, UnscoredPolicy, MAX_RECOMMENDATIONS,
};
pub use slots::{CanonicalKey, Confidence, Slot, SlotKey, SlotKind, SlotMap, SlotValue};
pub use snapshot::Snapshot;

/// Longest accepted household identifier.
pub const MAX_HOUSEHOLD_ID_LEN: usize = 64;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StateError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// One field-level problem found while validating caller input.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FieldIssue {
    pub path: String,
    pub message: String,
}

impl FieldIssue {
    #[must_use]
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self { path: path.into(), message: message.into() }
    }
}

/// Opaque, stable household identifier.
///
/// Identifiers arrive from request bodies, query strings and cookies, so they
/// are restricted to a URL- and cookie-safe alphabet.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct HouseholdId(String);

impl HouseholdId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Parse a caller-supplied household identifier.
    ///
    /// # Errors
    /// Returns [`StateError::Validation`] when the identifier is empty, too long,
    /// or contains characters outside `[A-Za-z0-9_-]`.
    pub fn parse(raw: &str) -> Result<Self, StateError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(StateError::Validation("household_id MUST be non-empty".to_string()));
        }
        if trimmed.len() > MAX_HOUSEHOLD_ID_LEN {
            return Err(StateError::Validation(format!(
                "household_id MUST be at most {MAX_HOUSEHOLD_ID_LEN} characters"
            )));
        }
        if !trimmed.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_') {
            return Err(StateError::Validation(
                "household_id MUST only contain [A-Za-z0-9_-]".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for HouseholdId {
    type Error = StateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<HouseholdId> for String {
    fn from(value: HouseholdId) -> Self {
        value.0
    }
}

impl Display for HouseholdId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SnapshotId(pub Ulid);

impl SnapshotId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SnapshotId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authenticated caller as reported by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Subject {
    pub id: String,
    pub email: Option<String>,
}
