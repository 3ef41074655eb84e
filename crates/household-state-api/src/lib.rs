//! Engine facade: metering gate, merge operations, household ownership and
//! entitlement reads, orchestrating the `SQLite` store and the scoring, level
//! and billing collaborators.
//!
//! Concurrent merges for one household race at the snapshot level: each reads
//! the latest snapshot, merges, and appends `version + 1`. A losing append is
//! detected by the store and retried from the new latest snapshot a bounded
//! number of times. Usage counting is never part of that race; it is bumped in
//! the same transaction as the snapshot insert.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use household_state_core::{
    merge_deltas, merge_full, single_slot_patch, Confidence, DerivedState, Entitlement,
    FieldIssue, Gates, HouseholdId, LevelDescriptor, LevelPolicy, MergeOptions, MergeOutcome,
    Metrics, Recommendation, Scorer, SlotKind, SlotMap, SlotUpdate, Snapshot, SnapshotId,
    SnapshotInputs, Subject, UnknownKeyPolicy, UnscoredPolicy, Usage,
};
use household_state_store_sqlite::{
    AppendOutcome, ClaimOutcome, DeleteSummary, HouseholdRecord, IntegrityReport, SchemaStatus,
    SqliteStore,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

pub mod billing;
pub mod error;

pub use billing::{BillingProvider, DisabledBilling, HttpBillingProvider};
pub use error::EngineError;

pub const API_CONTRACT_VERSION: &str = "api.v1";

pub const DEFAULT_FREE_SNAPSHOT_LIMIT: u64 = 5;

/// Appends attempted before a persistent version conflict is surfaced.
pub const MAX_APPEND_ATTEMPTS: usize = 3;

pub const MAX_SLOT_KEY_LEN: usize = 64;
pub const MAX_PATCH_ENTRIES: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub free_limit: u64,
    pub unknown_keys: UnknownKeyPolicy,
    pub login_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            free_limit: DEFAULT_FREE_SNAPSHOT_LIMIT,
            unknown_keys: UnknownKeyPolicy::PassThrough,
            login_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MergeFullRequest {
    pub household_id: Option<HouseholdId>,
    pub inputs: BTreeMap<String, Value>,
    pub slots: BTreeMap<String, SlotUpdate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MergeDeltasRequest {
    pub household_id: Option<HouseholdId>,
    pub deltas: BTreeMap<String, f64>,
    pub confidences: BTreeMap<String, Confidence>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeSlotRequest {
    #[serde(default)]
    pub household_id: Option<HouseholdId>,
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub kind: Option<SlotKind>,
    #[serde(default)]
    pub confidence: Option<Confidence>,
}

impl MergeFullRequest {
    /// # Errors
    /// Returns [`EngineError::InvalidInput`] listing every offending field.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut issues = Vec::new();
        if self.inputs.len() + self.slots.len() > MAX_PATCH_ENTRIES {
            issues.push(FieldIssue::new(
                "slots",
                format!("at most {MAX_PATCH_ENTRIES} inputs and slots per merge"),
            ));
        }
        for name in self.inputs.keys() {
            if household_state_core::merge::RESERVED_INPUT_FIELDS.contains(&name.as_str()) {
                issues.push(FieldIssue::new(format!("inputs.{name}"), "reserved input name"));
            }
        }
        for key in self.slots.keys() {
            check_slot_key(&format!("slots.{key}"), key, &mut issues);
        }
        finish(issues)
    }
}

impl MergeDeltasRequest {
    /// # Errors
    /// Returns [`EngineError::InvalidInput`] listing every offending field.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut issues = Vec::new();
        if self.deltas.is_empty() {
            issues.push(FieldIssue::new("deltas", "at least one delta is required"));
        }
        if self.deltas.len() > MAX_PATCH_ENTRIES {
            issues.push(FieldIssue::new(
                "deltas",
                format!("at most {MAX_PATCH_ENTRIES} deltas per merge"),
            ));
        }
        for (key, delta) in &self.deltas {
            let path = format!("deltas.{key}");
            check_slot_key(&path, key, &mut issues);
            if !delta.is_finite() {
                issues.push(FieldIssue::new(path, "delta must be a finite number"));
            }
        }
        finish(issues)
    }
}

impl MergeSlotRequest {
    /// # Errors
    /// Returns [`EngineError::InvalidInput`] listing every offending field.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut issues = Vec::new();
        check_slot_key("key", &self.key, &mut issues);
        if self.value.is_null() {
            issues.push(FieldIssue::new("value", "value is required"));
        }
        finish(issues)
    }
}

fn check_slot_key(path: &str, key: &str, issues: &mut Vec<FieldIssue>) {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        issues.push(FieldIssue::new(path, "slot key must be non-empty"));
    } else if trimmed.len() > MAX_SLOT_KEY_LEN {
        issues.push(FieldIssue::new(
            path,
            format!("slot key must be at most {MAX_SLOT_KEY_LEN} characters"),
        ));
    }
}

fn finish(issues: Vec<FieldIssue>) -> Result<(), EngineError> {
    if issues.is_empty() {
        Ok(())
    } else {
        Err(EngineError::InvalidInput { issues })
    }
}

/// Outcome of the read-only metering pre-check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allowed { premium: bool, usage: Usage },
    Blocked { upgrade_url: Option<String>, login_url: Option<String>, usage: Usage },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeResult {
    pub household_id: HouseholdId,
    pub snapshot_id: SnapshotId,
    pub version: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub metrics: Metrics,
    pub gates: Gates,
    pub levels: LevelDescriptor,
    pub recommendations: Vec<Recommendation>,
    pub fingerprint: String,
    /// False when the new snapshot's fingerprint equals the previous one.
    pub changed: bool,
    pub applied: Vec<String>,
    pub ignored: Vec<String>,
    pub usage: Usage,
    pub premium: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CurrentState {
    pub snapshot: Snapshot,
    pub usage: Usage,
    pub premium: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntitlementStatus {
    pub household_id: HouseholdId,
    pub entitlement: Entitlement,
    pub premium: bool,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HouseholdSummary {
    pub household: HouseholdRecord,
    pub snapshot_count: u64,
    pub latest_version: Option<u64>,
    pub usage: Usage,
}

#[derive(Clone)]
pub struct HouseholdStateApi {
    db_path: PathBuf,
    config: EngineConfig,
    /// Set once the schema at `db_path` is known current; shared by clones.
    schema_ready: Arc<AtomicBool>,
    scorer: Arc<dyn Scorer>,
    level_policy: Arc<dyn LevelPolicy>,
    billing: Arc<dyn BillingProvider>,
}

impl std::fmt::Debug for HouseholdStateApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HouseholdStateApi")
            .field("db_path", &self.db_path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HouseholdStateApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            config: EngineConfig::default(),
            schema_ready: Arc::new(AtomicBool::new(false)),
            scorer: Arc::new(UnscoredPolicy),
            level_policy: Arc::new(UnscoredPolicy),
            billing: Arc::new(DisabledBilling),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.scorer = scorer;
        self
    }

    #[must_use]
    pub fn with_level_policy(mut self, level_policy: Arc<dyn LevelPolicy>) -> Self {
        self.level_policy = level_policy;
        self
    }

    #[must_use]
    pub fn with_billing(mut self, billing: Arc<dyn BillingProvider>) -> Self {
        self.billing = billing;
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Opens the store, migrating only on the first call for this handle.
    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        if !self.schema_ready.load(Ordering::Acquire) {
            store.migrate()?;
            self.schema_ready.store(true, Ordering::Release);
        }
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        self.schema_ready.store(after.pending_versions.is_empty(), Ordering::Release);
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or probed.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_migrated()?.integrity_check()
    }

    /// Pick the household a request targets: the explicit id when given,
    /// otherwise the earliest household owned by the authenticated caller.
    ///
    /// # Errors
    /// Returns [`EngineError::StoreUnavailable`] when the owner lookup fails.
    pub fn resolve_household(
        &self,
        explicit: Option<HouseholdId>,
        caller: Option<&Subject>,
    ) -> Result<Option<HouseholdId>, EngineError> {
        if explicit.is_some() {
            return Ok(explicit);
        }
        let Some(subject) = caller else {
            return Ok(None);
        };
        let store = self.open_migrated()?;
        Ok(store.find_household_by_owner(&subject.id)?.map(|record| record.household_id))
    }

    /// Ownership pre-check for a resolved household. Households that do not
    /// exist yet are open; they are created on first write.
    ///
    /// # Errors
    /// [`EngineError::Unauthorized`] / [`EngineError::Forbidden`] on ownership
    /// mismatch, or store failures.
    pub fn authorize_access(
        &self,
        household_id: &HouseholdId,
        caller: Option<&Subject>,
    ) -> Result<(), EngineError> {
        let store = self.open_migrated()?;
        match store.get_household(household_id)? {
            Some(household) => authorize(&household, caller),
            None => Ok(()),
        }
    }

    /// Read-only metering pre-check. Performs no writes.
    ///
    /// A failing entitlement or usage lookup is surfaced as
    /// [`EngineError::StoreUnavailable`] so writes fail closed.
    ///
    /// # Errors
    /// Returns [`EngineError::StoreUnavailable`] when the store cannot be read.
    pub fn check_entitlement(
        &self,
        household_id: &HouseholdId,
        caller: Option<&Subject>,
    ) -> Result<GateDecision, EngineError> {
        let store = self.open_migrated()?;
        let now = OffsetDateTime::now_utc();
        let entitlement = store.get_entitlement(household_id)?.unwrap_or_default();
        let used = store.usage_count(household_id)?;
        let usage = Usage::new(self.config.free_limit, used);

        if entitlement.is_premium(now) {
            return Ok(GateDecision::Allowed { premium: true, usage });
        }
        if used < self.config.free_limit {
            return Ok(GateDecision::Allowed { premium: false, usage });
        }
        let (upgrade_url, login_url) = self.upgrade_prompt(household_id, caller);
        Ok(GateDecision::Blocked { upgrade_url, login_url, usage })
    }

    /// Upgrade link for authenticated callers, login prompt otherwise or when
    /// billing cannot produce a link.
    fn upgrade_prompt(
        &self,
        household_id: &HouseholdId,
        caller: Option<&Subject>,
    ) -> (Option<String>, Option<String>) {
        let Some(subject) = caller else {
            return (None, self.config.login_url.clone());
        };
        match self.billing.create_upgrade_link(household_id, subject.email.as_deref()) {
            Ok(url) => (Some(url), None),
            Err(err) => {
                tracing::warn!(
                    household_id = %household_id,
                    error = %format_args!("{err:#}"),
                    "upgrade link unavailable; returning login prompt"
                );
                (None, self.config.login_url.clone())
            }
        }
    }

    /// Full merge of raw input fields and slot values.
    ///
    /// # Errors
    /// Returns an [`EngineError`] on validation, authorization, metering or store failure.
    pub fn merge_full(
        &self,
        request: &MergeFullRequest,
        caller: Option<&Subject>,
    ) -> Result<MergeResult, EngineError> {
        request.validate()?;
        self.persist_merge(request.household_id.clone(), caller, |latest, options| {
            merge_full(latest, &request.inputs, &request.slots, options)
        })
    }

    /// Additive merge; results are floored at zero.
    ///
    /// # Errors
    /// Returns an [`EngineError`] on validation, authorization, metering or store failure.
    pub fn merge_deltas(
        &self,
        request: &MergeDeltasRequest,
        caller: Option<&Subject>,
    ) -> Result<MergeResult, EngineError> {
        request.validate()?;
        self.persist_merge(request.household_id.clone(), caller, |latest, options| {
            merge_deltas(latest, &request.deltas, &request.confidences, options)
        })
    }

    /// One-slot convenience over [`HouseholdStateApi::merge_full`].
    ///
    /// # Errors
    /// Returns an [`EngineError`] on validation, authorization, metering or store failure.
    pub fn merge_single_slot(
        &self,
        request: &MergeSlotRequest,
        caller: Option<&Subject>,
    ) -> Result<MergeResult, EngineError> {
        request.validate()?;
        let slots =
            single_slot_patch(&request.key, request.value.clone(), request.kind, request.confidence);
        self.merge_full(
            &MergeFullRequest {
                household_id: request.household_id.clone(),
                inputs: BTreeMap::new(),
                slots,
            },
            caller,
        )
    }

    fn persist_merge<F>(
        &self,
        explicit: Option<HouseholdId>,
        caller: Option<&Subject>,
        merge: F,
    ) -> Result<MergeResult, EngineError>
    where
        F: Fn(Option<&SnapshotInputs>, MergeOptions) -> MergeOutcome,
    {
        let household_id = self.resolve_household(explicit, caller)?.unwrap_or_else(HouseholdId::generate);
        let mut store = self.open_migrated()?;
        let now = OffsetDateTime::now_utc();

        let household = store.ensure_household(&household_id, caller, now)?;
        authorize(&household, caller)?;

        let premium = match self.check_entitlement(&household_id, caller)? {
            GateDecision::Allowed { premium, .. } => premium,
            GateDecision::Blocked { upgrade_url, login_url, usage } => {
                tracing::info!(household_id = %household_id, used = usage.used, "merge blocked by metering");
                return Err(EngineError::MeteringBlocked { upgrade_url, login_url, usage });
            }
        };
        let quota = (!premium).then_some(self.config.free_limit);
        let options = MergeOptions::at(now).with_unknown_keys(self.config.unknown_keys);

        for attempt in 1..=MAX_APPEND_ATTEMPTS {
            let latest = store.latest_snapshot(&household_id)?;
            let outcome = merge(latest.as_ref().map(|snapshot| &snapshot.inputs), options);
            let derived = self.derive_state(&outcome.inputs.slots);
            let snapshot = Snapshot::next(
                household_id.clone(),
                latest.as_ref().map(|snapshot| snapshot.version),
                outcome.inputs,
                derived,
                OffsetDateTime::now_utc(),
            );

            match store.append_snapshot(&snapshot, quota)? {
                AppendOutcome::Appended { used } => {
                    let changed = match &latest {
                        Some(previous) => previous.fingerprint != snapshot.fingerprint,
                        None => true,
                    };
                    tracing::info!(
                        household_id = %household_id,
                        version = snapshot.version,
                        changed,
                        "snapshot appended"
                    );
                    return Ok(MergeResult {
                        household_id,
                        snapshot_id: snapshot.id,
                        version: snapshot.version,
                        created_at: snapshot.created_at,
                        metrics: snapshot.metrics,
                        gates: snapshot.gates,
                        levels: snapshot.levels,
                        recommendations: snapshot.recommendations,
                        fingerprint: snapshot.fingerprint,
                        changed,
                        applied: outcome.applied.iter().map(|key| key.as_str().to_string()).collect(),
                        ignored: outcome.ignored,
                        usage: Usage::new(self.config.free_limit, used),
                        premium,
                    });
                }
                AppendOutcome::QuotaExceeded { used } => {
                    let usage = Usage::new(self.config.free_limit, used);
                    let (upgrade_url, login_url) = self.upgrade_prompt(&household_id, caller);
                    return Err(EngineError::MeteringBlocked { upgrade_url, login_url, usage });
                }
                AppendOutcome::VersionConflict { latest_version } => {
                    tracing::debug!(
                        household_id = %household_id,
                        attempt,
                        ?latest_version,
                        "snapshot append lost a race; retrying from latest"
                    );
                }
            }
        }

        Err(EngineError::StoreUnavailable(anyhow!(
            "snapshot append for {household_id} conflicted {MAX_APPEND_ATTEMPTS} times"
        )))
    }

    /// Run the collaborators, substituting defaults for any that fail.
    fn derive_state(&self, slots: &SlotMap) -> DerivedState {
        let score = match self.scorer.compute(slots) {
            Ok(score) => score,
            Err(err) => {
                tracing::warn!(error = %err, "scorer failed; snapshot stored unscored");
                return DerivedState::unscored();
            }
        };
        let levels = self
            .level_policy
            .assign_level(&score.metrics, &score.gates)
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "level policy failed; using unscored level");
                LevelDescriptor::unscored()
            });
        let recommendations = self
            .level_policy
            .recommend(&score.metrics, &score.gates)
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "recommendations failed; none attached");
                Vec::new()
            });

        DerivedState { metrics: score.metrics, gates: score.gates, levels, recommendations }
    }

    /// Latest snapshot of the household. Never metered.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] when the household or its snapshots are missing,
    /// authorization errors, or store failures.
    pub fn current_state(
        &self,
        household_id: &HouseholdId,
        caller: Option<&Subject>,
    ) -> Result<CurrentState, EngineError> {
        let store = self.open_migrated()?;
        let household = store.get_household(household_id)?.ok_or(EngineError::NotFound("household"))?;
        authorize(&household, caller)?;

        let snapshot = store.latest_snapshot(household_id)?.ok_or(EngineError::NotFound("snapshot"))?;
        let entitlement = store.get_entitlement(household_id)?.unwrap_or_default();
        let usage = Usage::new(self.config.free_limit, store.usage_count(household_id)?);
        Ok(CurrentState {
            snapshot,
            usage,
            premium: entitlement.is_premium(OffsetDateTime::now_utc()),
        })
    }

    /// # Errors
    /// [`EngineError::NotFound`] for unknown households, authorization errors, or store failures.
    pub fn entitlement_status(
        &self,
        household_id: &HouseholdId,
        caller: Option<&Subject>,
    ) -> Result<EntitlementStatus, EngineError> {
        let store = self.open_migrated()?;
        let household = store.get_household(household_id)?.ok_or(EngineError::NotFound("household"))?;
        authorize(&household, caller)?;
        self.entitlement_view(&store, household_id)
    }

    /// Operator read of an entitlement; no ownership check.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] for unknown households, or store failures.
    pub fn operator_entitlement(&self, household_id: &HouseholdId) -> Result<EntitlementStatus, EngineError> {
        let store = self.open_migrated()?;
        store.get_household(household_id)?.ok_or(EngineError::NotFound("household"))?;
        self.entitlement_view(&store, household_id)
    }

    /// Operator and billing-webhook write path for entitlements.
    ///
    /// # Errors
    /// Returns [`EngineError::StoreUnavailable`] when the write fails.
    pub fn set_entitlement(
        &self,
        household_id: &HouseholdId,
        entitlement: &Entitlement,
    ) -> Result<EntitlementStatus, EngineError> {
        let mut store = self.open_migrated()?;
        store.put_entitlement(household_id, entitlement, OffsetDateTime::now_utc())?;
        tracing::info!(
            household_id = %household_id,
            plan = entitlement.plan.as_str(),
            "entitlement updated"
        );
        self.entitlement_view(&store, household_id)
    }

    fn entitlement_view(
        &self,
        store: &SqliteStore,
        household_id: &HouseholdId,
    ) -> Result<EntitlementStatus, EngineError> {
        let entitlement = store.get_entitlement(household_id)?.unwrap_or_default();
        let usage = Usage::new(self.config.free_limit, store.usage_count(household_id)?);
        Ok(EntitlementStatus {
            household_id: household_id.clone(),
            premium: entitlement.is_premium(OffsetDateTime::now_utc()),
            entitlement,
            usage,
        })
    }

    /// Attach an owner to an unowned household. Re-claiming by the same owner is a no-op.
    ///
    /// # Errors
    /// [`EngineError::NotFound`], [`EngineError::Forbidden`] when owned by someone else,
    /// or store failures.
    pub fn claim_household(
        &self,
        household_id: &HouseholdId,
        subject: &Subject,
    ) -> Result<HouseholdRecord, EngineError> {
        let mut store = self.open_migrated()?;
        match store.claim_household(household_id, subject)? {
            ClaimOutcome::Claimed(record) => {
                tracing::info!(household_id = %household_id, "household claimed");
                Ok(record)
            }
            ClaimOutcome::AlreadyOwned(record) => Ok(record),
            ClaimOutcome::OwnedByOther => Err(EngineError::Forbidden),
            ClaimOutcome::NotFound => Err(EngineError::NotFound("household")),
        }
    }

    /// # Errors
    /// [`EngineError::NotFound`] for unknown households, or store failures.
    pub fn household_summary(&self, household_id: &HouseholdId) -> Result<HouseholdSummary, EngineError> {
        let store = self.open_migrated()?;
        let household = store.get_household(household_id)?.ok_or(EngineError::NotFound("household"))?;
        let latest_version = store.latest_snapshot(household_id)?.map(|snapshot| snapshot.version);
        Ok(HouseholdSummary {
            household,
            snapshot_count: store.count_snapshots(household_id)?,
            latest_version,
            usage: Usage::new(self.config.free_limit, store.usage_count(household_id)?),
        })
    }

    /// Bulk removal; the only path that deletes snapshots.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] for unknown households, or store failures.
    pub fn delete_household(&self, household_id: &HouseholdId) -> Result<DeleteSummary, EngineError> {
        let mut store = self.open_migrated()?;
        let summary = store.delete_household(household_id)?;
        if !summary.household_deleted {
            return Err(EngineError::NotFound("household"));
        }
        tracing::info!(
            household_id = %household_id,
            snapshots = summary.snapshots_deleted,
            "household deleted"
        );
        Ok(summary)
    }
}

/// Owned households require the owning subject; unowned ones are open.
fn authorize(household: &HouseholdRecord, caller: Option<&Subject>) -> Result<(), EngineError> {
    match (household.owner_subject.as_deref(), caller) {
        (None, _) => Ok(()),
        (Some(owner), Some(subject)) if owner == subject.id => Ok(()),
        (Some(_), Some(_)) => Err(EngineError::Forbidden),
        (Some(_), None) => Err(EngineError::Unauthorized),
    }
}

/// Parse a household id from a query string, cookie or CLI argument.
///
/// # Errors
/// Returns [`EngineError::InvalidInput`] for malformed ids.
pub fn parse_household_id(raw: &str) -> Result<HouseholdId, EngineError> {
    Ok(HouseholdId::parse(raw)?)
}
