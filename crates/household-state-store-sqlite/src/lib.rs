use std::path::Path;

use anyhow::{anyhow, Context, Result};
use household_state_core::{
    Entitlement, HouseholdId, LevelDescriptor, Plan, Recommendation, Snapshot, SnapshotId,
    SnapshotInputs, Subject, SubscriptionStatus,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS households (
  household_id TEXT PRIMARY KEY,
  owner_subject TEXT,
  owner_email TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS snapshots (
  snapshot_id TEXT PRIMARY KEY,
  household_id TEXT NOT NULL,
  version INTEGER NOT NULL CHECK (version >= 1),
  created_at TEXT NOT NULL,
  inputs_json TEXT NOT NULL,
  metrics_json TEXT NOT NULL,
  gates_json TEXT NOT NULL,
  levels_json TEXT NOT NULL,
  recommendations_json TEXT NOT NULL,
  fingerprint TEXT NOT NULL,
  UNIQUE(household_id, version),
  FOREIGN KEY (household_id) REFERENCES households(household_id)
);

CREATE TABLE IF NOT EXISTS entitlements (
  household_id TEXT PRIMARY KEY,
  plan TEXT NOT NULL CHECK (plan IN ('free','premium')),
  subscription_status TEXT CHECK (subscription_status IN (
    'active','trialing','past_due','canceled','incomplete','incomplete_expired','unpaid','paused'
  )),
  current_period_end TEXT,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (household_id) REFERENCES households(household_id)
);

CREATE INDEX IF NOT EXISTS idx_households_owner ON households(owner_subject);
CREATE INDEX IF NOT EXISTS idx_snapshots_household_created ON snapshots(household_id, created_at);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS household_usage (
  household_id TEXT PRIMARY KEY,
  used INTEGER NOT NULL CHECK (used >= 0),
  updated_at TEXT NOT NULL,
  FOREIGN KEY (household_id) REFERENCES households(household_id)
);
";

const MIGRATION_002_BACKFILL_SQL: &str = r"
INSERT OR IGNORE INTO household_usage(household_id, used, updated_at)
SELECT household_id, COUNT(*), ?1 FROM snapshots GROUP BY household_id;
";

const SNAPSHOT_COLUMNS: &str = "snapshot_id, household_id, version, created_at, inputs_json,
    metrics_json, gates_json, levels_json, recommendations_json, fingerprint";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    /// Households whose usage counter disagrees with their snapshot count.
    pub usage_mismatches: Vec<String>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HouseholdRecord {
    pub household_id: HouseholdId,
    pub owner_subject: Option<String>,
    pub owner_email: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl HouseholdRecord {
    #[must_use]
    pub fn is_owned(&self) -> bool {
        self.owner_subject.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(HouseholdRecord),
    /// The household already belonged to the claiming subject.
    AlreadyOwned(HouseholdRecord),
    OwnedByOther,
    NotFound,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AppendOutcome {
    Appended { used: u64 },
    /// The free quota was exhausted by the time the write transaction started.
    QuotaExceeded { used: u64 },
    /// Another writer appended first; `latest_version` is what it left behind.
    VersionConflict { latest_version: Option<u64> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteSummary {
    pub household_deleted: bool,
    pub snapshots_deleted: usize,
}

impl SqliteStore {
    /// Open a SQLite-backed household store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.apply_migration_1()?;
            version = current_schema_version(&self.conn)?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
        record_schema_version(&tx, 1)?;
        tx.commit().context("failed to commit migration v1")?;
        Ok(())
    }

    /// Introduces the per-household usage counter, seeded from existing snapshot counts.
    fn apply_migration_2(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
        tx.execute_batch(MIGRATION_002_SQL).context("failed to create household_usage")?;
        tx.execute(MIGRATION_002_BACKFILL_SQL, params![now_rfc3339()?])
            .context("failed to backfill household_usage from snapshots")?;
        record_schema_version(&tx, 2)?;
        tx.commit().context("failed to commit migration v2")?;
        Ok(())
    }

    /// Create the household when missing and return its row.
    ///
    /// An existing household is returned unchanged; ownership is only ever set
    /// on creation or through [`SqliteStore::claim_household`].
    ///
    /// # Errors
    /// Returns an error when the upsert or the follow-up read fails.
    pub fn ensure_household(
        &mut self,
        household_id: &HouseholdId,
        owner: Option<&Subject>,
        now: OffsetDateTime,
    ) -> Result<HouseholdRecord> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO households(household_id, owner_subject, owner_email, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    household_id.as_str(),
                    owner.map(|subject| subject.id.as_str()),
                    owner.and_then(|subject| subject.email.as_deref()),
                    rfc3339(now)?,
                ],
            )
            .with_context(|| format!("failed to upsert household {household_id}"))?;

        self.get_household(household_id)?
            .ok_or_else(|| anyhow!("household {household_id} missing after upsert"))
    }

    /// # Errors
    /// Returns an error when the household row cannot be read or decoded.
    pub fn get_household(&self, household_id: &HouseholdId) -> Result<Option<HouseholdRecord>> {
        self.conn
            .query_row(
                "SELECT household_id, owner_subject, owner_email, created_at
                 FROM households WHERE household_id = ?1",
                params![household_id.as_str()],
                household_row,
            )
            .optional()
            .with_context(|| format!("failed to load household {household_id}"))?
            .map(HouseholdRow::into_record)
            .transpose()
    }

    /// Earliest household owned by `subject_id`, if any.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn find_household_by_owner(&self, subject_id: &str) -> Result<Option<HouseholdRecord>> {
        self.conn
            .query_row(
                "SELECT household_id, owner_subject, owner_email, created_at
                 FROM households WHERE owner_subject = ?1
                 ORDER BY created_at ASC, household_id ASC
                 LIMIT 1",
                params![subject_id],
                household_row,
            )
            .optional()
            .context("failed to look up household by owner")?
            .map(HouseholdRow::into_record)
            .transpose()
    }

    /// Set the owner of an unowned household. Ownership never moves once set.
    ///
    /// # Errors
    /// Returns an error when the update or follow-up read fails.
    pub fn claim_household(
        &mut self,
        household_id: &HouseholdId,
        subject: &Subject,
    ) -> Result<ClaimOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start claim transaction")?;

        let changed = tx
            .execute(
                "UPDATE households SET owner_subject = ?2, owner_email = ?3
                 WHERE household_id = ?1 AND owner_subject IS NULL",
                params![household_id.as_str(), subject.id, subject.email],
            )
            .with_context(|| format!("failed to claim household {household_id}"))?;

        let row = tx
            .query_row(
                "SELECT household_id, owner_subject, owner_email, created_at
                 FROM households WHERE household_id = ?1",
                params![household_id.as_str()],
                household_row,
            )
            .optional()
            .with_context(|| format!("failed to reload household {household_id}"))?;
        tx.commit().context("failed to commit claim transaction")?;

        let Some(record) = row.map(HouseholdRow::into_record).transpose()? else {
            return Ok(ClaimOutcome::NotFound);
        };
        if changed == 1 {
            return Ok(ClaimOutcome::Claimed(record));
        }
        if record.owner_subject.as_deref() == Some(subject.id.as_str()) {
            return Ok(ClaimOutcome::AlreadyOwned(record));
        }
        Ok(ClaimOutcome::OwnedByOther)
    }

    /// Remove a household with its snapshots, entitlement and usage rows.
    ///
    /// # Errors
    /// Returns an error when any delete in the transaction fails.
    pub fn delete_household(&mut self, household_id: &HouseholdId) -> Result<DeleteSummary> {
        let tx = self.conn.transaction().context("failed to start delete transaction")?;
        let id = household_id.as_str();

        let snapshots_deleted = tx
            .execute("DELETE FROM snapshots WHERE household_id = ?1", params![id])
            .context("failed to delete snapshots")?;
        tx.execute("DELETE FROM entitlements WHERE household_id = ?1", params![id])
            .context("failed to delete entitlement")?;
        tx.execute("DELETE FROM household_usage WHERE household_id = ?1", params![id])
            .context("failed to delete usage counter")?;
        let households = tx
            .execute("DELETE FROM households WHERE household_id = ?1", params![id])
            .context("failed to delete household")?;

        tx.commit().context("failed to commit delete transaction")?;
        Ok(DeleteSummary { household_deleted: households == 1, snapshots_deleted })
    }

    /// Append one snapshot and bump the household usage counter atomically.
    ///
    /// The write runs in an immediate transaction. `snapshot.version` must be
    /// exactly one past the stored latest version, otherwise the append is
    /// reported as a conflict. With `quota`, the counter is re-checked inside
    /// the transaction and the append is refused once `used >= quota`.
    ///
    /// # Errors
    /// Returns an error when validation fails or any statement in the transaction fails.
    pub fn append_snapshot(
        &mut self,
        snapshot: &Snapshot,
        quota: Option<u64>,
    ) -> Result<AppendOutcome> {
        snapshot.validate().map_err(|err| anyhow!("snapshot validation failed: {err}"))?;

        let household = snapshot.household_id.as_str();
        let created_at = rfc3339(snapshot.created_at)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start append transaction")?;

        tx.execute(
            "INSERT OR IGNORE INTO households(household_id, owner_subject, owner_email, created_at)
             VALUES (?1, NULL, NULL, ?2)",
            params![household, created_at],
        )
        .context("failed to ensure household row")?;

        let used = read_usage(&tx, household)?;
        if let Some(limit) = quota {
            if used >= limit {
                return Ok(AppendOutcome::QuotaExceeded { used });
            }
        }

        let latest_version = read_latest_version(&tx, household)?;
        if latest_version.unwrap_or(0) + 1 != snapshot.version {
            return Ok(AppendOutcome::VersionConflict { latest_version });
        }

        let inserted = tx.execute(
            &format!("INSERT INTO snapshots({SNAPSHOT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
            params![
                snapshot.id.to_string(),
                household,
                to_sql_count(snapshot.version)?,
                created_at,
                to_json(&snapshot.inputs, "inputs")?,
                to_json(&snapshot.metrics, "metrics")?,
                to_json(&snapshot.gates, "gates")?,
                to_json(&snapshot.levels, "levels")?,
                to_json(&snapshot.recommendations, "recommendations")?,
                snapshot.fingerprint,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if is_constraint_violation(&err) => {
                let latest_version = read_latest_version(&tx, household)?;
                return Ok(AppendOutcome::VersionConflict { latest_version });
            }
            Err(err) => return Err(err).context("failed to insert snapshot"),
        }

        tx.execute(
            "INSERT INTO household_usage(household_id, used, updated_at) VALUES (?1, 1, ?2)
             ON CONFLICT(household_id) DO UPDATE SET used = used + 1, updated_at = excluded.updated_at",
            params![household, created_at],
        )
        .context("failed to increment usage counter")?;
        let used = read_usage(&tx, household)?;

        tx.commit().context("failed to commit append transaction")?;
        Ok(AppendOutcome::Appended { used })
    }

    /// Latest snapshot for the household, if it has any.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn latest_snapshot(&self, household_id: &HouseholdId) -> Result<Option<Snapshot>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE household_id = ?1
                     ORDER BY version DESC LIMIT 1"
                ),
                params![household_id.as_str()],
                snapshot_row,
            )
            .optional()
            .with_context(|| format!("failed to load latest snapshot for {household_id}"))?;
        row.map(SnapshotRow::into_snapshot).transpose()
    }

    /// Snapshots for the household, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_snapshots(&self, household_id: &HouseholdId, limit: usize) -> Result<Vec<Snapshot>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE household_id = ?1
             ORDER BY version DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![household_id.as_str(), limit], snapshot_row)?;

        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row?.into_snapshot()?);
        }
        Ok(snapshots)
    }

    /// Number of persisted snapshots for the household.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_snapshots(&self, household_id: &HouseholdId) -> Result<u64> {
        let count = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM snapshots WHERE household_id = ?1",
                params![household_id.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to count snapshots")?;
        from_sql_count(count)
    }

    /// Metered usage for the household (0 when it has never written).
    ///
    /// # Errors
    /// Returns an error when the counter cannot be read.
    pub fn usage_count(&self, household_id: &HouseholdId) -> Result<u64> {
        read_usage(&self.conn, household_id.as_str())
    }

    /// # Errors
    /// Returns an error when the entitlement row cannot be read or decoded.
    pub fn get_entitlement(&self, household_id: &HouseholdId) -> Result<Option<Entitlement>> {
        let row = self
            .conn
            .query_row(
                "SELECT plan, subscription_status, current_period_end
                 FROM entitlements WHERE household_id = ?1",
                params![household_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to load entitlement for {household_id}"))?;

        let Some((plan_raw, status_raw, period_end_raw)) = row else {
            return Ok(None);
        };
        let plan = Plan::parse(&plan_raw).ok_or_else(|| anyhow!("unknown plan: {plan_raw}"))?;
        let subscription_status = status_raw
            .map(|raw| {
                SubscriptionStatus::parse(&raw)
                    .ok_or_else(|| anyhow!("unknown subscription_status: {raw}"))
            })
            .transpose()?;
        let current_period_end = period_end_raw.as_deref().map(parse_rfc3339).transpose()?;

        Ok(Some(Entitlement { plan, subscription_status, current_period_end }))
    }

    /// Insert or replace the entitlement row, creating the household if needed.
    ///
    /// # Errors
    /// Returns an error when any write in the transaction fails.
    pub fn put_entitlement(
        &mut self,
        household_id: &HouseholdId,
        entitlement: &Entitlement,
        now: OffsetDateTime,
    ) -> Result<()> {
        let now = rfc3339(now)?;
        let tx = self.conn.transaction().context("failed to start entitlement transaction")?;
        tx.execute(
            "INSERT OR IGNORE INTO households(household_id, owner_subject, owner_email, created_at)
             VALUES (?1, NULL, NULL, ?2)",
            params![household_id.as_str(), now],
        )
        .context("failed to ensure household row")?;
        tx.execute(
            "INSERT INTO entitlements(household_id, plan, subscription_status, current_period_end, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(household_id) DO UPDATE SET
               plan = excluded.plan,
               subscription_status = excluded.subscription_status,
               current_period_end = excluded.current_period_end,
               updated_at = excluded.updated_at",
            params![
                household_id.as_str(),
                entitlement.plan.as_str(),
                entitlement.subscription_status.map(SubscriptionStatus::as_str),
                entitlement.current_period_end.map(rfc3339).transpose()?,
                now,
            ],
        )
        .context("failed to upsert entitlement")?;
        tx.commit().context("failed to commit entitlement transaction")?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, usage-consistency, and schema status probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;
        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT h.household_id
                 FROM households h
                 LEFT JOIN household_usage u ON u.household_id = h.household_id
                 LEFT JOIN (SELECT household_id, COUNT(*) AS n FROM snapshots GROUP BY household_id) s
                   ON s.household_id = h.household_id
                 WHERE COALESCE(u.used, 0) != COALESCE(s.n, 0)
                 ORDER BY h.household_id",
            )
            .context("failed to prepare usage consistency probe")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut usage_mismatches = Vec::new();
        for row in rows {
            usage_mismatches.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            usage_mismatches,
            schema_status,
        })
    }
}

struct HouseholdRow {
    household_id: String,
    owner_subject: Option<String>,
    owner_email: Option<String>,
    created_at: String,
}

impl HouseholdRow {
    fn into_record(self) -> Result<HouseholdRecord> {
        Ok(HouseholdRecord {
            household_id: parse_household_id(&self.household_id)?,
            owner_subject: self.owner_subject,
            owner_email: self.owner_email,
            created_at: parse_rfc3339(&self.created_at)?,
        })
    }
}

fn household_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HouseholdRow> {
    Ok(HouseholdRow {
        household_id: row.get(0)?,
        owner_subject: row.get(1)?,
        owner_email: row.get(2)?,
        created_at: row.get(3)?,
    })
}

struct SnapshotRow {
    snapshot_id: String,
    household_id: String,
    version: i64,
    created_at: String,
    inputs_json: String,
    metrics_json: String,
    gates_json: String,
    levels_json: String,
    recommendations_json: String,
    fingerprint: String,
}

impl SnapshotRow {
    fn into_snapshot(self) -> Result<Snapshot> {
        let id = Ulid::from_string(&self.snapshot_id)
            .with_context(|| format!("invalid snapshot_id: {}", self.snapshot_id))?;
        let inputs: SnapshotInputs = from_json(&self.inputs_json, "inputs")?;
        let levels: LevelDescriptor = from_json(&self.levels_json, "levels")?;
        let recommendations: Vec<Recommendation> =
            from_json(&self.recommendations_json, "recommendations")?;

        Ok(Snapshot {
            id: SnapshotId(id),
            household_id: parse_household_id(&self.household_id)?,
            version: from_sql_count(self.version)?,
            created_at: parse_rfc3339(&self.created_at)?,
            inputs,
            metrics: from_json(&self.metrics_json, "metrics")?,
            gates: from_json(&self.gates_json, "gates")?,
            levels,
            recommendations,
            fingerprint: self.fingerprint,
        })
    }
}

fn snapshot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotRow> {
    Ok(SnapshotRow {
        snapshot_id: row.get(0)?,
        household_id: row.get(1)?,
        version: row.get(2)?,
        created_at: row.get(3)?,
        inputs_json: row.get(4)?,
        metrics_json: row.get(5)?,
        gates_json: row.get(6)?,
        levels_json: row.get(7)?,
        recommendations_json: row.get(8)?,
        fingerprint: row.get(9)?,
    })
}

fn read_usage(conn: &Connection, household_id: &str) -> Result<u64> {
    let used = conn
        .query_row(
            "SELECT used FROM household_usage WHERE household_id = ?1",
            params![household_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .context("failed to read usage counter")?;
    from_sql_count(used.unwrap_or(0))
}

fn read_latest_version(conn: &Connection, household_id: &str) -> Result<Option<u64>> {
    let version = conn
        .query_row(
            "SELECT MAX(version) FROM snapshots WHERE household_id = ?1",
            params![household_id],
            |row| row.get::<_, Option<i64>>(0),
        )
        .context("failed to read latest snapshot version")?;
    version.map(from_sql_count).transpose()
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _) if inner.code == ErrorCode::ConstraintViolation
    )
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn to_json<T: Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string(value).with_context(|| format!("failed to serialize snapshot {what}"))
}

fn from_json<T: DeserializeOwned>(raw: &str, what: &str) -> Result<T> {
    serde_json::from_str(raw).with_context(|| format!("failed to decode snapshot {what}"))
}

fn to_sql_count(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("count out of range for sqlite: {value}"))
}

fn from_sql_count(value: i64) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("negative count in sqlite: {value}"))
}

fn parse_household_id(raw: &str) -> Result<HouseholdId> {
    HouseholdId::parse(raw).map_err(|err| anyhow!("invalid stored household_id {raw:?}: {err}"))
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
