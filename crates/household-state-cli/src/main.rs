use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use household_state_api::{
    parse_household_id, EngineConfig, HouseholdStateApi, MergeDeltasRequest, MergeFullRequest,
    MergeSlotRequest,
};
use household_state_core::{
    Confidence, Entitlement, HouseholdId, Plan, SlotKind, SlotUpdate, Subject, SubscriptionStatus,
    UnknownKeyPolicy,
};
use serde::Serialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "hsk")]
#[command(about = "Household financial state engine CLI")]
struct Cli {
    #[arg(long, env = "HSK_DB", default_value = "./household_state.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "HSK_FREE_LIMIT", default_value_t = household_state_api::DEFAULT_FREE_SNAPSHOT_LIMIT)]
    free_limit: u64,
    #[arg(long, env = "HSK_UNKNOWN_KEYS", value_enum, default_value = "pass_through")]
    unknown_keys: UnknownKeyPolicy,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Household {
        #[command(subcommand)]
        command: HouseholdCommand,
    },
    State {
        #[command(subcommand)]
        command: Box<StateCommand>,
    },
    Entitlement {
        #[command(subcommand)]
        command: EntitlementCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct HouseholdArg {
    #[arg(long)]
    household_id: String,
}

#[derive(Debug, Args)]
struct CallerArgs {
    /// Act as this authenticated subject.
    #[arg(long)]
    subject: Option<String>,
    #[arg(long, requires = "subject")]
    email: Option<String>,
}

impl CallerArgs {
    fn subject(&self) -> Option<Subject> {
        self.subject.as_ref().map(|id| Subject { id: id.clone(), email: self.email.clone() })
    }
}

#[derive(Debug, Subcommand)]
enum HouseholdCommand {
    Show(HouseholdArg),
    Claim(HouseholdClaimArgs),
    Delete(HouseholdArg),
}

#[derive(Debug, Args)]
struct HouseholdClaimArgs {
    #[arg(long)]
    household_id: String,
    #[arg(long)]
    subject: String,
    #[arg(long)]
    email: Option<String>,
}

#[derive(Debug, Subcommand)]
enum StateCommand {
    Show {
        #[arg(long)]
        household_id: String,
        #[command(flatten)]
        caller: CallerArgs,
    },
    Merge(StateMergeArgs),
    Delta(StateDeltaArgs),
    Set(StateSetArgs),
}

#[derive(Debug, Args)]
struct StateMergeArgs {
    #[arg(long)]
    household_id: Option<String>,
    /// `key=value`; values are read as JSON when they parse, text otherwise.
    #[arg(long = "slot")]
    slots: Vec<String>,
    /// Raw input field, `name=value`.
    #[arg(long = "input")]
    inputs: Vec<String>,
    #[command(flatten)]
    caller: CallerArgs,
}

#[derive(Debug, Args)]
struct StateDeltaArgs {
    #[arg(long)]
    household_id: Option<String>,
    /// `key=amount`, e.g. `savings=250` or `cash=-40`.
    #[arg(long = "delta", allow_hyphen_values = true, required = true)]
    deltas: Vec<String>,
    #[arg(long)]
    confidence: Option<String>,
    #[command(flatten)]
    caller: CallerArgs,
}

#[derive(Debug, Args)]
struct StateSetArgs {
    #[arg(long)]
    household_id: Option<String>,
    #[arg(long)]
    key: String,
    #[arg(long, allow_hyphen_values = true)]
    value: String,
    #[arg(long)]
    kind: Option<String>,
    #[arg(long)]
    confidence: Option<String>,
    #[command(flatten)]
    caller: CallerArgs,
}

#[derive(Debug, Subcommand)]
enum EntitlementCommand {
    Show(HouseholdArg),
    Set(EntitlementSetArgs),
}

#[derive(Debug, Args)]
struct EntitlementSetArgs {
    #[arg(long)]
    household_id: String,
    #[arg(long, default_value = "premium")]
    plan: String,
    #[arg(long)]
    status: Option<String>,
    /// RFC 3339 end of the paid period.
    #[arg(long)]
    period_end: Option<String>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json<T: Serialize>(value: &T) -> Result<()> {
    let value = serde_json::to_value(value).context("failed to encode command output")?;
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "hsk=warn,household_state=warn".into());
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let api = HouseholdStateApi::new(cli.db).with_config(EngineConfig {
        free_limit: cli.free_limit,
        unknown_keys: cli.unknown_keys,
        login_url: None,
    });

    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Household { command } => run_household(command, &api),
        Command::State { command } => run_state(*command, &api),
        Command::Entitlement { command } => run_entitlement(command, &api),
    }
}

fn run_db(command: DbCommand, api: &HouseholdStateApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(&serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            if !result.dry_run {
                tracing::info!(
                    from_version = result.current_version,
                    to_version = ?result.after_version,
                    "schema migrated"
                );
            }
            emit_json(&result)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(&report)?;
            if report.quick_check_ok
                && report.foreign_key_violations.is_empty()
                && report.usage_mismatches.is_empty()
            {
                Ok(())
            } else {
                Err(anyhow!("integrity check failed"))
            }
        }
    }
}

fn run_household(command: HouseholdCommand, api: &HouseholdStateApi) -> Result<()> {
    match command {
        HouseholdCommand::Show(args) => emit_json(&api.household_summary(&household(&args.household_id)?)?),
        HouseholdCommand::Claim(args) => {
            let subject = Subject { id: args.subject, email: args.email };
            emit_json(&api.claim_household(&household(&args.household_id)?, &subject)?)
        }
        HouseholdCommand::Delete(args) => {
            let household_id = household(&args.household_id)?;
            let summary = api.delete_household(&household_id)?;
            tracing::info!(
                household_id = %household_id,
                snapshots_deleted = summary.snapshots_deleted,
                "household deleted"
            );
            emit_json(&summary)
        }
    }
}

fn run_state(command: StateCommand, api: &HouseholdStateApi) -> Result<()> {
    match command {
        StateCommand::Show { household_id, caller } => {
            emit_json(&api.current_state(&household(&household_id)?, caller.subject().as_ref())?)
        }
        StateCommand::Merge(args) => {
            let slots = args
                .slots
                .iter()
                .map(|raw| split_pair(raw, "--slot").map(|(key, value)| (key, SlotUpdate::bare(json_or_text(value)))))
                .collect::<Result<BTreeMap<_, _>>>()?;
            let inputs = args
                .inputs
                .iter()
                .map(|raw| split_pair(raw, "--input").map(|(name, value)| (name, json_or_text(value))))
                .collect::<Result<BTreeMap<_, _>>>()?;
            if slots.is_empty() && inputs.is_empty() {
                return Err(anyhow!("state merge needs at least one --slot or --input"));
            }
            let request = MergeFullRequest {
                household_id: optional_household(args.household_id.as_deref())?,
                inputs,
                slots,
            };
            emit_json(&api.merge_full(&request, args.caller.subject().as_ref())?)
        }
        StateCommand::Delta(args) => {
            let deltas = args
                .deltas
                .iter()
                .map(|raw| {
                    let (key, amount) = split_pair(raw, "--delta")?;
                    let amount = amount
                        .trim()
                        .parse::<f64>()
                        .with_context(|| format!("--delta {raw}: amount is not a number"))?;
                    Ok((key, amount))
                })
                .collect::<Result<BTreeMap<_, _>>>()?;
            let confidences = match args.confidence.as_deref() {
                Some(raw) => {
                    let confidence = confidence(raw)?;
                    deltas.keys().map(|key| (key.clone(), confidence)).collect()
                }
                None => BTreeMap::new(),
            };
            let request = MergeDeltasRequest {
                household_id: optional_household(args.household_id.as_deref())?,
                deltas,
                confidences,
            };
            emit_json(&api.merge_deltas(&request, args.caller.subject().as_ref())?)
        }
        StateCommand::Set(args) => {
            let kind = args
                .kind
                .as_deref()
                .map(|raw| SlotKind::parse(raw).ok_or_else(|| anyhow!("unknown slot kind `{raw}`")))
                .transpose()?;
            let request = MergeSlotRequest {
                household_id: optional_household(args.household_id.as_deref())?,
                key: args.key,
                value: json_or_text(&args.value),
                kind,
                confidence: args.confidence.as_deref().map(confidence).transpose()?,
            };
            emit_json(&api.merge_single_slot(&request, args.caller.subject().as_ref())?)
        }
    }
}

fn run_entitlement(command: EntitlementCommand, api: &HouseholdStateApi) -> Result<()> {
    match command {
        EntitlementCommand::Show(args) => emit_json(&api.operator_entitlement(&household(&args.household_id)?)?),
        EntitlementCommand::Set(args) => {
            let plan = Plan::parse(&args.plan).ok_or_else(|| anyhow!("unknown plan `{}`", args.plan))?;
            let subscription_status = args
                .status
                .as_deref()
                .map(|raw| {
                    SubscriptionStatus::parse(raw).ok_or_else(|| anyhow!("unknown subscription status `{raw}`"))
                })
                .transpose()?;
            let current_period_end = args
                .period_end
                .as_deref()
                .map(|raw| {
                    OffsetDateTime::parse(raw, &Rfc3339)
                        .with_context(|| format!("--period-end `{raw}` is not RFC 3339"))
                })
                .transpose()?;
            let entitlement = Entitlement { plan, subscription_status, current_period_end };
            let household_id = household(&args.household_id)?;
            let status = api.set_entitlement(&household_id, &entitlement)?;
            tracing::info!(
                household_id = %household_id,
                plan = plan.as_str(),
                premium = status.premium,
                "operator entitlement set"
            );
            emit_json(&status)
        }
    }
}

fn household(raw: &str) -> Result<HouseholdId> {
    Ok(parse_household_id(raw)?)
}

fn optional_household(raw: Option<&str>) -> Result<Option<HouseholdId>> {
    raw.map(household).transpose()
}

fn confidence(raw: &str) -> Result<Confidence> {
    Confidence::parse(raw).ok_or_else(|| anyhow!("confidence must be low, med or high"))
}

fn split_pair<'a>(raw: &'a str, flag: &str) -> Result<(String, &'a str)> {
    let (key, value) =
        raw.split_once('=').ok_or_else(|| anyhow!("{flag} expects key=value, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("{flag} key must be non-empty"));
    }
    Ok((key.to_string(), value))
}

/// `2500` and `true` stay typed; `2,500` and `$1.2k` are passed as text for coercion.
fn json_or_text(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test IDs: TCLI-001
    #[test]
    fn pairs_and_values_are_parsed() {
        assert!(matches!(split_pair("cash=2,500", "--slot"), Ok((key, "2,500")) if key == "cash"));
        assert!(split_pair("cash", "--slot").is_err());
        assert!(split_pair(" =1", "--slot").is_err());

        assert_eq!(json_or_text("2500"), serde_json::json!(2500));
        assert_eq!(json_or_text("true"), Value::Bool(true));
        assert_eq!(json_or_text("2,500"), Value::String("2,500".to_string()));
    }

    // Test IDs: TCLI-002
    #[test]
    fn contract_version_wraps_non_objects() {
        let wrapped = with_contract_version(serde_json::json!([1, 2]));
        assert_eq!(wrapped.get("contract_version").and_then(Value::as_str), Some(CLI_CONTRACT_VERSION));
        assert_eq!(wrapped.get("payload"), Some(&serde_json::json!([1, 2])));
    }
}
