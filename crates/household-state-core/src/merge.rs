//! Pure merge operations. Each produces brand-new inputs from the latest
//! snapshot's inputs plus an update; the previous inputs are never mutated.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::canonical::{canonicalize, coerce_with, UnknownKeyPolicy};
use crate::slots::{Confidence, Slot, SlotKey, SlotKind, SlotMap, SlotValue};

/// Top-level input names that cannot be used for raw caller fields.
pub const RESERVED_INPUT_FIELDS: [&str; 2] = ["slots", "unmapped"];

/// Materialised inputs of one snapshot: raw caller fields plus canonical slots.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SnapshotInputs {
    #[serde(default)]
    pub slots: SlotMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unmapped: BTreeMap<String, Slot>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

/// One caller-supplied slot update, either a bare value or a detailed object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(from = "RawSlotUpdate")]
pub struct SlotUpdate {
    pub value: Value,
    pub confidence: Option<Confidence>,
    pub kind: Option<SlotKind>,
}

impl SlotUpdate {
    #[must_use]
    pub fn bare(value: Value) -> Self {
        Self { value, confidence: None, kind: None }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSlotUpdate {
    Detailed {
        value: Value,
        #[serde(default)]
        confidence: Option<Confidence>,
        #[serde(default)]
        kind: Option<SlotKind>,
    },
    Bare(Value),
}

impl From<RawSlotUpdate> for SlotUpdate {
    fn from(raw: RawSlotUpdate) -> Self {
        match raw {
            RawSlotUpdate::Detailed { value, confidence, kind } => {
                Self { value, confidence, kind }
            }
            RawSlotUpdate::Bare(value) => Self::bare(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    pub unknown_keys: UnknownKeyPolicy,
    pub default_confidence: Confidence,
    /// Year used when an age is given for `birth_year`.
    pub reference_year: i32,
}

impl MergeOptions {
    #[must_use]
    pub fn at(now: OffsetDateTime) -> Self {
        Self {
            unknown_keys: UnknownKeyPolicy::default(),
            default_confidence: Confidence::default(),
            reference_year: now.year(),
        }
    }

    #[must_use]
    pub fn with_unknown_keys(mut self, policy: UnknownKeyPolicy) -> Self {
        self.unknown_keys = policy;
        self
    }
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self::at(OffsetDateTime::now_utc())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub inputs: SnapshotInputs,
    /// Slot keys written by this update, in application order.
    pub applied: Vec<SlotKey>,
    /// Raw keys whose values could not be coerced; the prior value is kept.
    pub ignored: Vec<String>,
}

impl SnapshotInputs {
    fn write_slot(&mut self, slot: Slot, policy: UnknownKeyPolicy) {
        match (&slot.key, policy) {
            (SlotKey::Unmapped(raw), UnknownKeyPolicy::Segregate) => {
                self.unmapped.insert(raw.clone(), slot);
            }
            _ => {
                self.slots.insert(slot.key.clone(), slot);
            }
        }
    }

    fn read_slot(&self, key: &SlotKey, policy: UnknownKeyPolicy) -> Option<&Slot> {
        match (key, policy) {
            (SlotKey::Unmapped(raw), UnknownKeyPolicy::Segregate) => self.unmapped.get(raw),
            _ => self.slots.get(key),
        }
    }
}

/// Full merge: overwrite patched slots and shallow-merge raw fields onto a copy
/// of the latest inputs.
///
/// Null field values and uncoercible slot values leave the prior value intact.
#[must_use]
pub fn merge_full(
    latest: Option<&SnapshotInputs>,
    input_patch: &BTreeMap<String, Value>,
    slot_patch: &BTreeMap<String, SlotUpdate>,
    options: MergeOptions,
) -> MergeOutcome {
    let mut inputs = latest.cloned().unwrap_or_default();
    let mut applied = Vec::new();
    let mut ignored = Vec::new();

    for (name, value) in input_patch {
        if value.is_null() || RESERVED_INPUT_FIELDS.contains(&name.as_str()) {
            continue;
        }
        inputs.fields.insert(name.clone(), value.clone());
    }

    for (raw_key, update) in slot_patch {
        let key = canonicalize(raw_key);
        let Some(value) = coerce_with(&key, &update.value, update.kind, options.reference_year)
        else {
            ignored.push(raw_key.clone());
            continue;
        };
        let confidence = update.confidence.unwrap_or(options.default_confidence);
        applied.push(key.clone());
        inputs.write_slot(Slot { key, value, confidence }, options.unknown_keys);
    }

    MergeOutcome { inputs, applied, ignored }
}

/// Delta merge over snapshot inputs, honouring the unknown-key policy.
///
/// Each delta is added to the current numeric value (0 when absent or
/// non-finite) and the result is floored at 0. Deltas against non-numeric
/// slots, and non-finite deltas, are ignored.
#[must_use]
pub fn merge_deltas(
    latest: Option<&SnapshotInputs>,
    deltas: &BTreeMap<String, f64>,
    confidences: &BTreeMap<String, Confidence>,
    options: MergeOptions,
) -> MergeOutcome {
    let mut inputs = latest.cloned().unwrap_or_default();
    let mut applied = Vec::new();
    let mut ignored = Vec::new();

    for (raw_key, delta) in deltas {
        let key = canonicalize(raw_key);
        let current = inputs.read_slot(&key, options.unknown_keys);
        let Some(value) = delta_value(&key, current, *delta) else {
            ignored.push(raw_key.clone());
            continue;
        };
        let confidence = confidences
            .get(raw_key)
            .or_else(|| confidences.get(key.as_str()))
            .copied()
            .or_else(|| current.map(|slot| slot.confidence))
            .unwrap_or(options.default_confidence);
        applied.push(key.clone());
        inputs.write_slot(Slot { key, value, confidence }, options.unknown_keys);
    }

    MergeOutcome { inputs, applied, ignored }
}

/// Delta merge over a bare slot map; unknown keys stay in the map.
#[must_use]
pub fn apply_deltas(
    latest_slots: &SlotMap,
    deltas: &BTreeMap<String, f64>,
    confidences: &BTreeMap<String, Confidence>,
) -> SlotMap {
    let latest = SnapshotInputs { slots: latest_slots.clone(), ..SnapshotInputs::default() };
    merge_deltas(Some(&latest), deltas, confidences, MergeOptions::default()).inputs.slots
}

#[allow(clippy::cast_possible_truncation)]
fn delta_value(key: &SlotKey, current: Option<&Slot>, delta: f64) -> Option<SlotValue> {
    if !delta.is_finite() {
        return None;
    }
    let kind = match current.map(|slot| slot.value.kind()) {
        Some(kind) if kind.is_numeric() => kind,
        Some(_) => return None,
        None => key.declared_kind().unwrap_or(SlotKind::Money),
    };
    if !kind.is_numeric() {
        return None;
    }

    let base = current
        .and_then(|slot| slot.value.as_number())
        .filter(|value| value.is_finite())
        .unwrap_or(0.0);
    let next = (base + delta).max(0.0);

    Some(match kind {
        SlotKind::Percent => SlotValue::Percent(next),
        SlotKind::Integer => SlotValue::Integer(next.round().min(9.0e18) as i64),
        _ => SlotValue::Money(next),
    })
}

/// One-entry slot patch for single-field updates.
#[must_use]
pub fn single_slot_patch(
    key: &str,
    value: Value,
    kind: Option<SlotKind>,
    confidence: Option<Confidence>,
) -> BTreeMap<String, SlotUpdate> {
    BTreeMap::from([(key.to_string(), SlotUpdate { value, confidence, kind })])
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::slots::CanonicalKey;

    fn options() -> MergeOptions {
        MergeOptions {
            unknown_keys: UnknownKeyPolicy::PassThrough,
            default_confidence: Confidence::Med,
            reference_year: 2026,
        }
    }

    fn cash_key() -> SlotKey {
        SlotKey::Canonical(CanonicalKey::CashLiquidTotal)
    }

    fn slot_map(entries: &[(SlotKey, SlotValue)]) -> SlotMap {
        entries
            .iter()
            .map(|(key, value)| {
                (
                    key.clone(),
                    Slot { key: key.clone(), value: value.clone(), confidence: Confidence::Med },
                )
            })
            .collect()
    }

    fn money(key: &SlotKey, slots: &SlotMap) -> Option<f64> {
        match slots.get(key).map(|slot| &slot.value) {
            Some(SlotValue::Money(value)) => Some(*value),
            _ => None,
        }
    }

    // Test IDs: TMRG-001
    #[test]
    fn single_slot_merge_on_empty_household_creates_slot() {
        let patch = single_slot_patch("cash", json!("2,500"), Some(SlotKind::Money), None);
        let outcome = merge_full(None, &BTreeMap::new(), &patch, options());
        assert_eq!(money(&cash_key(), &outcome.inputs.slots), Some(2500.0));
        assert_eq!(outcome.applied, vec![cash_key()]);
        assert!(outcome.ignored.is_empty());
    }

    // Test IDs: TMRG-002
    #[test]
    fn full_merge_carries_untouched_slots_forward() {
        let income = SlotKey::Canonical(CanonicalKey::IncomeNetMonthly);
        let latest = SnapshotInputs {
            slots: slot_map(&[
                (cash_key(), SlotValue::Money(100.0)),
                (income.clone(), SlotValue::Money(4000.0)),
            ]),
            ..SnapshotInputs::default()
        };
        let patch = BTreeMap::from([("savings".to_string(), SlotUpdate::bare(json!(250)))]);

        let outcome = merge_full(Some(&latest), &BTreeMap::new(), &patch, options());

        assert_eq!(money(&cash_key(), &outcome.inputs.slots), Some(250.0));
        assert_eq!(money(&income, &outcome.inputs.slots), Some(4000.0));
        assert_eq!(money(&cash_key(), &latest.slots), Some(100.0), "latest must not mutate");
    }

    // Test IDs: TMRG-003
    #[test]
    fn uncoercible_values_leave_prior_value_and_are_reported() {
        let latest = SnapshotInputs {
            slots: slot_map(&[(cash_key(), SlotValue::Money(900.0))]),
            ..SnapshotInputs::default()
        };
        let patch = BTreeMap::from([("cash".to_string(), SlotUpdate::bare(json!("a lot")))]);

        let outcome = merge_full(Some(&latest), &BTreeMap::new(), &patch, options());

        assert_eq!(money(&cash_key(), &outcome.inputs.slots), Some(900.0));
        assert_eq!(outcome.ignored, vec!["cash".to_string()]);
    }

    // Test IDs: TMRG-004
    #[test]
    fn raw_fields_shallow_merge_and_skip_nulls_and_reserved_names() {
        let latest = SnapshotInputs {
            fields: BTreeMap::from([
                ("goal".to_string(), json!("buy a house")),
                ("source".to_string(), json!("voice")),
            ]),
            ..SnapshotInputs::default()
        };
        let input_patch = BTreeMap::from([
            ("source".to_string(), json!("form")),
            ("goal".to_string(), Value::Null),
            ("slots".to_string(), json!({"cash": 1})),
        ]);

        let outcome = merge_full(Some(&latest), &input_patch, &BTreeMap::new(), options());

        assert_eq!(outcome.inputs.fields.get("source"), Some(&json!("form")));
        assert_eq!(outcome.inputs.fields.get("goal"), Some(&json!("buy a house")));
        assert!(!outcome.inputs.fields.contains_key("slots"));
    }

    // Test IDs: TMRG-005
    #[test]
    fn deltas_clamp_at_zero() {
        let latest = slot_map(&[(cash_key(), SlotValue::Money(2500.0))]);
        let deltas = BTreeMap::from([("cash".to_string(), -5000.0)]);
        let slots = apply_deltas(&latest, &deltas, &BTreeMap::new());
        assert_eq!(money(&cash_key(), &slots), Some(0.0));
    }

    // Test IDs: TMRG-006
    #[test]
    fn deltas_start_from_zero_and_keep_integer_kind() {
        let dependants = SlotKey::Canonical(CanonicalKey::Dependants);
        let deltas = BTreeMap::from([("kids".to_string(), 1.0), ("savings".to_string(), 250.0)]);
        let confidences = BTreeMap::from([("savings".to_string(), Confidence::High)]);
        let slots = apply_deltas(&SlotMap::new(), &deltas, &confidences);

        assert_eq!(slots.get(&dependants).map(|slot| &slot.value), Some(&SlotValue::Integer(1)));
        assert_eq!(money(&cash_key(), &slots), Some(250.0));
        assert_eq!(slots.get(&cash_key()).map(|slot| slot.confidence), Some(Confidence::High));
    }

    // Test IDs: TMRG-007
    #[test]
    fn deltas_skip_non_numeric_slots_and_non_finite_amounts() {
        let partner = SlotKey::Canonical(CanonicalKey::Partner);
        let latest = SnapshotInputs {
            slots: slot_map(&[(partner.clone(), SlotValue::Boolean(true))]),
            ..SnapshotInputs::default()
        };
        let deltas = BTreeMap::from([
            ("partner".to_string(), 1.0),
            ("birth_year".to_string(), 1.0),
            ("cash".to_string(), f64::NAN),
        ]);

        let outcome = merge_deltas(Some(&latest), &deltas, &BTreeMap::new(), options());

        assert_eq!(
            outcome.inputs.slots.get(&partner).map(|slot| &slot.value),
            Some(&SlotValue::Boolean(true))
        );
        assert_eq!(outcome.ignored.len(), 3);
        assert!(outcome.applied.is_empty());
    }

    // Test IDs: TMRG-008
    #[test]
    fn segregate_policy_keeps_unknown_keys_out_of_canonical_map() {
        let policy = options().with_unknown_keys(UnknownKeyPolicy::Segregate);
        let patch = BTreeMap::from([
            ("crypto_wallet".to_string(), SlotUpdate::bare(json!(700))),
            ("cash".to_string(), SlotUpdate::bare(json!(10))),
        ]);

        let outcome = merge_full(None, &BTreeMap::new(), &patch, policy);
        assert_eq!(outcome.inputs.slots.len(), 1);
        assert!(outcome.inputs.unmapped.contains_key("crypto_wallet"));

        let deltas = BTreeMap::from([("crypto_wallet".to_string(), 50.0)]);
        let after = merge_deltas(Some(&outcome.inputs), &deltas, &BTreeMap::new(), policy);
        assert_eq!(
            after.inputs.unmapped.get("crypto_wallet").map(|slot| &slot.value),
            Some(&SlotValue::Money(750.0))
        );
    }

    // Test IDs: TMRG-009
    #[test]
    fn slot_updates_accept_bare_and_detailed_forms() {
        let decoded: BTreeMap<String, SlotUpdate> = match serde_json::from_value(json!({
            "cash": "2,500",
            "apr": {"value": "19.9%", "confidence": "low"},
            "pets": {"value": 2, "kind": "integer"}
        })) {
            Ok(decoded) => decoded,
            Err(err) => panic!("slot patch should decode: {err}"),
        };
        assert_eq!(decoded.get("cash"), Some(&SlotUpdate::bare(json!("2,500"))));
        assert_eq!(decoded.get("apr").and_then(|update| update.confidence), Some(Confidence::Low));
        assert_eq!(decoded.get("pets").and_then(|update| update.kind), Some(SlotKind::Integer));
    }

    // Test IDs: TMRG-010
    #[test]
    fn snapshot_inputs_serialize_raw_fields_alongside_slots() {
        let inputs = SnapshotInputs {
            slots: slot_map(&[(cash_key(), SlotValue::Money(1.0))]),
            fields: BTreeMap::from([("goal".to_string(), json!("retire"))]),
            ..SnapshotInputs::default()
        };
        let value = match serde_json::to_value(&inputs) {
            Ok(value) => value,
            Err(err) => panic!("inputs should serialize: {err}"),
        };
        assert_eq!(value["goal"], "retire");
        assert_eq!(value["slots"]["cash_liquid_total"]["kind"], "money");
        assert!(value.get("unmapped").is_none());
    }

    fn arb_slot_map() -> impl Strategy<Value = SlotMap> {
        prop::collection::btree_map(
            prop::sample::select(CanonicalKey::ALL.to_vec()),
            0.0_f64..1_000_000.0,
            0..8,
        )
        .prop_map(|entries| {
            entries
                .into_iter()
                .map(|(key, amount)| {
                    let key = SlotKey::Canonical(key);
                    let slot = Slot {
                        key: key.clone(),
                        value: SlotValue::Money(amount),
                        confidence: Confidence::Med,
                    };
                    (key, slot)
                })
                .collect()
        })
    }

    proptest! {
        // Test IDs: TMRG-P01
        #[test]
        fn property_empty_patch_is_a_no_op(slots in arb_slot_map()) {
            let latest = SnapshotInputs { slots: slots.clone(), ..SnapshotInputs::default() };
            let outcome = merge_full(Some(&latest), &BTreeMap::new(), &BTreeMap::new(), options());
            prop_assert_eq!(outcome.inputs.slots, slots);
        }

        // Test IDs: TMRG-P02
        #[test]
        fn property_delta_result_is_never_negative(start in 0.0_f64..1_000_000.0, delta in -2_000_000.0_f64..2_000_000.0) {
            let latest = slot_map(&[(cash_key(), SlotValue::Money(start))]);
            let deltas = BTreeMap::from([("cash".to_string(), delta)]);
            let slots = apply_deltas(&latest, &deltas, &BTreeMap::new());
            let result = money(&cash_key(), &slots);
            prop_assert_eq!(result, Some((start + delta).max(0.0)));
        }
    }
}
