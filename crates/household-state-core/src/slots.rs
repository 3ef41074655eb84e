use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Fixed vocabulary of canonical financial facts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalKey {
    IncomeNetMonthly,
    PartnerIncomeNetMonthly,
    IncomeGrossAnnual,
    EssentialExpensesMonthly,
    DiscretionaryExpensesMonthly,
    HousingCostMonthly,
    CashLiquidTotal,
    InvestmentsTotal,
    RetirementBalanceTotal,
    RetirementContributionRate,
    EmployerMatchRate,
    DebtHighInterestTotal,
    DebtOtherTotal,
    MortgageBalance,
    DebtMinPaymentsMonthly,
    DebtInterestRateAvg,
    BirthYear,
    Partner,
    Dependants,
    HomeOwner,
    HasWill,
    HasLifeInsurance,
    EmploymentStatus,
    Country,
    RetirementTargetAge,
}

impl CanonicalKey {
    pub const ALL: [Self; 25] = [
        Self::IncomeNetMonthly,
        Self::PartnerIncomeNetMonthly,
        Self::IncomeGrossAnnual,
        Self::EssentialExpensesMonthly,
        Self::DiscretionaryExpensesMonthly,
        Self::HousingCostMonthly,
        Self::CashLiquidTotal,
        Self::InvestmentsTotal,
        Self::RetirementBalanceTotal,
        Self::RetirementContributionRate,
        Self::EmployerMatchRate,
        Self::DebtHighInterestTotal,
        Self::DebtOtherTotal,
        Self::MortgageBalance,
        Self::DebtMinPaymentsMonthly,
        Self::DebtInterestRateAvg,
        Self::BirthYear,
        Self::Partner,
        Self::Dependants,
        Self::HomeOwner,
        Self::HasWill,
        Self::HasLifeInsurance,
        Self::EmploymentStatus,
        Self::Country,
        Self::RetirementTargetAge,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IncomeNetMonthly => "income_net_monthly",
            Self::PartnerIncomeNetMonthly => "partner_income_net_monthly",
            Self::IncomeGrossAnnual => "income_gross_annual",
            Self::EssentialExpensesMonthly => "essential_expenses_monthly",
            Self::DiscretionaryExpensesMonthly => "discretionary_expenses_monthly",
            Self::HousingCostMonthly => "housing_cost_monthly",
            Self::CashLiquidTotal => "cash_liquid_total",
            Self::InvestmentsTotal => "investments_total",
            Self::RetirementBalanceTotal => "retirement_balance_total",
            Self::RetirementContributionRate => "retirement_contribution_rate",
            Self::EmployerMatchRate => "employer_match_rate",
            Self::DebtHighInterestTotal => "debt_high_interest_total",
            Self::DebtOtherTotal => "debt_other_total",
            Self::MortgageBalance => "mortgage_balance",
            Self::DebtMinPaymentsMonthly => "debt_min_payments_monthly",
            Self::DebtInterestRateAvg => "debt_interest_rate_avg",
            Self::BirthYear => "birth_year",
            Self::Partner => "partner",
            Self::Dependants => "dependants",
            Self::HomeOwner => "home_owner",
            Self::HasWill => "has_will",
            Self::HasLifeInsurance => "has_life_insurance",
            Self::EmploymentStatus => "employment_status",
            Self::Country => "country",
            Self::RetirementTargetAge => "retirement_target_age",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == value)
    }

    /// Declared value kind; coercion always targets this kind for canonical keys.
    #[must_use]
    pub fn kind(self) -> SlotKind {
        match self {
            Self::IncomeNetMonthly
            | Self::PartnerIncomeNetMonthly
            | Self::IncomeGrossAnnual
            | Self::EssentialExpensesMonthly
            | Self::DiscretionaryExpensesMonthly
            | Self::HousingCostMonthly
            | Self::CashLiquidTotal
            | Self::InvestmentsTotal
            | Self::RetirementBalanceTotal
            | Self::DebtHighInterestTotal
            | Self::DebtOtherTotal
            | Self::MortgageBalance
            | Self::DebtMinPaymentsMonthly => SlotKind::Money,
            Self::RetirementContributionRate
            | Self::EmployerMatchRate
            | Self::DebtInterestRateAvg => SlotKind::Percent,
            Self::Dependants | Self::RetirementTargetAge => SlotKind::Integer,
            Self::Partner | Self::HomeOwner | Self::HasWill | Self::HasLifeInsurance => {
                SlotKind::Boolean
            }
            Self::EmploymentStatus | Self::Country => SlotKind::Text,
            Self::BirthYear => SlotKind::Year,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    Money,
    Percent,
    Integer,
    Boolean,
    Text,
    Year,
}

impl SlotKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Money => "money",
            Self::Percent => "percent",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Text => "text",
            Self::Year => "year",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "money" => Some(Self::Money),
            "percent" => Some(Self::Percent),
            "integer" => Some(Self::Integer),
            "boolean" => Some(Self::Boolean),
            "text" => Some(Self::Text),
            "year" => Some(Self::Year),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Money | Self::Percent | Self::Integer)
    }
}

/// Slot map key: a vocabulary member, or a caller key that matched no alias.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SlotKey {
    Canonical(CanonicalKey),
    Unmapped(String),
}

impl SlotKey {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Canonical(key) => key.as_str(),
            Self::Unmapped(raw) => raw.as_str(),
        }
    }

    #[must_use]
    pub fn canonical(&self) -> Option<CanonicalKey> {
        match self {
            Self::Canonical(key) => Some(*key),
            Self::Unmapped(_) => None,
        }
    }

    #[must_use]
    pub fn declared_kind(&self) -> Option<SlotKind> {
        self.canonical().map(CanonicalKey::kind)
    }
}

impl From<CanonicalKey> for SlotKey {
    fn from(value: CanonicalKey) -> Self {
        Self::Canonical(value)
    }
}

impl Display for SlotKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SlotKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SlotKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(CanonicalKey::parse(&raw).map_or(Self::Unmapped(raw), Self::Canonical))
    }
}

/// Typed slot value. Only the canonicalizer's coercion step constructs these
/// from raw caller input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SlotValue {
    Money(f64),
    /// Fraction in `[0, 1]` for ordinary percentages.
    Percent(f64),
    Integer(i64),
    Boolean(bool),
    Text(String),
    Year(i32),
}

impl SlotValue {
    #[must_use]
    pub fn kind(&self) -> SlotKind {
        match self {
            Self::Money(_) => SlotKind::Money,
            Self::Percent(_) => SlotKind::Percent,
            Self::Integer(_) => SlotKind::Integer,
            Self::Boolean(_) => SlotKind::Boolean,
            Self::Text(_) => SlotKind::Text,
            Self::Year(_) => SlotKind::Year,
        }
    }

    /// Numeric reading used by delta merges; non-numeric kinds have none.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Money(value) | Self::Percent(value) => Some(*value),
            Self::Integer(value) => Some(*value as f64),
            Self::Boolean(_) | Self::Text(_) | Self::Year(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    #[default]
    Med,
    High,
}

impl Confidence {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Med => "med",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "med" | "medium" => Some(Self::Med),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Slot {
    pub key: SlotKey,
    #[serde(flatten)]
    pub value: SlotValue,
    #[serde(default)]
    pub confidence: Confidence,
}

pub type SlotMap = BTreeMap<SlotKey, Slot>;

#[cfg(test)]
mod tests {
    use super::*;

    // Test IDs: TSL-001
    #[test]
    fn canonical_keys_round_trip_through_their_names() {
        for key in CanonicalKey::ALL {
            assert_eq!(CanonicalKey::parse(key.as_str()), Some(key));
        }
    }

    // Test IDs: TSL-002
    #[test]
    fn slot_serializes_flat_with_kind_and_value() {
        let slot = Slot {
            key: SlotKey::Canonical(CanonicalKey::CashLiquidTotal),
            value: SlotValue::Money(2500.0),
            confidence: Confidence::High,
        };
        let value = match serde_json::to_value(&slot) {
            Ok(value) => value,
            Err(err) => panic!("slot should serialize: {err}"),
        };
        assert_eq!(value["key"], "cash_liquid_total");
        assert_eq!(value["kind"], "money");
        assert_eq!(value["value"].as_f64(), Some(2500.0));
        assert_eq!(value["confidence"], "high");

        let decoded: Slot = match serde_json::from_value(value) {
            Ok(decoded) => decoded,
            Err(err) => panic!("slot should deserialize: {err}"),
        };
        assert_eq!(decoded, slot);
    }

    // Test IDs: TSL-003
    #[test]
    fn unknown_slot_keys_deserialize_as_unmapped() {
        let key: SlotKey = match serde_json::from_str("\"crypto_wallet\"") {
            Ok(key) => key,
            Err(err) => panic!("key should deserialize: {err}"),
        };
        assert_eq!(key, SlotKey::Unmapped("crypto_wallet".to_string()));
        assert_eq!(key.declared_kind(), None);
    }

    // Test IDs: TSL-004
    #[test]
    fn only_money_percent_and_integer_expose_numbers() {
        assert_eq!(SlotValue::Integer(3).as_number(), Some(3.0));
        assert_eq!(SlotValue::Percent(0.1).as_number(), Some(0.1));
        assert_eq!(SlotValue::Year(1990).as_number(), None);
        assert_eq!(SlotValue::Boolean(true).as_number(), None);
    }
}
