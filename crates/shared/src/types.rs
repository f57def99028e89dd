//! Common types used across DojoGate

use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, FromRow, Row};
use std::collections::{BTreeMap, BTreeSet};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::DomainError;

/// Seconds in one trial day
const SECONDS_PER_DAY: i64 = 86_400;

/// Longest accepted feature key / plan name
const MAX_IDENTIFIER_LEN: usize = 64;

// =============================================================================
// Identifier validation
// =============================================================================

fn is_valid_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_IDENTIFIER_LEN
        && s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Validate a feature key (lowercase ascii, digits, `_` or `-`, at most 64 chars)
pub fn validate_feature_key(key: &str) -> Result<(), DomainError> {
    if is_valid_identifier(key) {
        Ok(())
    } else {
        Err(DomainError::InvalidFeatureKey(key.to_string()))
    }
}

/// Validate a plan name (same alphabet as feature keys)
pub fn validate_plan_name(name: &str) -> Result<(), DomainError> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(DomainError::InvalidPlanName(name.to_string()))
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Lifecycle status of a dojo's subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether plan membership grants access in this status.
    /// `past_due` and `cancelled` fail closed.
    pub fn grants_plan_features(&self) -> bool {
        matches!(self, Self::Trial | Self::Active)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trial" | "trialing" => Ok(Self::Trial),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(DomainError::InvalidSubscriptionStatus(s.to_string())),
        }
    }
}

/// Status of a single feature trial.
///
/// `Active` is the only non-terminal state; the other three are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Active,
    Expired,
    Converted,
    Cancelled,
}

impl TrialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Converted => "converted",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TrialStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "converted" => Ok(Self::Converted),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(DomainError::InvalidTrialStatus(s.to_string())),
        }
    }
}

/// Which source of truth decided an access check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessSource {
    Override,
    Addon,
    Trial,
    Plan,
    None,
}

impl AccessSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Override => "override",
            Self::Addon => "addon",
            Self::Trial => "trial",
            Self::Plan => "plan",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for AccessSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AccessSource {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "override" => Ok(Self::Override),
            "addon" => Ok(Self::Addon),
            "trial" => Ok(Self::Trial),
            "plan" => Ok(Self::Plan),
            "none" => Ok(Self::None),
            _ => Err(DomainError::InvalidAccessSource(s.to_string())),
        }
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// A feature that can be gated per dojo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Feature {
    pub key: String,
    pub display_name: String,
    pub description: Option<String>,
    pub trialable: bool,
    pub addon_sellable: bool,
    /// Length of a trial for this feature, in days
    pub trial_days: i32,
}

impl Feature {
    pub fn trial_period(&self) -> Duration {
        Duration::days(i64::from(self.trial_days.max(0)))
    }
}

/// A subscription plan and the feature keys it includes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    pub display_name: String,
    pub included_features: BTreeSet<String>,
    pub price_monthly_cents: i64,
    pub price_yearly_cents: i64,
    pub visible: bool,
}

impl Plan {
    pub fn includes(&self, feature_key: &str) -> bool {
        self.included_features.contains(feature_key)
    }
}

// =============================================================================
// Tenant state
// =============================================================================

/// One subscription record per dojo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSubscription {
    pub tenant_id: Uuid,
    pub plan_name: String,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub plan_trial_ends_at: Option<OffsetDateTime>,
    /// Explicit allow/deny per feature key; outranks every other source
    pub feature_overrides: BTreeMap<String, bool>,
}

impl TenantSubscription {
    pub fn new(tenant_id: Uuid, plan_name: impl Into<String>, status: SubscriptionStatus) -> Self {
        Self {
            tenant_id,
            plan_name: plan_name.into(),
            status,
            plan_trial_ends_at: None,
            feature_overrides: BTreeMap::new(),
        }
    }

    pub fn override_for(&self, feature_key: &str) -> Option<bool> {
        self.feature_overrides.get(feature_key).copied()
    }
}

/// The single lifetime trial of one feature for one dojo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureTrial {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub feature_key: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub status: TrialStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub cancel_reason: Option<String>,
}

impl FeatureTrial {
    /// Build a fresh `active` trial starting at `now`
    pub fn begin(tenant_id: Uuid, feature: &Feature, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            feature_key: feature.key.clone(),
            started_at: now,
            expires_at: now + feature.trial_period(),
            status: TrialStatus::Active,
            ended_at: None,
            cancel_reason: None,
        }
    }

    /// Active status alone is not enough: the expiry must also lie ahead of `now`.
    pub fn is_running(&self, now: OffsetDateTime) -> bool {
        self.status == TrialStatus::Active && now < self.expires_at
    }

    /// Due for the sweep: still marked active but past its expiry
    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        self.status == TrialStatus::Active && self.expires_at <= now
    }

    pub fn days_remaining(&self, now: OffsetDateTime) -> i64 {
        days_until(self.expires_at, now)
    }
}

/// Whole days from `now` until `deadline`, rounded up and floored at zero
pub fn days_until(deadline: OffsetDateTime, now: OffsetDateTime) -> i64 {
    let seconds = (deadline - now).whole_seconds();
    if seconds <= 0 {
        0
    } else {
        (seconds + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY
    }
}

impl<'r> FromRow<'r, PgRow> for FeatureTrial {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("dojo_id")?,
            feature_key: row.try_get("feature_key")?,
            started_at: row.try_get("started_at")?,
            expires_at: row.try_get("expires_at")?,
            status: status.parse().map_err(|e: DomainError| sqlx::Error::ColumnDecode {
                index: "status".to_string(),
                source: Box::new(e),
            })?,
            ended_at: row.try_get("ended_at")?,
            cancel_reason: row.try_get("cancel_reason")?,
        })
    }
}

/// A paid, plan-independent unlock of one feature (owned by billing)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct AddonSubscription {
    #[sqlx(rename = "dojo_id")]
    pub tenant_id: Uuid,
    pub feature_key: String,
    pub active: bool,
    pub monthly_price_cents: i64,
}
