//! Common types used across Veriport

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Sentinel quota value meaning "unlimited" on a plan
pub const QUOTA_UNLIMITED: i32 = -1;

// =============================================================================
// Enums
// =============================================================================

/// Billing cycle of a purchasable plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    /// A single report purchase
    OneTime,
    /// A recurring monthly subscription
    Monthly,
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OneTime => write!(f, "one_time"),
            Self::Monthly => write!(f, "monthly"),
        }
    }
}

impl FromStr for BillingCycle {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one_time" => Ok(Self::OneTime),
            "monthly" => Ok(Self::Monthly),
            _ => Err(ParseEnumError::new("BillingCycle", s)),
        }
    }
}

/// Payment status of a background-check request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(ParseEnumError::new("PaymentStatus", s)),
        }
    }
}

/// Lifecycle status of a checkout session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Paid,
    Expired,
    Canceled,
}

impl SessionStatus {
    /// Terminal states are write-once; later events must no-op.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Open)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Paid => write!(f, "paid"),
            Self::Expired => write!(f, "expired"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl FromStr for SessionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "paid" => Ok(Self::Paid),
            "expired" => Ok(Self::Expired),
            "canceled" => Ok(Self::Canceled),
            _ => Err(ParseEnumError::new("SessionStatus", s)),
        }
    }
}

/// What a checkout session pays for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    /// One background-check report (target_id = request id)
    PerReport,
    /// A recurring plan (target_id = user id)
    Subscription,
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PerReport => write!(f, "per_report"),
            Self::Subscription => write!(f, "subscription"),
        }
    }
}

impl FromStr for TargetType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per_report" => Ok(Self::PerReport),
            "subscription" => Ok(Self::Subscription),
            _ => Err(ParseEnumError::new("TargetType", s)),
        }
    }
}

/// Subscription state of a user's entitlement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntitlementStatus {
    #[default]
    Inactive,
    Active,
    PastDue,
    Canceled,
    Trialing,
}

impl std::fmt::Display for EntitlementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inactive => write!(f, "inactive"),
            Self::Active => write!(f, "active"),
            Self::PastDue => write!(f, "past_due"),
            Self::Canceled => write!(f, "canceled"),
            Self::Trialing => write!(f, "trialing"),
        }
    }
}

impl FromStr for EntitlementStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(Self::Inactive),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "canceled" => Ok(Self::Canceled),
            "trialing" => Ok(Self::Trialing),
            _ => Err(ParseEnumError::new("EntitlementStatus", s)),
        }
    }
}

/// Status of an append-only payment ledger row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentEventStatus {
    Succeeded,
    Pending,
    Failed,
    Canceled,
    Refunded,
}

impl std::fmt::Display for PaymentEventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Pending => write!(f, "pending"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
            Self::Refunded => write!(f, "refunded"),
        }
    }
}

impl FromStr for PaymentEventStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "pending" => Ok(Self::Pending),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            "refunded" => Ok(Self::Refunded),
            _ => Err(ParseEnumError::new("PaymentEventStatus", s)),
        }
    }
}

// =============================================================================
// Quota
// =============================================================================

/// Remaining quota for a user's current period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "count", rename_all = "lowercase")]
pub enum Remaining {
    Unlimited,
    Count(i32),
}

impl Remaining {
    /// Compute remaining units from a plan quota and the period counter.
    /// `quota` uses [`QUOTA_UNLIMITED`] as the unlimited sentinel.
    pub fn from_quota(quota: i32, used_this_period: i32) -> Self {
        if quota == QUOTA_UNLIMITED {
            Self::Unlimited
        } else {
            Self::Count((quota - used_this_period).max(0))
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Count(0))
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Failure to parse a TEXT-encoded enum column
#[derive(Debug, thiserror::Error)]
#[error("invalid {kind} value: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_round_trips() {
        assert_eq!(SessionStatus::Paid.to_string(), "paid");
        assert_eq!("past_due".parse::<EntitlementStatus>().ok(), Some(EntitlementStatus::PastDue));
        assert_eq!("per_report".parse::<TargetType>().ok(), Some(TargetType::PerReport));
        assert!("bogus".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SessionStatus::Open.is_terminal());
        assert!(SessionStatus::Paid.is_terminal());
        assert!(SessionStatus::Expired.is_terminal());
        assert!(SessionStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_remaining_quota() {
        assert_eq!(Remaining::from_quota(QUOTA_UNLIMITED, 999), Remaining::Unlimited);
        assert_eq!(Remaining::from_quota(5, 3), Remaining::Count(2));
        // Counter past the ceiling clamps to zero rather than going negative
        assert_eq!(Remaining::from_quota(5, 7), Remaining::Count(0));
        assert!(Remaining::Count(0).is_exhausted());
        assert!(!Remaining::Unlimited.is_exhausted());
    }
}
