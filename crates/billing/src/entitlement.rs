//! Entitlement ledger
//!
//! One row per user holding their subscription state and period usage
//! counter. Quota consumption is a single conditional UPDATE joined to the
//! plan row, so two concurrent consumers can never both take the last unit.
//! Period rollover is lazy: the counter resets on the first touch after a
//! calendar-month boundary rather than via a scheduled job.

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use veriport_shared::types::{EntitlementStatus, Remaining};

use crate::error::{BillingError, BillingResult};

/// A user's subscription entitlement row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Entitlement {
    pub user_id: Uuid,
    pub plan_id: Option<Uuid>,
    pub status: EntitlementStatus,
    pub used_this_period: i32,
    pub period_anchor: OffsetDateTime,
    pub external_subscription_ref: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Entitlement {
    pub fn grants_access(&self) -> bool {
        matches!(
            self.status,
            EntitlementStatus::Active | EntitlementStatus::PastDue | EntitlementStatus::Trialing
        )
    }
}

/// Entitlement plus the derived quota view the API returns
#[derive(Debug, Clone, Serialize)]
pub struct EntitlementSummary {
    #[serde(flatten)]
    pub entitlement: Entitlement,
    pub plan_name: Option<String>,
    pub remaining: Remaining,
}

const ENTITLEMENT_COLUMNS: &str = "user_id, plan_id, status, used_this_period, \
     period_anchor, external_subscription_ref, created_at, updated_at";

/// True when `anchor` falls in an earlier calendar month (UTC) than `now`.
/// Mirrors the `date_trunc('month', ...)` comparison the SQL paths use.
pub fn period_rolled_over(anchor: OffsetDateTime, now: OffsetDateTime) -> bool {
    let anchor = anchor.to_offset(time::UtcOffset::UTC);
    let now = now.to_offset(time::UtcOffset::UTC);
    (anchor.year(), anchor.month()) < (now.year(), now.month())
}

/// Entitlement ledger service
#[derive(Clone)]
pub struct EntitlementLedger {
    pool: PgPool,
}

impl EntitlementLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fetch the user's entitlement, creating the default inactive row on
    /// first touch. The insert is idempotent under concurrent first touches.
    pub async fn get_or_init(&self, user_id: Uuid) -> BillingResult<Entitlement> {
        sqlx::query("INSERT INTO entitlements (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        self.rollover_if_stale(user_id).await?;

        let entitlement: Entitlement = sqlx::query_as(&format!(
            "SELECT {ENTITLEMENT_COLUMNS} FROM entitlements WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(entitlement)
    }

    /// Entitlement plus plan name and remaining quota
    pub async fn summary(&self, user_id: Uuid) -> BillingResult<EntitlementSummary> {
        let entitlement = self.get_or_init(user_id).await?;

        let plan: Option<(String, i32)> = match entitlement.plan_id {
            Some(plan_id) => {
                sqlx::query_as("SELECT name, quota_per_period FROM plans WHERE id = $1")
                    .bind(plan_id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            None => None,
        };

        let remaining = match (&plan, entitlement.grants_access()) {
            (Some((_, quota)), true) => Remaining::from_quota(*quota, entitlement.used_this_period),
            _ => Remaining::Count(0),
        };

        Ok(EntitlementSummary {
            entitlement,
            plan_name: plan.map(|(name, _)| name),
            remaining,
        })
    }

    /// Remaining quota for the current period. `Count(0)` when the user has
    /// no active subscription.
    pub async fn remaining(&self, user_id: Uuid) -> BillingResult<Remaining> {
        self.rollover_if_stale(user_id).await?;

        let row: Option<(i32, i32)> = sqlx::query_as(
            "SELECT e.used_this_period, p.quota_per_period FROM entitlements e \
             JOIN plans p ON e.plan_id = p.id \
             WHERE e.user_id = $1 AND e.status = 'active'",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((used, quota)) => Remaining::from_quota(quota, used),
            None => Remaining::Count(0),
        })
    }

    /// Whether one unit could be consumed right now. Pure check, spends
    /// nothing; UX only. `consume` re-checks atomically.
    pub async fn can_consume(&self, user_id: Uuid) -> BillingResult<bool> {
        Ok(!self.remaining(user_id).await?.is_exhausted())
    }

    /// Consume one quota unit for an active subscriber.
    ///
    /// Errors with `QuotaExceeded` when the period allowance is used up and
    /// `NotFound` when the user has no active subscription at all. The guard
    /// and the increment are one statement.
    pub async fn consume(&self, user_id: Uuid) -> BillingResult<Entitlement> {
        self.rollover_if_stale(user_id).await?;

        let updated: Option<Entitlement> = sqlx::query_as(&format!(
            "UPDATE entitlements e \
             SET used_this_period = e.used_this_period + 1, updated_at = NOW() \
             FROM plans p \
             WHERE e.user_id = $1 \
               AND e.plan_id = p.id \
               AND e.status = 'active' \
               AND (p.quota_per_period = -1 OR e.used_this_period < p.quota_per_period) \
             RETURNING e.{}",
            ENTITLEMENT_COLUMNS.replace(", ", ", e.")
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(entitlement) => {
                tracing::debug!(
                    user_id = %user_id,
                    used_this_period = entitlement.used_this_period,
                    "Consumed one quota unit"
                );
                Ok(entitlement)
            }
            None => {
                // Distinguish "no subscription" from "subscription exhausted"
                let active: Option<(i32,)> = sqlx::query_as(
                    "SELECT e.used_this_period FROM entitlements e \
                     JOIN plans p ON e.plan_id = p.id \
                     WHERE e.user_id = $1 AND e.status = 'active'",
                )
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

                match active {
                    Some(_) => Err(BillingError::QuotaExceeded(format!(
                        "User {} has no quota remaining this period",
                        user_id
                    ))),
                    None => Err(BillingError::NotFound(format!(
                        "User {} has no active subscription",
                        user_id
                    ))),
                }
            }
        }
    }

    /// Return one previously consumed unit, e.g. when report generation
    /// fails after the quota was taken. Never goes below zero.
    pub async fn release_one(&self, user_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            "UPDATE entitlements \
             SET used_this_period = GREATEST(used_this_period - 1, 0), updated_at = NOW() \
             WHERE user_id = $1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Activate an entitlement directly (admin assignment, no payment)
    pub async fn activate(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        subscription_ref: Option<&str>,
    ) -> BillingResult<Entitlement> {
        let mut tx = self.pool.begin().await?;
        Self::activate_in_tx(&mut tx, user_id, plan_id, subscription_ref).await?;
        tx.commit().await?;

        let entitlement: Entitlement = sqlx::query_as(&format!(
            "SELECT {ENTITLEMENT_COLUMNS} FROM entitlements WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(entitlement)
    }

    /// Activate the entitlement after a settled subscription purchase.
    /// Runs inside the caller's reconciliation transaction.
    pub async fn activate_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        plan_id: Uuid,
        subscription_ref: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            "INSERT INTO entitlements \
                 (user_id, plan_id, status, used_this_period, period_anchor, external_subscription_ref) \
             VALUES ($1, $2, 'active', 0, NOW(), $3) \
             ON CONFLICT (user_id) DO UPDATE SET \
                 plan_id = EXCLUDED.plan_id, \
                 status = 'active', \
                 used_this_period = 0, \
                 period_anchor = NOW(), \
                 external_subscription_ref = EXCLUDED.external_subscription_ref, \
                 updated_at = NOW()",
        )
        .bind(user_id)
        .bind(plan_id)
        .bind(subscription_ref)
        .execute(&mut **tx)
        .await?;

        tracing::info!(user_id = %user_id, plan_id = %plan_id, "Activated entitlement");
        Ok(())
    }

    /// Apply a gateway-reported subscription status by subscription ref.
    /// Returns the affected user, or None when we hold no matching row
    /// (e.g. a subscription created outside this system).
    pub async fn set_status_by_subscription_ref(
        &self,
        subscription_ref: &str,
        status: EntitlementStatus,
    ) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "UPDATE entitlements SET status = $2, updated_at = NOW() \
             WHERE external_subscription_ref = $1 \
             RETURNING user_id",
        )
        .bind(subscription_ref)
        .bind(status)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((user_id,)) = &row {
            tracing::info!(
                user_id = %user_id,
                subscription_ref = %subscription_ref,
                status = %status,
                "Updated entitlement status from gateway"
            );
        }

        Ok(row.map(|(user_id,)| user_id))
    }

    /// Cancel the user's subscription locally
    pub async fn cancel(&self, user_id: Uuid) -> BillingResult<Entitlement> {
        let updated: Option<Entitlement> = sqlx::query_as(&format!(
            "UPDATE entitlements SET status = 'canceled', updated_at = NOW() \
             WHERE user_id = $1 AND status IN ('active', 'past_due', 'trialing') \
             RETURNING {ENTITLEMENT_COLUMNS}"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        updated.ok_or_else(|| {
            BillingError::Conflict(format!("User {} has no cancellable subscription", user_id))
        })
    }

    /// Reset the usage counter when the period anchor predates the current
    /// calendar month. No-op otherwise.
    async fn rollover_if_stale(&self, user_id: Uuid) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE entitlements \
             SET used_this_period = 0, period_anchor = NOW(), updated_at = NOW() \
             WHERE user_id = $1 \
               AND date_trunc('month', period_anchor) < date_trunc('month', NOW())",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::debug!(user_id = %user_id, "Rolled entitlement period over");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_rollover_predicate() {
        let anchor = datetime!(2025-03-15 10:00 UTC);
        assert!(!period_rolled_over(anchor, datetime!(2025-03-31 23:59 UTC)));
        assert!(period_rolled_over(anchor, datetime!(2025-04-01 00:00 UTC)));
        // Year boundary
        assert!(period_rolled_over(
            datetime!(2024-12-31 23:59 UTC),
            datetime!(2025-01-01 00:00 UTC)
        ));
        // Anchor in the future never rolls over
        assert!(!period_rolled_over(
            datetime!(2025-05-01 00:00 UTC),
            datetime!(2025-04-30 12:00 UTC)
        ));
    }

    #[test]
    fn test_grants_access() {
        let mut e = Entitlement {
            user_id: Uuid::nil(),
            plan_id: None,
            status: EntitlementStatus::Active,
            used_this_period: 0,
            period_anchor: OffsetDateTime::UNIX_EPOCH,
            external_subscription_ref: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        };
        assert!(e.grants_access());
        e.status = EntitlementStatus::PastDue;
        assert!(e.grants_access());
        e.status = EntitlementStatus::Canceled;
        assert!(!e.grants_access());
        e.status = EntitlementStatus::Inactive;
        assert!(!e.grants_access());
    }
}
