//! Plan catalog
//!
//! Purchasable plans: a priced, quota-bearing offering. Rows are immutable
//! once referenced by a live entitlement, except for the `active` flag and
//! feature-flag toggles.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use veriport_shared::types::BillingCycle;

use crate::error::{BillingError, BillingResult};

/// A purchasable plan
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub price_minor_units: i64,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    /// -1 means unlimited
    pub quota_per_period: i32,
    pub feature_flags: Vec<String>,
    pub active: bool,
    pub created_at: OffsetDateTime,
}

impl Plan {
    pub fn has_feature(&self, flag: &str) -> bool {
        self.feature_flags.iter().any(|f| f == flag)
    }
}

/// Input for creating a plan
#[derive(Debug, Clone, Deserialize)]
pub struct NewPlan {
    pub name: String,
    pub price_minor_units: i64,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    pub quota_per_period: i32,
    #[serde(default)]
    pub feature_flags: Vec<String>,
}

const PLAN_COLUMNS: &str = "id, name, price_minor_units, currency, billing_cycle, \
     quota_per_period, feature_flags, active, created_at";

/// Plan catalog service
#[derive(Clone)]
pub struct PlanCatalog {
    pool: PgPool,
}

impl PlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// List active plans, cheapest first.
    /// Ties break on insertion order so the UI ordering is stable.
    pub async fn list_active(&self) -> BillingResult<Vec<Plan>> {
        let plans: Vec<Plan> = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE active = TRUE \
             ORDER BY price_minor_units ASC, created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(plans)
    }

    /// Fetch a plan by id regardless of active flag
    pub async fn get(&self, plan_id: Uuid) -> BillingResult<Plan> {
        let plan: Option<Plan> =
            sqlx::query_as(&format!("SELECT {PLAN_COLUMNS} FROM plans WHERE id = $1"))
                .bind(plan_id)
                .fetch_optional(&self.pool)
                .await?;

        plan.ok_or_else(|| BillingError::NotFound(format!("Plan {} not found", plan_id)))
    }

    /// Fetch a plan for a purchase flow; deactivated plans are not purchasable
    pub async fn get_for_purchase(&self, plan_id: Uuid) -> BillingResult<Plan> {
        let plan = self.get(plan_id).await?;
        if !plan.active {
            return Err(BillingError::NotFound(format!(
                "Plan {} is no longer available",
                plan_id
            )));
        }
        Ok(plan)
    }

    /// Create a new plan (admin)
    pub async fn create(&self, new_plan: NewPlan) -> BillingResult<Plan> {
        if new_plan.price_minor_units < 0 {
            return Err(BillingError::Validation("price must be >= 0".to_string()));
        }
        if new_plan.quota_per_period < -1 {
            return Err(BillingError::Validation(
                "quota must be >= 0, or -1 for unlimited".to_string(),
            ));
        }

        let plan: Plan = sqlx::query_as(&format!(
            "INSERT INTO plans (name, price_minor_units, currency, billing_cycle, \
                 quota_per_period, feature_flags) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {PLAN_COLUMNS}"
        ))
        .bind(&new_plan.name)
        .bind(new_plan.price_minor_units)
        .bind(new_plan.currency.to_lowercase())
        .bind(new_plan.billing_cycle)
        .bind(new_plan.quota_per_period)
        .bind(&new_plan.feature_flags)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            plan_id = %plan.id,
            name = %plan.name,
            price_minor_units = plan.price_minor_units,
            billing_cycle = %plan.billing_cycle,
            "Created plan"
        );

        Ok(plan)
    }

    /// Soft-delete: the plan disappears from purchase flows but existing
    /// subscribers keep their entitlement.
    pub async fn deactivate(&self, plan_id: Uuid) -> BillingResult<()> {
        let result = sqlx::query("UPDATE plans SET active = FALSE, updated_at = NOW() WHERE id = $1")
            .bind(plan_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("Plan {} not found", plan_id)));
        }

        tracing::info!(plan_id = %plan_id, "Deactivated plan");
        Ok(())
    }

    /// Hard-delete a plan. Refused while any live entitlement references it;
    /// the existence check and the delete run as one statement so a
    /// concurrent activation cannot slip between them.
    pub async fn hard_delete(&self, plan_id: Uuid) -> BillingResult<()> {
        let live_subscribers = self.live_subscriber_count(plan_id).await?;
        if live_subscribers > 0 {
            return Err(BillingError::Conflict(format!(
                "Plan {} has {} live subscriber(s)",
                plan_id, live_subscribers
            )));
        }

        let result = sqlx::query(
            r#"
            DELETE FROM plans
            WHERE id = $1
              AND NOT EXISTS (
                  SELECT 1 FROM entitlements
                  WHERE plan_id = $1
                    AND status IN ('active', 'past_due', 'trialing')
              )
            "#,
        )
        .bind(plan_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Either absent, or a subscriber appeared since the precheck
            let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM plans WHERE id = $1")
                .bind(plan_id)
                .fetch_optional(&self.pool)
                .await?;
            return match exists {
                Some(_) => Err(BillingError::Conflict(format!(
                    "Plan {} has live subscriber(s)",
                    plan_id
                ))),
                None => Err(BillingError::NotFound(format!("Plan {} not found", plan_id))),
            };
        }

        tracing::info!(plan_id = %plan_id, "Hard-deleted plan");
        Ok(())
    }

    /// Count entitlements that still grant access under this plan
    pub async fn live_subscriber_count(&self, plan_id: Uuid) -> BillingResult<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM entitlements \
             WHERE plan_id = $1 AND status IN ('active', 'past_due', 'trialing')",
        )
        .bind(plan_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.0)
    }
}
