//! Integration tests for payment reconciliation
//!
//! Exercises the settlement paths against a real Postgres database without
//! calling the payment gateway: sessions are inserted through the tracker
//! and settled through the reconciler directly.
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://..."  # migrated test database
//! cargo test --test reconciliation -- --ignored --test-threads=1
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use veriport_billing::{
    BillingError, BillingService, NewPlan, NewSession, NotificationDispatcher, StripeClient,
    StripeConfig,
};
use veriport_shared::types::{BillingCycle, EntitlementStatus, SessionStatus, TargetType};

// ============================================================================
// Test Utilities
// ============================================================================

async fn setup() -> (BillingService, PgPool) {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database");

    // No gateway calls happen on the paths under test
    let stripe = StripeClient::new(StripeConfig {
        secret_key: "sk_test_unused".to_string(),
        webhook_secret: "whsec_test_secret".to_string(),
        app_base_url: "http://localhost:3000".to_string(),
        session_ttl_hours: 24,
    });
    let notifier = NotificationDispatcher::new(pool.clone(), None);

    let billing = BillingService::new(stripe, pool.clone(), notifier);
    (billing, pool)
}

async fn create_test_user(pool: &PgPool) -> Uuid {
    let user_id = Uuid::new_v4();
    sqlx::query("INSERT INTO users (id, email) VALUES ($1, $2)")
        .bind(user_id)
        .bind(format!("test-{}@example.com", user_id))
        .execute(pool)
        .await
        .expect("Failed to create test user");
    user_id
}

async fn create_admin_user(pool: &PgPool) -> Uuid {
    let user_id = Uuid::new_v4();
    sqlx::query("INSERT INTO users (id, email, role) VALUES ($1, $2, 'admin')")
        .bind(user_id)
        .bind(format!("admin-{}@example.com", user_id))
        .execute(pool)
        .await
        .expect("Failed to create admin user");
    user_id
}

async fn create_test_request(pool: &PgPool, owner_id: Uuid) -> Uuid {
    let request_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO check_requests (id, owner_id, subject_name) VALUES ($1, $2, 'Test Subject')",
    )
    .bind(request_id)
    .bind(owner_id)
    .execute(pool)
    .await
    .expect("Failed to create test request");
    request_id
}

async fn create_report_plan(billing: &BillingService) -> Uuid {
    billing
        .plans
        .create(NewPlan {
            name: format!("Standard Report {}", Uuid::new_v4()),
            price_minor_units: 2999,
            currency: "usd".to_string(),
            billing_cycle: BillingCycle::OneTime,
            quota_per_period: 0,
            feature_flags: vec![],
        })
        .await
        .expect("Failed to create report plan")
        .id
}

async fn create_subscription_plan(billing: &BillingService, quota: i32) -> Uuid {
    billing
        .plans
        .create(NewPlan {
            name: format!("Monthly Plan {}", Uuid::new_v4()),
            price_minor_units: 9900,
            currency: "usd".to_string(),
            billing_cycle: BillingCycle::Monthly,
            quota_per_period: quota,
            feature_flags: vec!["priority_processing".to_string()],
        })
        .await
        .expect("Failed to create subscription plan")
        .id
}

fn new_session(
    user_id: Uuid,
    target_type: TargetType,
    target_id: Uuid,
    plan_id: Uuid,
) -> NewSession {
    NewSession {
        session_ref: format!("cs_test_{}", Uuid::new_v4().simple()),
        target_type,
        target_id,
        user_id,
        plan_id: Some(plan_id),
        amount_minor: 2999,
        currency: "usd".to_string(),
        expires_at: OffsetDateTime::now_utc() + Duration::hours(24),
    }
}

async fn cleanup_user(pool: &PgPool, user_id: Uuid) {
    // Sessions and requests cascade from the user row
    let _ = sqlx::query("DELETE FROM users WHERE id = $1")
        .bind(user_id)
        .execute(pool)
        .await;
}

// ============================================================================
// Paid settlement
// ============================================================================

#[tokio::test]
#[ignore]
async fn paid_settlement_completes_request_exactly_once() {
    let (billing, pool) = setup().await;
    let user_id = create_test_user(&pool).await;
    let request_id = create_test_request(&pool, user_id).await;
    let plan_id = create_report_plan(&billing).await;

    let session = billing
        .sessions
        .open(new_session(user_id, TargetType::PerReport, request_id, plan_id))
        .await
        .expect("open session");

    // Settle twice, simulating webhook + redirect confirm racing
    billing
        .reconciler
        .settle_paid(&session.session_ref, Some("pi_test_1"), None)
        .await
        .expect("first settle");
    billing
        .reconciler
        .settle_paid(&session.session_ref, Some("pi_test_1"), None)
        .await
        .expect("replayed settle");

    let settled = billing.sessions.get(&session.session_ref).await.unwrap();
    assert_eq!(settled.status, SessionStatus::Paid);
    assert!(settled.effects_applied);

    let (payment_status,): (String,) =
        sqlx::query_as("SELECT payment_status FROM check_requests WHERE id = $1")
            .bind(request_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(payment_status, "completed");

    // Exactly one succeeded ledger row despite the replay
    let events = billing.ledger.list_for_session(&session.session_ref).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].external_payment_ref.as_deref(), Some("pi_test_1"));

    cleanup_user(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn paid_settlement_activates_subscription() {
    let (billing, pool) = setup().await;
    let user_id = create_test_user(&pool).await;
    let plan_id = create_subscription_plan(&billing, 5).await;

    let session = billing
        .sessions
        .open(new_session(user_id, TargetType::Subscription, user_id, plan_id))
        .await
        .expect("open session");

    billing
        .reconciler
        .settle_paid(&session.session_ref, None, Some("sub_test_1"))
        .await
        .expect("settle");

    let entitlement = billing.entitlements.get_or_init(user_id).await.unwrap();
    assert_eq!(entitlement.status, EntitlementStatus::Active);
    assert_eq!(entitlement.plan_id, Some(plan_id));
    assert_eq!(entitlement.used_this_period, 0);
    assert_eq!(
        entitlement.external_subscription_ref.as_deref(),
        Some("sub_test_1")
    );

    cleanup_user(&pool, user_id).await;
}

// ============================================================================
// Quota consumption
// ============================================================================

#[tokio::test]
#[ignore]
async fn consume_stops_at_quota_ceiling() {
    let (billing, pool) = setup().await;
    let user_id = create_test_user(&pool).await;
    let plan_id = create_subscription_plan(&billing, 2).await;

    let session = billing
        .sessions
        .open(new_session(user_id, TargetType::Subscription, user_id, plan_id))
        .await
        .unwrap();
    billing
        .reconciler
        .settle_paid(&session.session_ref, None, Some("sub_test_2"))
        .await
        .unwrap();

    assert_eq!(billing.entitlements.consume(user_id).await.unwrap().used_this_period, 1);
    assert_eq!(billing.entitlements.consume(user_id).await.unwrap().used_this_period, 2);
    assert!(matches!(
        billing.entitlements.consume(user_id).await,
        Err(BillingError::QuotaExceeded(_))
    ));

    cleanup_user(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn concurrent_consumes_never_exceed_quota() {
    let (billing, pool) = setup().await;
    let user_id = create_test_user(&pool).await;
    let plan_id = create_subscription_plan(&billing, 3).await;

    let session = billing
        .sessions
        .open(new_session(user_id, TargetType::Subscription, user_id, plan_id))
        .await
        .unwrap();
    billing
        .reconciler
        .settle_paid(&session.session_ref, None, Some("sub_test_conc"))
        .await
        .unwrap();

    // Eight consumers race for three units
    let mut handles = Vec::new();
    for _ in 0..8 {
        let ledger = billing.entitlements.clone();
        handles.push(tokio::spawn(async move { ledger.consume(user_id).await }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(BillingError::QuotaExceeded(_)) => {}
            Err(e) => panic!("unexpected consume error: {}", e),
        }
    }
    assert_eq!(succeeded, 3, "exactly the quota's worth of consumes win");

    let entitlement = billing.entitlements.get_or_init(user_id).await.unwrap();
    assert_eq!(entitlement.used_this_period, 3);

    cleanup_user(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn racing_paid_settlements_apply_effects_once() {
    let (billing, pool) = setup().await;
    let user_id = create_test_user(&pool).await;
    let request_id = create_test_request(&pool, user_id).await;
    let plan_id = create_report_plan(&billing).await;

    let session = billing
        .sessions
        .open(new_session(user_id, TargetType::PerReport, request_id, plan_id))
        .await
        .unwrap();

    // Webhook and redirect confirm land at the same time
    let a = {
        let reconciler = billing.reconciler.clone();
        let session_ref = session.session_ref.clone();
        tokio::spawn(async move {
            reconciler.settle_paid(&session_ref, Some("pi_test_race"), None).await
        })
    };
    let b = {
        let reconciler = billing.reconciler.clone();
        let session_ref = session.session_ref.clone();
        tokio::spawn(async move {
            reconciler.settle_paid(&session_ref, Some("pi_test_race"), None).await
        })
    };
    a.await.unwrap().expect("first racer");
    b.await.unwrap().expect("second racer");

    let settled = billing.sessions.get(&session.session_ref).await.unwrap();
    assert_eq!(settled.status, SessionStatus::Paid);
    assert!(settled.effects_applied);

    let (payment_status,): (String,) =
        sqlx::query_as("SELECT payment_status FROM check_requests WHERE id = $1")
            .bind(request_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(payment_status, "completed");

    // One succeeded ledger row no matter who won the claim
    let events = billing.ledger.list_for_session(&session.session_ref).await.unwrap();
    assert_eq!(events.len(), 1);

    cleanup_user(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn consume_without_subscription_is_not_found() {
    let (billing, pool) = setup().await;
    let user_id = create_test_user(&pool).await;

    assert!(matches!(
        billing.entitlements.consume(user_id).await,
        Err(BillingError::NotFound(_))
    ));

    cleanup_user(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn stale_period_anchor_resets_counter() {
    let (billing, pool) = setup().await;
    let user_id = create_test_user(&pool).await;
    let plan_id = create_subscription_plan(&billing, 2).await;

    let session = billing
        .sessions
        .open(new_session(user_id, TargetType::Subscription, user_id, plan_id))
        .await
        .unwrap();
    billing
        .reconciler
        .settle_paid(&session.session_ref, None, Some("sub_test_3"))
        .await
        .unwrap();

    billing.entitlements.consume(user_id).await.unwrap();
    billing.entitlements.consume(user_id).await.unwrap();

    // Rewind the anchor into the previous month; the next touch must reset
    sqlx::query(
        "UPDATE entitlements SET period_anchor = NOW() - INTERVAL '40 days' WHERE user_id = $1",
    )
    .bind(user_id)
    .execute(&pool)
    .await
    .unwrap();

    let entitlement = billing.entitlements.consume(user_id).await.unwrap();
    assert_eq!(entitlement.used_this_period, 1);

    cleanup_user(&pool, user_id).await;
}

// ============================================================================
// Failure and expiry settlement
// ============================================================================

#[tokio::test]
#[ignore]
async fn failed_settlement_fails_request_and_ledgers_once() {
    let (billing, pool) = setup().await;
    let user_id = create_test_user(&pool).await;
    let request_id = create_test_request(&pool, user_id).await;
    let plan_id = create_report_plan(&billing).await;

    let session = billing
        .sessions
        .open(new_session(user_id, TargetType::PerReport, request_id, plan_id))
        .await
        .unwrap();

    billing
        .reconciler
        .settle_failed(&session.session_ref, "card declined")
        .await
        .unwrap();
    billing
        .reconciler
        .settle_failed(&session.session_ref, "card declined")
        .await
        .unwrap();

    let settled = billing.sessions.get(&session.session_ref).await.unwrap();
    assert_eq!(settled.status, SessionStatus::Canceled);
    assert_eq!(settled.failure_reason.as_deref(), Some("card declined"));

    let (payment_status,): (String,) =
        sqlx::query_as("SELECT payment_status FROM check_requests WHERE id = $1")
            .bind(request_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(payment_status, "failed");

    let events = billing.ledger.list_for_session(&session.session_ref).await.unwrap();
    assert_eq!(events.len(), 1);

    cleanup_user(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn failure_after_paid_settlement_is_ignored() {
    let (billing, pool) = setup().await;
    let user_id = create_test_user(&pool).await;
    let request_id = create_test_request(&pool, user_id).await;
    let plan_id = create_report_plan(&billing).await;

    let session = billing
        .sessions
        .open(new_session(user_id, TargetType::PerReport, request_id, plan_id))
        .await
        .unwrap();

    billing
        .reconciler
        .settle_paid(&session.session_ref, Some("pi_test_4"), None)
        .await
        .unwrap();
    // Out-of-order failure report must not undo the paid settlement
    billing
        .reconciler
        .settle_failed(&session.session_ref, "late failure")
        .await
        .unwrap();

    let settled = billing.sessions.get(&session.session_ref).await.unwrap();
    assert_eq!(settled.status, SessionStatus::Paid);

    let (payment_status,): (String,) =
        sqlx::query_as("SELECT payment_status FROM check_requests WHERE id = $1")
            .bind(request_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(payment_status, "completed");

    cleanup_user(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn expiry_frees_the_open_session_slot() {
    let (billing, pool) = setup().await;
    let user_id = create_test_user(&pool).await;
    let request_id = create_test_request(&pool, user_id).await;
    let plan_id = create_report_plan(&billing).await;

    let first = billing
        .sessions
        .open(new_session(user_id, TargetType::PerReport, request_id, plan_id))
        .await
        .unwrap();

    // Second attempt for the same target is rejected while the first is open
    assert!(matches!(
        billing
            .sessions
            .open(new_session(user_id, TargetType::PerReport, request_id, plan_id))
            .await,
        Err(BillingError::Conflict(_))
    ));

    billing.reconciler.settle_expired(&first.session_ref).await.unwrap();

    let expired = billing.sessions.get(&first.session_ref).await.unwrap();
    assert_eq!(expired.status, SessionStatus::Expired);
    // Expiry writes no ledger rows
    assert!(billing
        .ledger
        .list_for_session(&first.session_ref)
        .await
        .unwrap()
        .is_empty());

    // The slot is free again
    billing
        .sessions
        .open(new_session(user_id, TargetType::PerReport, request_id, plan_id))
        .await
        .expect("reopen after expiry");

    cleanup_user(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn lapsed_session_does_not_block_new_checkout() {
    let (billing, pool) = setup().await;
    let user_id = create_test_user(&pool).await;
    let request_id = create_test_request(&pool, user_id).await;
    let plan_id = create_report_plan(&billing).await;

    let abandoned = billing
        .sessions
        .open(new_session(user_id, TargetType::PerReport, request_id, plan_id))
        .await
        .unwrap();

    // The user walked away and the TTL lapsed, but no sweep has run yet
    sqlx::query(
        "UPDATE payment_sessions SET expires_at = NOW() - INTERVAL '1 hour' \
         WHERE session_ref = $1",
    )
    .bind(&abandoned.session_ref)
    .execute(&pool)
    .await
    .unwrap();

    // A fresh attempt must not be locked out behind the dead one
    let fresh = billing
        .sessions
        .open(new_session(user_id, TargetType::PerReport, request_id, plan_id))
        .await
        .expect("new attempt after TTL lapse");
    assert_eq!(fresh.status, SessionStatus::Open);

    let old = billing.sessions.get(&abandoned.session_ref).await.unwrap();
    assert_eq!(old.status, SessionStatus::Expired);

    cleanup_user(&pool, user_id).await;
}

#[tokio::test]
#[ignore]
async fn paid_report_on_closed_session_alerts_admins() {
    let (billing, pool) = setup().await;
    let admin_id = create_admin_user(&pool).await;
    let user_id = create_test_user(&pool).await;
    let request_id = create_test_request(&pool, user_id).await;
    let plan_id = create_report_plan(&billing).await;

    let session = billing
        .sessions
        .open(new_session(user_id, TargetType::PerReport, request_id, plan_id))
        .await
        .unwrap();
    billing.reconciler.settle_expired(&session.session_ref).await.unwrap();

    // The late paid report acks cleanly but settles nothing
    billing
        .reconciler
        .settle_paid(&session.session_ref, Some("pi_test_late"), None)
        .await
        .expect("late paid report is acknowledged");

    let closed = billing.sessions.get(&session.session_ref).await.unwrap();
    assert_eq!(closed.status, SessionStatus::Expired);
    assert!(!closed.effects_applied);
    assert!(billing
        .ledger
        .list_for_session(&session.session_ref)
        .await
        .unwrap()
        .is_empty());

    // Operators hear about the stranded money
    let alerts = billing.notifier.list_for_user(admin_id, true, 10).await.unwrap();
    assert!(
        alerts.iter().any(|n| n.event_type == "payment.refund_required"
            && n.payload["session_ref"] == session.session_ref.as_str()),
        "admin should receive a refund-required notification"
    );

    cleanup_user(&pool, user_id).await;
    cleanup_user(&pool, admin_id).await;
}

// ============================================================================
// Webhook event claims
// ============================================================================

#[tokio::test]
#[ignore]
async fn webhook_event_claim_is_exclusive() {
    let (_billing, pool) = setup().await;
    let event_ref = format!("evt_test_{}", Uuid::new_v4().simple());

    let claim_sql = r#"
        INSERT INTO gateway_webhook_events
            (event_ref, event_type, event_timestamp, processing_result, processing_started_at)
        VALUES ($1, 'checkout.session.completed', NOW(), 'processing', NOW())
        ON CONFLICT (event_ref) DO UPDATE SET
            processing_result = 'processing',
            processing_started_at = NOW()
        WHERE gateway_webhook_events.processing_result = 'error'
           OR (gateway_webhook_events.processing_result = 'processing'
               AND gateway_webhook_events.processing_started_at < NOW() - INTERVAL '30 minutes')
        RETURNING id
    "#;

    let first: Option<(Uuid,)> = sqlx::query_as(claim_sql)
        .bind(&event_ref)
        .fetch_optional(&pool)
        .await
        .unwrap();
    assert!(first.is_some(), "first delivery claims the event");

    let replay: Option<(Uuid,)> = sqlx::query_as(claim_sql)
        .bind(&event_ref)
        .fetch_optional(&pool)
        .await
        .unwrap();
    assert!(replay.is_none(), "replay must not re-claim a fresh event");

    // A claim stuck past the timeout may be recovered
    sqlx::query(
        "UPDATE gateway_webhook_events \
         SET processing_started_at = NOW() - INTERVAL '31 minutes' \
         WHERE event_ref = $1",
    )
    .bind(&event_ref)
    .execute(&pool)
    .await
    .unwrap();

    let recovered: Option<(Uuid,)> = sqlx::query_as(claim_sql)
        .bind(&event_ref)
        .fetch_optional(&pool)
        .await
        .unwrap();
    assert!(recovered.is_some(), "stuck claim is recoverable");

    // A processing attempt that errored is re-claimable immediately, so a
    // gateway redelivery actually retries instead of acking as a duplicate
    sqlx::query(
        "UPDATE gateway_webhook_events \
         SET processing_result = 'error', error_message = 'transient db failure' \
         WHERE event_ref = $1",
    )
    .bind(&event_ref)
    .execute(&pool)
    .await
    .unwrap();

    let redelivered: Option<(Uuid,)> = sqlx::query_as(claim_sql)
        .bind(&event_ref)
        .fetch_optional(&pool)
        .await
        .unwrap();
    assert!(redelivered.is_some(), "errored claim is re-claimable on redelivery");

    // And a successfully processed event stays claimed forever
    sqlx::query(
        "UPDATE gateway_webhook_events SET processing_result = 'success' WHERE event_ref = $1",
    )
    .bind(&event_ref)
    .execute(&pool)
    .await
    .unwrap();

    let replay_after_success: Option<(Uuid,)> = sqlx::query_as(claim_sql)
        .bind(&event_ref)
        .fetch_optional(&pool)
        .await
        .unwrap();
    assert!(replay_after_success.is_none(), "completed events are never reprocessed");

    let _ = sqlx::query("DELETE FROM gateway_webhook_events WHERE event_ref = $1")
        .bind(&event_ref)
        .execute(&pool)
        .await;
}

// ============================================================================
// Plan catalog
// ============================================================================

#[tokio::test]
#[ignore]
async fn hard_delete_refused_while_subscribed() {
    let (billing, pool) = setup().await;
    let user_id = create_test_user(&pool).await;
    let plan_id = create_subscription_plan(&billing, 5).await;

    let session = billing
        .sessions
        .open(new_session(user_id, TargetType::Subscription, user_id, plan_id))
        .await
        .unwrap();
    billing
        .reconciler
        .settle_paid(&session.session_ref, None, Some("sub_test_5"))
        .await
        .unwrap();

    assert!(matches!(
        billing.plans.hard_delete(plan_id).await,
        Err(BillingError::Conflict(_))
    ));

    // Deactivation still works and hides the plan from purchase
    billing.plans.deactivate(plan_id).await.unwrap();
    assert!(matches!(
        billing.plans.get_for_purchase(plan_id).await,
        Err(BillingError::NotFound(_))
    ));

    cleanup_user(&pool, user_id).await;
}
