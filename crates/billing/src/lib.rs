//! Veriport billing
//!
//! Plan catalog, entitlement ledger, checkout session tracking, payment
//! reconciliation, and notification dispatch, backed by Stripe and Postgres.

pub mod checkout;
pub mod client;
pub mod entitlement;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod plans;
pub mod reconcile;
pub mod sessions;
pub mod webhooks;

pub use checkout::{CheckoutResponse, CheckoutService};
pub use client::{StripeClient, StripeConfig};
pub use entitlement::{Entitlement, EntitlementLedger, EntitlementSummary};
pub use error::{BillingError, BillingResult};
pub use ledger::{NewPaymentEvent, PaymentEvent, PaymentLedger};
pub use notify::{DeviceToken, Notification, NotificationDispatcher};
pub use plans::{NewPlan, Plan, PlanCatalog};
pub use reconcile::Reconciler;
pub use sessions::{NewSession, PaymentSession, SessionTracker};
pub use webhooks::WebhookHandler;

use sqlx::PgPool;

/// One handle over every billing service, wired to a shared pool and
/// gateway client. The API and worker each construct one at startup.
#[derive(Clone)]
pub struct BillingService {
    pub plans: PlanCatalog,
    pub entitlements: EntitlementLedger,
    pub sessions: SessionTracker,
    pub ledger: PaymentLedger,
    pub checkout: CheckoutService,
    pub reconciler: Reconciler,
    pub webhooks: WebhookHandler,
    pub notifier: NotificationDispatcher,
}

impl BillingService {
    pub fn new(stripe: StripeClient, pool: PgPool, notifier: NotificationDispatcher) -> Self {
        let reconciler = Reconciler::new(stripe.clone(), pool.clone(), notifier.clone());
        Self {
            plans: PlanCatalog::new(pool.clone()),
            entitlements: EntitlementLedger::new(pool.clone()),
            sessions: SessionTracker::new(pool.clone()),
            ledger: PaymentLedger::new(pool.clone()),
            checkout: CheckoutService::new(stripe.clone(), pool.clone()),
            webhooks: WebhookHandler::new(stripe, pool, reconciler.clone()),
            reconciler,
            notifier,
        }
    }

    /// Construct from `STRIPE_*` and `NOTIFY_*` environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let notifier = NotificationDispatcher::from_env(pool.clone());
        Ok(Self::new(stripe, pool, notifier))
    }
}
