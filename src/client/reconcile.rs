use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::api::{ApiClient, ApiError};
use crate::client::cache::{CacheStore, ENTITLEMENTS_CACHE_KEY, TOKEN_BALANCE_CACHE_KEY};
use crate::models::entitlement::EntitlementSnapshot;
use crate::models::subscription::SubscriptionResponse;

pub const RECONCILE_ATTEMPTS: u32 = 5;
pub const RECONCILE_BASE_DELAY: Duration = Duration::from_secs(1);

/// Cooperative cancellation for the reconciliation loop. Cloned into
/// whatever owns the navigation/sign-out side and checked before every
/// attempt.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Client-observed phases of one checkout attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutPhase {
    Idle,
    CheckoutRequested,
    RedirectedToProcessor,
    ReturnedWithSuccess,
    Reconciling,
    Reconciled,
    ReconciliationTimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Reconciled,
    /// All attempts exhausted without observing the expected change.
    /// Non-fatal: the webhook lands server-side regardless, the UI shows
    /// "this may take a few minutes".
    TimedOut,
    /// User navigated away or signed out mid-loop; nothing was applied.
    Cancelled,
}

/// Seam over "fetch the authoritative snapshot" so the retry loop can be
/// driven in tests without a server.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(&self) -> Result<SubscriptionResponse, ApiError>;
}

#[async_trait]
impl SnapshotFetcher for ApiClient {
    async fn fetch(&self) -> Result<SubscriptionResponse, ApiError> {
        self.fetch_subscription().await
    }
}

/// Bounded retry loop waiting for the payment webhook to land: sleeps
/// 1s, 2s, 4s, 8s, 16s (doubling from `base_delay` across `attempts`),
/// stopping the moment `expect` holds. Cancellation and the signed-in user
/// are re-validated before every attempt, not just the first, so an
/// abandoned loop never applies a stale snapshot to a different account.
pub async fn refresh_with_retry<F, U>(
    fetcher: &dyn SnapshotFetcher,
    attempts: u32,
    base_delay: Duration,
    expect: F,
    cancel: &CancelToken,
    current_user: U,
    target_user: Uuid,
) -> (ReconcileOutcome, Option<SubscriptionResponse>)
where
    F: Fn(&EntitlementSnapshot) -> bool,
    U: Fn() -> Option<Uuid>,
{
    for attempt in 0..attempts {
        tokio::time::sleep(base_delay * 2u32.pow(attempt)).await;

        if cancel.is_cancelled() {
            info!(attempt, "reconciliation cancelled");
            return (ReconcileOutcome::Cancelled, None);
        }
        if current_user() != Some(target_user) {
            warn!(attempt, "signed-in user changed mid-reconciliation, aborting");
            return (ReconcileOutcome::Cancelled, None);
        }

        match fetcher.fetch().await {
            Ok(response) if expect(&response.entitlements) => {
                info!(attempt, "reconciliation observed the expected change");
                return (ReconcileOutcome::Reconciled, Some(response));
            }
            Ok(_) => {
                debug!(attempt, "snapshot does not reflect the purchase yet");
            }
            Err(err) => {
                // Transient or not, keep polling: the remaining attempts are
                // the retry policy.
                debug!(%err, attempt, "snapshot refresh attempt failed");
            }
        }
    }

    (ReconcileOutcome::TimedOut, None)
}

/// Drives one checkout attempt end to end on the client: session creation,
/// redirect hand-off, and post-return reconciliation.
pub struct CheckoutFlow {
    api: Arc<ApiClient>,
    cache: Arc<CacheStore>,
    user_id: Uuid,
    phase: CheckoutPhase,
}

impl CheckoutFlow {
    pub fn new(api: Arc<ApiClient>, cache: Arc<CacheStore>, user_id: Uuid) -> Self {
        Self {
            api,
            cache,
            user_id,
            phase: CheckoutPhase::Idle,
        }
    }

    pub fn phase(&self) -> CheckoutPhase {
        self.phase
    }

    pub async fn open_checkout(
        &mut self,
        plan: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<String, ApiError> {
        self.phase = CheckoutPhase::CheckoutRequested;
        match self.api.create_checkout(plan, success_url, cancel_url).await {
            Ok(url) => {
                self.phase = CheckoutPhase::RedirectedToProcessor;
                Ok(url)
            }
            Err(err) => {
                self.phase = CheckoutPhase::Idle;
                Err(err)
            }
        }
    }

    pub async fn purchase_tokens(
        &mut self,
        product_id: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<String, ApiError> {
        self.phase = CheckoutPhase::CheckoutRequested;
        match self
            .api
            .purchase_tokens(product_id, success_url, cancel_url)
            .await
        {
            Ok(url) => {
                self.phase = CheckoutPhase::RedirectedToProcessor;
                Ok(url)
            }
            Err(err) => {
                self.phase = CheckoutPhase::Idle;
                Err(err)
            }
        }
    }

    /// User came back through the cancel URL: the attempt simply ends.
    pub fn handle_cancel_return(&mut self) {
        self.phase = CheckoutPhase::Idle;
    }

    /// User came back through the success URL: the cached snapshot is now
    /// known-stale, so drop it and poll until the webhook-updated state
    /// shows up.
    pub async fn handle_success_return<F, U>(
        &mut self,
        expect: F,
        cancel: &CancelToken,
        current_user: U,
    ) -> ReconcileOutcome
    where
        F: Fn(&EntitlementSnapshot) -> bool,
        U: Fn() -> Option<Uuid>,
    {
        self.phase = CheckoutPhase::ReturnedWithSuccess;
        self.cache
            .clear(&[ENTITLEMENTS_CACHE_KEY, TOKEN_BALANCE_CACHE_KEY]);
        self.phase = CheckoutPhase::Reconciling;

        let (outcome, response) = refresh_with_retry(
            self.api.as_ref(),
            RECONCILE_ATTEMPTS,
            RECONCILE_BASE_DELAY,
            expect,
            cancel,
            &current_user,
            self.user_id,
        )
        .await;

        match outcome {
            ReconcileOutcome::Reconciled => {
                // Re-validate the account before writing: the user may have
                // switched between the last fetch and now.
                if current_user() == Some(self.user_id) {
                    if let Some(response) = response {
                        self.cache.set(
                            ENTITLEMENTS_CACHE_KEY,
                            &response.entitlements,
                            self.user_id,
                        );
                        self.cache.set(
                            TOKEN_BALANCE_CACHE_KEY,
                            &response.entitlements.balances,
                            self.user_id,
                        );
                    }
                }
                self.phase = CheckoutPhase::Reconciled;
            }
            ReconcileOutcome::TimedOut => {
                self.phase = CheckoutPhase::ReconciliationTimedOut;
            }
            ReconcileOutcome::Cancelled => {
                self.phase = CheckoutPhase::Idle;
            }
        }
        outcome
    }
}
