use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::api::{ApiClient, ApiError};
use crate::client::cache::{CacheStore, ENTITLEMENTS_CACHE_KEY, TOKEN_BALANCE_CACHE_KEY};
use crate::models::entitlement::{
    evaluate, ConsumeOutcome, EntitlementSnapshot, FeatureDecision, GateReason,
};
use crate::models::feature::Feature;

/// Connectivity signal injected by the surrounding app shell. A seam rather
/// than error sniffing so "reads degrade, writes refuse" is deterministic.
#[cfg_attr(test, mockall::automock)]
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// Client-side render gating. Local checks are advisory only; every
/// mutation goes through the server.
pub struct FeatureGate {
    api: Arc<ApiClient>,
    cache: Arc<CacheStore>,
    connectivity: Arc<dyn Connectivity>,
    user_id: Uuid,
}

impl FeatureGate {
    pub fn new(
        api: Arc<ApiClient>,
        cache: Arc<CacheStore>,
        connectivity: Arc<dyn Connectivity>,
        user_id: Uuid,
    ) -> Self {
        Self {
            api,
            cache,
            connectivity,
            user_id,
        }
    }

    /// The offline-safe predicate: the same `evaluate` the server runs.
    pub fn can_use_feature_local(
        snapshot: &EntitlementSnapshot,
        feature: Feature,
        quantity: i64,
    ) -> FeatureDecision {
        evaluate(snapshot, feature, quantity)
    }

    fn cached_snapshot(&self) -> Option<EntitlementSnapshot> {
        self.cache.get(ENTITLEMENTS_CACHE_KEY, self.user_id)
    }

    /// Evaluate against whatever snapshot is at hand, tagged so the UI can
    /// show reduced confidence.
    fn local_fallback(&self, feature: Feature, quantity: i64) -> FeatureDecision {
        match self.cached_snapshot() {
            Some(snapshot) => {
                Self::can_use_feature_local(&snapshot, feature, quantity)
                    .tagged(GateReason::OfflineCheck)
            }
            None => FeatureDecision::deny(GateReason::Offline, None),
        }
    }

    /// Authoritative check when reachable; cached local check otherwise.
    pub async fn check_feature(&self, feature: Feature, quantity: i64) -> FeatureDecision {
        if self.connectivity.is_online() {
            match self.api.check_feature(feature, quantity).await {
                Ok(decision) => return decision,
                Err(err) if err.is_transient() => {
                    debug!(%err, feature = feature.as_str(), "remote check unreachable, using cached snapshot");
                }
                Err(ApiError::Unauthenticated) => {
                    return FeatureDecision::deny(GateReason::Unauthenticated, None);
                }
                Err(err) => {
                    warn!(%err, feature = feature.as_str(), "remote check failed, using cached snapshot");
                }
            }
        }
        self.local_fallback(feature, quantity)
    }

    /// Consuming offline is refused outright: an offline spend could exceed
    /// limits with no way to reconcile later. Reads degrade, writes do not.
    pub async fn consume_feature(
        &self,
        feature: Feature,
        quantity: i64,
        use_tokens: bool,
    ) -> ConsumeOutcome {
        if !self.connectivity.is_online() {
            return ConsumeOutcome::denied(GateReason::Offline);
        }

        match self.api.consume_feature(feature, quantity, use_tokens).await {
            Ok(outcome) => {
                if outcome.success {
                    self.refresh_after_consume().await;
                }
                outcome
            }
            Err(ApiError::Unauthenticated) => ConsumeOutcome::denied(GateReason::Unauthenticated),
            Err(err) if err.is_transient() => {
                debug!(%err, feature = feature.as_str(), "consume not attempted to completion");
                ConsumeOutcome::denied(GateReason::Offline)
            }
            Err(err) => {
                warn!(%err, feature = feature.as_str(), "remote consume failed");
                ConsumeOutcome::denied(GateReason::InsufficientEntitlement)
            }
        }
    }

    /// The old snapshot is known-stale after a successful consume: drop it
    /// and re-fetch so local checks stay accurate within the session.
    async fn refresh_after_consume(&self) {
        self.cache
            .clear(&[ENTITLEMENTS_CACHE_KEY, TOKEN_BALANCE_CACHE_KEY]);
        match self.api.fetch_subscription().await {
            Ok(response) => {
                self.cache
                    .set(ENTITLEMENTS_CACHE_KEY, &response.entitlements, self.user_id);
                self.cache.set(
                    TOKEN_BALANCE_CACHE_KEY,
                    &response.entitlements.balances,
                    self.user_id,
                );
            }
            Err(err) => {
                // Cache stays empty; the next check falls through to the
                // server or reports offline.
                debug!(%err, "post-consume snapshot refresh failed");
            }
        }
    }
}
