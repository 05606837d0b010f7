use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::models::feature::{ConsumableKind, Feature, UNLIMITED};
use crate::models::plan::{BillingPeriod, PlanTier, SubscriptionStatus};

/// Stable machine-readable reason attached to gating decisions. The UI maps
/// these onto upsell copy; the core only guarantees the values stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    AiMealPlanLimitReached,
    AiRecipeLimitReached,
    PdfExportLimitReached,
    BarcodeScanLimitReached,
    StreakShieldRequired,
    InsufficientEntitlement,
    Offline,
    OfflineCheck,
    Unauthenticated,
}

impl Feature {
    pub fn limit_reason(self) -> GateReason {
        match self {
            Feature::AiMealPlan => GateReason::AiMealPlanLimitReached,
            Feature::AiRecipe => GateReason::AiRecipeLimitReached,
            Feature::PdfExport => GateReason::PdfExportLimitReached,
            Feature::BarcodeScan => GateReason::BarcodeScanLimitReached,
            Feature::StreakRestore => GateReason::StreakShieldRequired,
        }
    }
}

/// One feature's usage counter as materialized into a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureUsage {
    pub used: i64,
    pub limit: i64,
    #[serde(with = "time::serde::timestamp")]
    pub resets_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalances {
    pub ai_tokens: i64,
    pub export_tokens: i64,
    pub streak_shields: i64,
}

impl TokenBalances {
    pub fn get(&self, kind: ConsumableKind) -> i64 {
        match kind {
            ConsumableKind::AiTokens => self.ai_tokens,
            ConsumableKind::ExportTokens => self.export_tokens,
            ConsumableKind::StreakShields => self.streak_shields,
        }
    }

    pub fn set(&mut self, kind: ConsumableKind, value: i64) {
        match kind {
            ConsumableKind::AiTokens => self.ai_tokens = value,
            ConsumableKind::ExportTokens => self.export_tokens = value,
            ConsumableKind::StreakShields => self.streak_shields = value,
        }
    }
}

/// Point-in-time view of a user's entitlements. Produced only by the server;
/// the client holds read-only copies and replaces them wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementSnapshot {
    pub tier: PlanTier,
    pub subscription_status: SubscriptionStatus,
    pub billing_period: BillingPeriod,
    #[serde(default, with = "time::serde::timestamp::option")]
    pub period_end: Option<OffsetDateTime>,
    pub usage: BTreeMap<Feature, FeatureUsage>,
    pub balances: TokenBalances,
}

impl EntitlementSnapshot {
    pub fn is_pro(&self) -> bool {
        self.tier == PlanTier::Pro && self.subscription_status.grants_benefits()
    }

    /// The tier whose limits apply right now. A lapsed pro subscription
    /// falls back to free limits without touching the stored tier.
    pub fn effective_tier(&self) -> PlanTier {
        if self.is_pro() {
            PlanTier::Pro
        } else {
            PlanTier::Free
        }
    }

    pub fn usage_for(&self, feature: Feature) -> FeatureUsage {
        self.usage.get(&feature).copied().unwrap_or(FeatureUsage {
            used: 0,
            limit: feature.limit_for(self.effective_tier()),
            resets_at: OffsetDateTime::UNIX_EPOCH,
        })
    }
}

/// Result of a feature check. Denial is a value, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureDecision {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<GateReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<i64>,
}

impl FeatureDecision {
    pub fn allow(remaining: Option<i64>) -> Self {
        Self {
            allowed: true,
            reason: None,
            remaining,
        }
    }

    pub fn deny(reason: GateReason, remaining: Option<i64>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            remaining,
        }
    }

    pub fn tagged(mut self, reason: GateReason) -> Self {
        self.reason = Some(reason);
        self
    }
}

/// Result of a consume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeOutcome {
    pub success: bool,
    pub tokens_used: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_balance: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<GateReason>,
}

impl ConsumeOutcome {
    pub fn spent(tokens_used: i64, new_balance: Option<i64>) -> Self {
        Self {
            success: true,
            tokens_used,
            new_balance,
            reason: None,
        }
    }

    pub fn denied(reason: GateReason) -> Self {
        Self {
            success: false,
            tokens_used: 0,
            new_balance: None,
            reason: Some(reason),
        }
    }
}

/// The gating predicate. Pure and side-effect free; the server's remote
/// check and the client's offline local check both call this exact function
/// so the two can never drift.
///
/// One consistent remaining rule everywhere: period quota left plus the
/// substitutable consumable balance. An unlimited quota short-circuits.
pub fn evaluate(snapshot: &EntitlementSnapshot, feature: Feature, quantity: i64) -> FeatureDecision {
    let usage = snapshot.usage_for(feature);
    if usage.limit == UNLIMITED {
        return FeatureDecision::allow(None);
    }

    let quota_left = (usage.limit - usage.used).max(0);
    let substitute = feature
        .spec()
        .substitute
        .map(|kind| snapshot.balances.get(kind))
        .unwrap_or(0);
    let remaining = quota_left + substitute;

    if remaining >= quantity {
        FeatureDecision::allow(Some(remaining))
    } else {
        FeatureDecision::deny(feature.limit_reason(), Some(remaining))
    }
}
