use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::entitlement::EntitlementSnapshot;
use crate::models::plan::{BillingPeriod, PlanTier, SubscriptionStatus};

/// Persisted billing state for one user. Plan and status are stored as the
/// raw strings the processor reported and normalized on read.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub user_id: Uuid,
    pub tier: Option<String>,
    pub status: Option<String>,
    pub billing_interval: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub processor_customer_id: Option<String>,
    pub processor_subscription_id: Option<String>,
}

impl SubscriptionRecord {
    pub fn empty(user_id: Uuid) -> Self {
        Self {
            user_id,
            tier: None,
            status: None,
            billing_interval: None,
            current_period_end: None,
            cancel_at_period_end: false,
            processor_customer_id: None,
            processor_subscription_id: None,
        }
    }

    pub fn tier_normalized(&self) -> PlanTier {
        PlanTier::from_option(self.tier.as_deref())
    }

    pub fn status_normalized(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_option(self.status.as_deref())
    }

    pub fn billing_period(&self) -> BillingPeriod {
        BillingPeriod::from_interval(self.billing_interval.as_deref())
    }
}

/// Wire view of the subscription half of `GET /api/subscription`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub tier: PlanTier,
    pub status: SubscriptionStatus,
    pub billing_period: BillingPeriod,
    #[serde(default, with = "time::serde::timestamp::option")]
    pub period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

impl From<&SubscriptionRecord> for SubscriptionView {
    fn from(record: &SubscriptionRecord) -> Self {
        Self {
            tier: record.tier_normalized(),
            status: record.status_normalized(),
            billing_period: record.billing_period(),
            period_end: record.current_period_end,
            cancel_at_period_end: record.cancel_at_period_end,
        }
    }
}

/// Full body of `GET /api/subscription`, shared by the server route and the
/// client so the frame cannot drift between the two halves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionResponse {
    pub subscription: SubscriptionView,
    pub entitlements: EntitlementSnapshot,
}
