use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::entitlement::TokenBalances;
use crate::models::feature::{ConsumableKind, Feature};
use crate::models::subscription::SubscriptionRecord;

/// One persisted usage counter row. The applicable limit is derived from the
/// user's tier at read time, not stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRow {
    pub feature: Feature,
    pub used: i64,
    pub resets_at: OffsetDateTime,
}

#[async_trait]
pub trait EntitlementRepository: Send + Sync {
    async fn find_subscription(
        &self,
        user_id: Uuid,
    ) -> Result<Option<SubscriptionRecord>, sqlx::Error>;

    async fn upsert_subscription(&self, record: &SubscriptionRecord) -> Result<(), sqlx::Error>;

    async fn find_user_id_by_customer_id(
        &self,
        customer_id: &str,
    ) -> Result<Option<Uuid>, sqlx::Error>;

    async fn set_customer_id(&self, user_id: Uuid, customer_id: &str) -> Result<(), sqlx::Error>;

    async fn load_usage(&self, user_id: Uuid) -> Result<Vec<UsageRow>, sqlx::Error>;

    /// Lazy period rollover: zero the counter and advance the boundary, but
    /// only if the stored boundary is still in the past (idempotent under
    /// concurrent snapshot reads).
    async fn reset_usage(
        &self,
        user_id: Uuid,
        feature: Feature,
        now: OffsetDateTime,
        next_reset: OffsetDateTime,
    ) -> Result<(), sqlx::Error>;

    /// Conditionally increment the (user, feature) counter by `quantity`.
    /// The comparison against `limit` and the increment happen in one atomic
    /// step so concurrent consumers serialize on the row. Returns the new
    /// `used` value, or `None` when the quota would be exceeded.
    ///
    /// `limit == UNLIMITED` disables the comparison but still counts.
    async fn try_consume_quota(
        &self,
        user_id: Uuid,
        feature: Feature,
        quantity: i64,
        limit: i64,
        resets_at: OffsetDateTime,
    ) -> Result<Option<i64>, sqlx::Error>;

    async fn load_balances(&self, user_id: Uuid) -> Result<TokenBalances, sqlx::Error>;

    /// Conditionally decrement a consumable balance. Returns the new balance,
    /// or `None` when the balance does not cover `quantity`. Never drives a
    /// balance negative.
    async fn try_spend_tokens(
        &self,
        user_id: Uuid,
        kind: ConsumableKind,
        quantity: i64,
    ) -> Result<Option<i64>, sqlx::Error>;

    /// Credit a purchased consumable pack. Returns the new balance.
    async fn credit_tokens(
        &self,
        user_id: Uuid,
        kind: ConsumableKind,
        quantity: i64,
    ) -> Result<i64, sqlx::Error>;
}
