use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::entitlement_repository::{EntitlementRepository, UsageRow};
use crate::models::entitlement::TokenBalances;
use crate::models::feature::{ConsumableKind, Feature, UNLIMITED};
use crate::models::subscription::SubscriptionRecord;

/// In-memory repository for tests. All state sits behind one mutex, which
/// gives the same per-row serialization the conditional UPDATEs provide in
/// Postgres.
#[derive(Clone, Default)]
pub struct MockEntitlementRepository {
    pub subscriptions: Arc<Mutex<HashMap<Uuid, SubscriptionRecord>>>,
    pub usage: Arc<Mutex<HashMap<(Uuid, Feature), (i64, OffsetDateTime)>>>,
    pub balances: Arc<Mutex<HashMap<Uuid, TokenBalances>>>,
    pub should_fail: bool,
    pub consume_calls: Arc<Mutex<usize>>,
    pub reset_calls: Arc<Mutex<Vec<(Uuid, Feature)>>>,
    pub credits: Arc<Mutex<Vec<(Uuid, ConsumableKind, i64)>>>,
}

impl MockEntitlementRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscription(self, record: SubscriptionRecord) -> Self {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(record.user_id, record);
        self
    }

    pub fn seed_usage(&self, user_id: Uuid, feature: Feature, used: i64, resets_at: OffsetDateTime) {
        self.usage
            .lock()
            .unwrap()
            .insert((user_id, feature), (used, resets_at));
    }

    pub fn seed_balances(&self, user_id: Uuid, balances: TokenBalances) {
        self.balances.lock().unwrap().insert(user_id, balances);
    }

    fn fail_check(&self) -> Result<(), sqlx::Error> {
        if self.should_fail {
            return Err(sqlx::Error::Protocol("mock repository failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EntitlementRepository for MockEntitlementRepository {
    async fn find_subscription(
        &self,
        user_id: Uuid,
    ) -> Result<Option<SubscriptionRecord>, sqlx::Error> {
        self.fail_check()?;
        Ok(self.subscriptions.lock().unwrap().get(&user_id).cloned())
    }

    async fn upsert_subscription(&self, record: &SubscriptionRecord) -> Result<(), sqlx::Error> {
        self.fail_check()?;
        self.subscriptions
            .lock()
            .unwrap()
            .insert(record.user_id, record.clone());
        Ok(())
    }

    async fn find_user_id_by_customer_id(
        &self,
        customer_id: &str,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        self.fail_check()?;
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .find(|r| r.processor_customer_id.as_deref() == Some(customer_id))
            .map(|r| r.user_id))
    }

    async fn set_customer_id(&self, user_id: Uuid, customer_id: &str) -> Result<(), sqlx::Error> {
        self.fail_check()?;
        let mut subs = self.subscriptions.lock().unwrap();
        subs.entry(user_id)
            .or_insert_with(|| SubscriptionRecord::empty(user_id))
            .processor_customer_id = Some(customer_id.to_string());
        Ok(())
    }

    async fn load_usage(&self, user_id: Uuid) -> Result<Vec<UsageRow>, sqlx::Error> {
        self.fail_check()?;
        Ok(self
            .usage
            .lock()
            .unwrap()
            .iter()
            .filter(|((uid, _), _)| *uid == user_id)
            .map(|((_, feature), (used, resets_at))| UsageRow {
                feature: *feature,
                used: *used,
                resets_at: *resets_at,
            })
            .collect())
    }

    async fn reset_usage(
        &self,
        user_id: Uuid,
        feature: Feature,
        now: OffsetDateTime,
        next_reset: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        self.fail_check()?;
        self.reset_calls.lock().unwrap().push((user_id, feature));
        let mut usage = self.usage.lock().unwrap();
        if let Some(entry) = usage.get_mut(&(user_id, feature)) {
            if entry.1 <= now {
                *entry = (0, next_reset);
            }
        }
        Ok(())
    }

    async fn try_consume_quota(
        &self,
        user_id: Uuid,
        feature: Feature,
        quantity: i64,
        limit: i64,
        resets_at: OffsetDateTime,
    ) -> Result<Option<i64>, sqlx::Error> {
        self.fail_check()?;
        *self.consume_calls.lock().unwrap() += 1;

        let mut usage = self.usage.lock().unwrap();
        let entry = usage.entry((user_id, feature)).or_insert((0, resets_at));
        if limit == UNLIMITED || entry.0 + quantity <= limit {
            entry.0 += quantity;
            Ok(Some(entry.0))
        } else {
            Ok(None)
        }
    }

    async fn load_balances(&self, user_id: Uuid) -> Result<TokenBalances, sqlx::Error> {
        self.fail_check()?;
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&user_id)
            .copied()
            .unwrap_or_default())
    }

    async fn try_spend_tokens(
        &self,
        user_id: Uuid,
        kind: ConsumableKind,
        quantity: i64,
    ) -> Result<Option<i64>, sqlx::Error> {
        self.fail_check()?;
        let mut balances = self.balances.lock().unwrap();
        let entry = balances.entry(user_id).or_default();
        let current = entry.get(kind);
        if current >= quantity {
            entry.set(kind, current - quantity);
            Ok(Some(current - quantity))
        } else {
            Ok(None)
        }
    }

    async fn credit_tokens(
        &self,
        user_id: Uuid,
        kind: ConsumableKind,
        quantity: i64,
    ) -> Result<i64, sqlx::Error> {
        self.fail_check()?;
        self.credits.lock().unwrap().push((user_id, kind, quantity));
        let mut balances = self.balances.lock().unwrap();
        let entry = balances.entry(user_id).or_default();
        entry.set(kind, entry.get(kind) + quantity);
        Ok(entry.get(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn quota_consume_is_conditional() {
        let repo = MockEntitlementRepository::new();
        let user = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();

        assert_eq!(
            repo.try_consume_quota(user, Feature::AiMealPlan, 1, 2, now)
                .await
                .unwrap(),
            Some(1)
        );
        assert_eq!(
            repo.try_consume_quota(user, Feature::AiMealPlan, 1, 2, now)
                .await
                .unwrap(),
            Some(2)
        );
        assert_eq!(
            repo.try_consume_quota(user, Feature::AiMealPlan, 1, 2, now)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn token_spend_never_goes_negative() {
        let repo = MockEntitlementRepository::new();
        let user = Uuid::new_v4();
        repo.seed_balances(
            user,
            TokenBalances {
                ai_tokens: 1,
                ..Default::default()
            },
        );

        assert_eq!(
            repo.try_spend_tokens(user, ConsumableKind::AiTokens, 2)
                .await
                .unwrap(),
            None
        );
        assert_eq!(
            repo.try_spend_tokens(user, ConsumableKind::AiTokens, 1)
                .await
                .unwrap(),
            Some(0)
        );
    }
}
