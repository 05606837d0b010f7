use std::collections::BTreeMap;
use std::sync::Arc;

use time::{Date, Duration, Month, OffsetDateTime};
use tracing::warn;
use uuid::Uuid;

use crate::db::entitlement_repository::EntitlementRepository;
use crate::models::entitlement::{
    evaluate, ConsumeOutcome, EntitlementSnapshot, FeatureDecision, FeatureUsage, GateReason,
    TokenBalances,
};
use crate::models::feature::{Feature, ResetCadence, ALL_FEATURES, UNLIMITED};
use crate::models::subscription::SubscriptionRecord;

#[derive(Debug, thiserror::Error)]
pub enum EntitlementError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Authoritative entitlement computation. The only component allowed to
/// mutate usage counters and token balances.
#[derive(Clone)]
pub struct EntitlementService {
    repo: Arc<dyn EntitlementRepository>,
}

/// Next period boundary after `now` for a cadence: the coming UTC midnight
/// for daily quotas, the first of the next month for monthly ones.
pub fn next_reset(cadence: ResetCadence, now: OffsetDateTime) -> OffsetDateTime {
    match cadence {
        ResetCadence::Daily => now
            .date()
            .next_day()
            .map(|d| d.midnight().assume_utc())
            .unwrap_or(now + Duration::days(1)),
        ResetCadence::Monthly => {
            let date = now.date();
            let (year, month) = match date.month() {
                Month::December => (date.year() + 1, Month::January),
                m => (date.year(), m.next()),
            };
            Date::from_calendar_date(year, month, 1)
                .map(|d| d.midnight().assume_utc())
                .unwrap_or(now + Duration::days(30))
        }
    }
}

impl EntitlementService {
    pub fn new(repo: Arc<dyn EntitlementRepository>) -> Self {
        Self { repo }
    }

    pub fn repo(&self) -> &Arc<dyn EntitlementRepository> {
        &self.repo
    }

    /// Builds the snapshot from persisted state, lazily rolling over any
    /// counter whose period boundary has passed. No other side effects.
    pub async fn get_snapshot(
        &self,
        user_id: Uuid,
    ) -> Result<EntitlementSnapshot, EntitlementError> {
        let record = self
            .repo
            .find_subscription(user_id)
            .await?
            .unwrap_or_else(|| SubscriptionRecord::empty(user_id));
        self.snapshot_from_record(&record).await
    }

    pub async fn snapshot_from_record(
        &self,
        record: &SubscriptionRecord,
    ) -> Result<EntitlementSnapshot, EntitlementError> {
        let now = OffsetDateTime::now_utc();
        let tier = record.tier_normalized();
        let status = record.status_normalized();
        let effective = if tier == crate::models::plan::PlanTier::Pro && status.grants_benefits() {
            crate::models::plan::PlanTier::Pro
        } else {
            crate::models::plan::PlanTier::Free
        };

        let mut stored: BTreeMap<Feature, (i64, OffsetDateTime)> = BTreeMap::new();
        for row in self.repo.load_usage(record.user_id).await? {
            stored.insert(row.feature, (row.used, row.resets_at));
        }

        let mut usage = BTreeMap::new();
        for feature in ALL_FEATURES {
            let cadence = feature.spec().cadence;
            let (mut used, mut resets_at) = stored
                .get(&feature)
                .copied()
                .unwrap_or((0, next_reset(cadence, now)));

            if resets_at <= now {
                let next = next_reset(cadence, now);
                self.repo
                    .reset_usage(record.user_id, feature, now, next)
                    .await?;
                used = 0;
                resets_at = next;
            }

            usage.insert(
                feature,
                FeatureUsage {
                    used,
                    limit: feature.limit_for(effective),
                    resets_at,
                },
            );
        }

        let balances = self.repo.load_balances(record.user_id).await?;

        Ok(EntitlementSnapshot {
            tier,
            subscription_status: status,
            billing_period: record.billing_period(),
            period_end: record.current_period_end,
            usage,
            balances,
        })
    }

    /// Pure read: same predicate the client evaluates locally.
    pub async fn check_feature(
        &self,
        user_id: Uuid,
        feature: Feature,
        quantity: i64,
    ) -> Result<FeatureDecision, EntitlementError> {
        let snapshot = self.get_snapshot(user_id).await?;
        Ok(evaluate(&snapshot, feature, quantity))
    }

    pub async fn token_balance(&self, user_id: Uuid) -> Result<TokenBalances, EntitlementError> {
        Ok(self.repo.load_balances(user_id).await?)
    }

    /// The only mutating entitlement operation. Spends exactly one source:
    /// tokens when `prefer_tokens` asks for them (or the quota cannot cover),
    /// period quota otherwise. Each spend is a conditional update, so racing
    /// consumers for the same (user, feature) serialize at the counter row.
    pub async fn consume_feature(
        &self,
        user_id: Uuid,
        feature: Feature,
        quantity: i64,
        prefer_tokens: bool,
    ) -> Result<ConsumeOutcome, EntitlementError> {
        let snapshot = self.get_snapshot(user_id).await?;
        let usage = snapshot.usage_for(feature);
        let substitute = feature.spec().substitute;

        if prefer_tokens {
            if let Some(kind) = substitute {
                if let Some(new_tokens) =
                    self.repo.try_spend_tokens(user_id, kind, quantity).await?
                {
                    if usage.limit == UNLIMITED {
                        return Ok(ConsumeOutcome::spent(quantity, None));
                    }
                    let quota_left = (usage.limit - usage.used).max(0);
                    return Ok(ConsumeOutcome::spent(quantity, Some(quota_left + new_tokens)));
                }
                // Requested tokens are not there; fall through to quota.
            }
        }

        if let Some(new_used) = self
            .repo
            .try_consume_quota(user_id, feature, quantity, usage.limit, usage.resets_at)
            .await?
        {
            if usage.limit == UNLIMITED {
                return Ok(ConsumeOutcome::spent(0, None));
            }
            let tokens = substitute
                .map(|kind| snapshot.balances.get(kind))
                .unwrap_or(0);
            let quota_left = (usage.limit - new_used).max(0);
            return Ok(ConsumeOutcome::spent(0, Some(quota_left + tokens)));
        }

        // Quota exhausted: a covering consumable still satisfies the action,
        // keeping the consume reachable whenever the check said allowed.
        if !prefer_tokens {
            if let Some(kind) = substitute {
                if let Some(new_tokens) =
                    self.repo.try_spend_tokens(user_id, kind, quantity).await?
                {
                    let quota_left = (usage.limit - usage.used).max(0);
                    return Ok(ConsumeOutcome::spent(quantity, Some(quota_left + new_tokens)));
                }
            }
        }

        warn!(%user_id, feature = feature.as_str(), quantity, "consume denied: no covering entitlement");
        Ok(ConsumeOutcome::denied(GateReason::InsufficientEntitlement))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock_entitlement_repository::MockEntitlementRepository;
    use crate::models::plan::PlanTier;
    use time::macros::datetime;

    fn pro_record(user_id: Uuid) -> SubscriptionRecord {
        SubscriptionRecord {
            user_id,
            tier: Some("pro".into()),
            status: Some("active".into()),
            billing_interval: Some("month".into()),
            current_period_end: Some(OffsetDateTime::now_utc() + Duration::days(14)),
            cancel_at_period_end: false,
            processor_customer_id: Some("cus_test".into()),
            processor_subscription_id: Some("sub_test".into()),
        }
    }

    fn service_with(repo: MockEntitlementRepository) -> EntitlementService {
        EntitlementService::new(Arc::new(repo))
    }

    #[test]
    fn next_reset_boundaries() {
        let now = datetime!(2025-06-15 13:45 UTC);
        assert_eq!(
            next_reset(ResetCadence::Daily, now),
            datetime!(2025-06-16 0:00 UTC)
        );
        assert_eq!(
            next_reset(ResetCadence::Monthly, now),
            datetime!(2025-07-01 0:00 UTC)
        );
        assert_eq!(
            next_reset(ResetCadence::Monthly, datetime!(2025-12-31 23:59 UTC)),
            datetime!(2026-01-01 0:00 UTC)
        );
    }

    #[tokio::test]
    async fn snapshot_for_unknown_user_is_free_tier() {
        let service = service_with(MockEntitlementRepository::new());
        let snapshot = service.get_snapshot(Uuid::new_v4()).await.unwrap();
        assert_eq!(snapshot.tier, PlanTier::Free);
        assert!(!snapshot.is_pro());
        assert_eq!(snapshot.usage_for(Feature::AiMealPlan).limit, 2);
        assert_eq!(snapshot.balances, TokenBalances::default());
    }

    #[tokio::test]
    async fn snapshot_rolls_over_expired_periods() {
        let repo = MockEntitlementRepository::new();
        let user = Uuid::new_v4();
        let past = OffsetDateTime::now_utc() - Duration::days(3);
        repo.seed_usage(user, Feature::BarcodeScan, 9, past);

        let service = service_with(repo.clone());
        let snapshot = service.get_snapshot(user).await.unwrap();

        let usage = snapshot.usage_for(Feature::BarcodeScan);
        assert_eq!(usage.used, 0);
        assert!(usage.resets_at > OffsetDateTime::now_utc());
        assert_eq!(repo.reset_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sequential_consumes_count_up_then_deny() {
        let service = service_with(MockEntitlementRepository::new());
        let user = Uuid::new_v4();

        for expected_used in 1..=2 {
            let outcome = service
                .consume_feature(user, Feature::AiMealPlan, 1, false)
                .await
                .unwrap();
            assert!(outcome.success);
            assert_eq!(outcome.tokens_used, 0);
            assert_eq!(outcome.new_balance, Some(2 - expected_used));
        }

        let denied = service
            .consume_feature(user, Feature::AiMealPlan, 1, false)
            .await
            .unwrap();
        assert!(!denied.success);
        assert_eq!(denied.reason, Some(GateReason::InsufficientEntitlement));
    }

    #[tokio::test]
    async fn token_substitution_leaves_quota_untouched() {
        let repo = MockEntitlementRepository::new();
        let user = Uuid::new_v4();
        let future = OffsetDateTime::now_utc() + Duration::days(10);
        repo.seed_usage(user, Feature::AiMealPlan, 2, future);
        repo.seed_balances(
            user,
            TokenBalances {
                ai_tokens: 3,
                ..Default::default()
            },
        );

        let service = service_with(repo.clone());

        let check = service
            .check_feature(user, Feature::AiMealPlan, 2)
            .await
            .unwrap();
        assert!(check.allowed);

        let outcome = service
            .consume_feature(user, Feature::AiMealPlan, 2, true)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.tokens_used, 2);
        assert_eq!(outcome.new_balance, Some(1));

        let usage = repo.usage.lock().unwrap();
        assert_eq!(usage.get(&(user, Feature::AiMealPlan)).unwrap().0, 2);
        drop(usage);
        assert_eq!(repo.balances.lock().unwrap().get(&user).unwrap().ai_tokens, 1);
    }

    #[tokio::test]
    async fn exhausted_quota_falls_back_to_covering_tokens() {
        let repo = MockEntitlementRepository::new();
        let user = Uuid::new_v4();
        let future = OffsetDateTime::now_utc() + Duration::days(10);
        repo.seed_usage(user, Feature::PdfExport, 1, future);
        repo.seed_balances(
            user,
            TokenBalances {
                export_tokens: 2,
                ..Default::default()
            },
        );

        let service = service_with(repo.clone());
        let outcome = service
            .consume_feature(user, Feature::PdfExport, 1, false)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.tokens_used, 1);
        assert_eq!(outcome.new_balance, Some(1));
    }

    #[tokio::test]
    async fn prefer_tokens_spends_tokens_before_quota() {
        let repo = MockEntitlementRepository::new();
        let user = Uuid::new_v4();
        repo.seed_balances(
            user,
            TokenBalances {
                ai_tokens: 5,
                ..Default::default()
            },
        );

        let service = service_with(repo.clone());
        let outcome = service
            .consume_feature(user, Feature::AiMealPlan, 1, true)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.tokens_used, 1);
        // full free quota (2) plus the 4 tokens left
        assert_eq!(outcome.new_balance, Some(6));
        assert!(self::usage_is_empty(&repo, user));
    }

    fn usage_is_empty(repo: &MockEntitlementRepository, user: Uuid) -> bool {
        repo.usage
            .lock()
            .unwrap()
            .iter()
            .all(|((uid, _), (used, _))| *uid != user || *used == 0)
    }

    #[tokio::test]
    async fn unlimited_consume_still_counts_usage() {
        let repo = MockEntitlementRepository::new().with_subscription(pro_record(Uuid::new_v4()));
        let user = repo.subscriptions.lock().unwrap().keys().next().copied().unwrap();

        let service = service_with(repo.clone());
        for _ in 0..3 {
            let outcome = service
                .consume_feature(user, Feature::BarcodeScan, 1, false)
                .await
                .unwrap();
            assert!(outcome.success);
            assert_eq!(outcome.new_balance, None);
        }

        let usage = repo.usage.lock().unwrap();
        assert_eq!(usage.get(&(user, Feature::BarcodeScan)).unwrap().0, 3);
    }

    #[tokio::test]
    async fn concurrent_consumes_never_exceed_the_limit() {
        let repo = MockEntitlementRepository::new();
        let user = Uuid::new_v4();
        let future = OffsetDateTime::now_utc() + Duration::days(10);
        // 2 slots left out of 10
        repo.seed_usage(user, Feature::BarcodeScan, 8, future);

        let service = service_with(repo.clone());
        let mut handles = Vec::new();
        for _ in 0..6 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service
                    .consume_feature(user, Feature::BarcodeScan, 1, false)
                    .await
                    .unwrap()
            }));
        }

        let mut successes = 0;
        let mut denials = 0;
        for handle in handles {
            let outcome = handle.await.unwrap();
            if outcome.success {
                successes += 1;
            } else {
                denials += 1;
                assert_eq!(outcome.reason, Some(GateReason::InsufficientEntitlement));
            }
        }

        assert_eq!(successes, 2);
        assert_eq!(denials, 4);
        let usage = repo.usage.lock().unwrap();
        assert_eq!(usage.get(&(user, Feature::BarcodeScan)).unwrap().0, 10);
    }

    #[tokio::test]
    async fn repository_failures_surface_as_errors() {
        let repo = MockEntitlementRepository {
            should_fail: true,
            ..Default::default()
        };
        let service = service_with(repo);
        let err = service.get_snapshot(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EntitlementError::Database(_)));
    }
}
