use async_trait::async_trait;
use sqlx::{PgPool, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::entitlement_repository::{EntitlementRepository, UsageRow};
use crate::models::entitlement::TokenBalances;
use crate::models::feature::{ConsumableKind, Feature, UNLIMITED};
use crate::models::subscription::SubscriptionRecord;

pub struct PostgresEntitlementRepository {
    pub pool: PgPool,
}

fn balance_column(kind: ConsumableKind) -> &'static str {
    match kind {
        ConsumableKind::AiTokens => "ai_tokens",
        ConsumableKind::ExportTokens => "export_tokens",
        ConsumableKind::StreakShields => "streak_shields",
    }
}

#[async_trait]
impl EntitlementRepository for PostgresEntitlementRepository {
    async fn find_subscription(
        &self,
        user_id: Uuid,
    ) -> Result<Option<SubscriptionRecord>, sqlx::Error> {
        sqlx::query_as::<_, SubscriptionRecord>(
            r#"
            SELECT user_id, tier, status, billing_interval, current_period_end,
                   cancel_at_period_end, processor_customer_id, processor_subscription_id
            FROM subscriptions
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn upsert_subscription(&self, record: &SubscriptionRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (user_id, tier, status, billing_interval, current_period_end,
                 cancel_at_period_end, processor_customer_id, processor_subscription_id, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
            ON CONFLICT (user_id) DO UPDATE SET
                tier = EXCLUDED.tier,
                status = EXCLUDED.status,
                billing_interval = EXCLUDED.billing_interval,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                processor_customer_id = EXCLUDED.processor_customer_id,
                processor_subscription_id = EXCLUDED.processor_subscription_id,
                updated_at = now()
            "#,
        )
        .bind(record.user_id)
        .bind(&record.tier)
        .bind(&record.status)
        .bind(&record.billing_interval)
        .bind(record.current_period_end)
        .bind(record.cancel_at_period_end)
        .bind(&record.processor_customer_id)
        .bind(&record.processor_subscription_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_user_id_by_customer_id(
        &self,
        customer_id: &str,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT user_id FROM subscriptions WHERE processor_customer_id = $1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn set_customer_id(&self, user_id: Uuid, customer_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (user_id, processor_customer_id, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (user_id) DO UPDATE SET
                processor_customer_id = EXCLUDED.processor_customer_id,
                updated_at = now()
            "#,
        )
        .bind(user_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_usage(&self, user_id: Uuid) -> Result<Vec<UsageRow>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT feature, used, resets_at FROM feature_usage WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut usage = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.try_get("feature")?;
            // Rows for feature keys retired from the app are skipped, not
            // an error: the closed enum is the source of truth.
            let Some(feature) = Feature::from_str(&raw) else {
                continue;
            };
            usage.push(UsageRow {
                feature,
                used: row.try_get("used")?,
                resets_at: row.try_get("resets_at")?,
            });
        }
        Ok(usage)
    }

    async fn reset_usage(
        &self,
        user_id: Uuid,
        feature: Feature,
        now: OffsetDateTime,
        next_reset: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE feature_usage
            SET used = 0, resets_at = $4, updated_at = now()
            WHERE user_id = $1 AND feature = $2 AND resets_at <= $3
            "#,
        )
        .bind(user_id)
        .bind(feature.as_str())
        .bind(now)
        .bind(next_reset)
        .execute(&self.pool)
        .await?;

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
        // Single conditional UPDATE: the WHERE clause and increment are one
        // atomic read-modify-write, so two racing consumers cannot both pass
        // the limit check against the same row state.
        let update = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE feature_usage
            SET used = used + $3, updated_at = now()
            WHERE user_id = $1 AND feature = $2 AND ($4 = -1 OR used + $3 <= $4)
            RETURNING used
            "#,
        )
        .bind(user_id)
        .bind(feature.as_str())
        .bind(quantity)
        .bind(limit)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(new_used) = update {
            return Ok(Some(new_used));
        }

        // No row matched: either the quota is exhausted, or the user has no
        // counter row yet. A first-use insert is valid only when the request
        // itself fits the limit.
        if limit != UNLIMITED && quantity > limit {
            return Ok(None);
        }

        let inserted = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO feature_usage (user_id, feature, used, resets_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, feature) DO NOTHING
            RETURNING used
            "#,
        )
        .bind(user_id)
        .bind(feature.as_str())
        .bind(quantity)
        .bind(resets_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(new_used) = inserted {
            return Ok(Some(new_used));
        }

        // Lost the insert race: a row exists now, retry the guarded update
        // once. A second miss means the quota is genuinely exhausted.
        sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE feature_usage
            SET used = used + $3, updated_at = now()
            WHERE user_id = $1 AND feature = $2 AND ($4 = -1 OR used + $3 <= $4)
            RETURNING used
            "#,
        )
        .bind(user_id)
        .bind(feature.as_str())
        .bind(quantity)
        .bind(limit)
        .fetch_optional(&self.pool)
        .await
    }

    async fn load_balances(&self, user_id: Uuid) -> Result<TokenBalances, sqlx::Error> {
        let row = sqlx::query(
            "SELECT ai_tokens, export_tokens, streak_shields FROM token_balances WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(TokenBalances {
                ai_tokens: row.try_get("ai_tokens")?,
                export_tokens: row.try_get("export_tokens")?,
                streak_shields: row.try_get("streak_shields")?,
            }),
            None => Ok(TokenBalances::default()),
        }
    }

    async fn try_spend_tokens(
        &self,
        user_id: Uuid,
        kind: ConsumableKind,
        quantity: i64,
    ) -> Result<Option<i64>, sqlx::Error> {
        let column = balance_column(kind);
        let sql = format!(
            r#"
            UPDATE token_balances
            SET {column} = {column} - $2, updated_at = now()
            WHERE user_id = $1 AND {column} >= $2
            RETURNING {column}
            "#,
        );

        sqlx::query_scalar::<_, i64>(&sql)
            .bind(user_id)
            .bind(quantity)
            .fetch_optional(&self.pool)
            .await
    }

    async fn credit_tokens(
        &self,
        user_id: Uuid,
        kind: ConsumableKind,
        quantity: i64,
    ) -> Result<i64, sqlx::Error> {
        let column = balance_column(kind);
        let sql = format!(
            r#"
            INSERT INTO token_balances (user_id, {column})
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET
                {column} = token_balances.{column} + EXCLUDED.{column},
                updated_at = now()
            RETURNING {column}
            "#,
        );

        sqlx::query_scalar::<_, i64>(&sql)
            .bind(user_id)
            .bind(quantity)
            .fetch_one(&self.pool)
            .await
    }
}
