use async_trait::async_trait;
use sqlx::PgPool;

use crate::db::billing_event_log_repository::BillingEventLogRepository;

pub struct PostgresBillingEventLogRepository {
    pub pool: PgPool,
}

#[async_trait]
impl BillingEventLogRepository for PostgresBillingEventLogRepository {
    async fn mark_if_new(&self, event_id: &str) -> Result<bool, sqlx::Error> {
        // ON CONFLICT DO NOTHING makes the insert itself the atomic
        // first-delivery check: exactly one delivery observes rows_affected = 1.
        let result = sqlx::query(
            r#"
            INSERT INTO billing_event_log (event_id)
            VALUES ($1)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
