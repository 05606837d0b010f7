use async_trait::async_trait;

/// Dedup ledger for processor webhook deliveries, keyed on the processor's
/// unique event identifier. Retried or duplicated deliveries must not apply
/// their mutation twice.
#[async_trait]
pub trait BillingEventLogRepository: Send + Sync {
    /// Records the event id. Returns `true` when this is the first delivery
    /// and the caller should apply the event's side effects; `false` when
    /// the event was already processed.
    async fn mark_if_new(&self, event_id: &str) -> Result<bool, sqlx::Error>;
}
