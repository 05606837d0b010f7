use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::db::billing_event_log_repository::BillingEventLogRepository;

#[derive(Clone, Default)]
pub struct MockBillingEventLogRepository {
    events: Arc<Mutex<HashSet<String>>>,
    pub inserts: Arc<Mutex<usize>>,
}

impl MockBillingEventLogRepository {
    pub fn recorded_events(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().cloned().collect()
    }
}

#[async_trait]
impl BillingEventLogRepository for MockBillingEventLogRepository {
    async fn mark_if_new(&self, event_id: &str) -> Result<bool, sqlx::Error> {
        *self.inserts.lock().unwrap() += 1;
        Ok(self.events.lock().unwrap().insert(event_id.to_string()))
    }
}
