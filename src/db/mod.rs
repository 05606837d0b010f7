pub mod billing_event_log_repository;
pub mod entitlement_repository;
pub mod postgres_billing_event_log_repository;
pub mod postgres_entitlement_repository;

pub mod mock_billing_event_log_repository;
pub mod mock_entitlement_repository;
