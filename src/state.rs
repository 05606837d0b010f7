use crate::config::Config;
use crate::db::billing_event_log_repository::BillingEventLogRepository;
use crate::db::entitlement_repository::EntitlementRepository;
use crate::services::entitlement::EntitlementService;
use crate::services::stripe::StripeService;
use crate::utils::jwt::JwtKeys;
use reqwest::Client;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn EntitlementRepository>,
    pub billing_events: Arc<dyn BillingEventLogRepository>,
    pub entitlements: EntitlementService,
    pub stripe: Arc<dyn StripeService>,
    pub http_client: Arc<Client>,
    pub config: Arc<Config>,
    pub jwt_keys: Arc<JwtKeys>,
}

/// AppState wired to in-memory mocks; shared by route tests.
#[cfg(test)]
pub fn test_state() -> AppState {
    use crate::db::mock_billing_event_log_repository::MockBillingEventLogRepository;
    use crate::db::mock_entitlement_repository::MockEntitlementRepository;
    use crate::services::stripe::MockStripeService;

    let db: Arc<dyn EntitlementRepository> = Arc::new(MockEntitlementRepository::new());
    AppState {
        db: db.clone(),
        billing_events: Arc::new(MockBillingEventLogRepository::default()),
        entitlements: EntitlementService::new(db),
        stripe: Arc::new(MockStripeService::new()),
        http_client: Arc::new(Client::new()),
        config: Arc::new(test_config()),
        jwt_keys: Arc::new(
            JwtKeys::from_secret("0123456789abcdef0123456789abcdef")
                .expect("test JWT secret should be valid"),
        ),
    }
}

#[cfg(test)]
pub fn test_config() -> Config {
    use crate::config::StripeSettings;
    use std::collections::HashMap;

    Config {
        database_url: String::new(),
        frontend_origin: "https://app.example.com".into(),
        stripe: StripeSettings {
            secret_key: "sk_test_stub".into(),
            webhook_secret: "whsec_stub".into(),
            pro_monthly_price_id: "price_monthly_stub".into(),
            pro_annual_price_id: "price_annual_stub".into(),
            token_price_ids: HashMap::from([
                ("ai_tokens_20".to_string(), "price_ai20_stub".to_string()),
                ("ai_tokens_50".to_string(), "price_ai50_stub".to_string()),
                ("export_tokens_10".to_string(), "price_exp10_stub".to_string()),
                ("streak_shields_3".to_string(), "price_ss3_stub".to_string()),
            ]),
        },
        jwt_issuer: "test-issuer".into(),
        jwt_audience: "test-audience".into(),
    }
}
