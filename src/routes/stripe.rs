use axum::Json;
use axum::{extract::State, http::HeaderMap, response::IntoResponse};
use axum::{http::StatusCode, response::Response};
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::feature::find_token_product;
use crate::models::subscription::SubscriptionRecord;
use crate::responses::JsonResponse;
use crate::state::AppState;

// Small helper: nested json lookup
fn jget<'a>(val: &'a serde_json::Value, path: &[&str]) -> Option<&'a serde_json::Value> {
    let mut cur = val;
    for key in path {
        cur = cur.get(*key)?;
    }
    Some(cur)
}

fn extract_str<'a>(val: &'a serde_json::Value, path: &[&str]) -> Option<&'a str> {
    jget(val, path)?.as_str()
}

fn extract_i64(val: &serde_json::Value, path: &[&str]) -> Option<i64> {
    jget(val, path)?.as_i64()
}

fn extract_bool(val: &serde_json::Value, path: &[&str]) -> Option<bool> {
    jget(val, path)?.as_bool()
}

fn extract_checkout_user_id(event: &serde_json::Value) -> Option<Uuid> {
    // checkout.session payload shape
    let obj = jget(event, &["data", "object"])?;
    if let Some(uid) = obj
        .get("metadata")
        .and_then(|m| m.get("user_id"))
        .and_then(|v| v.as_str())
    {
        if let Ok(id) = Uuid::parse_str(uid) {
            return Some(id);
        }
    }
    if let Some(id_str) = obj.get("client_reference_id").and_then(|v| v.as_str()) {
        if let Ok(id) = Uuid::parse_str(id_str) {
            return Some(id);
        }
    }
    None
}

fn extract_customer_id(event: &serde_json::Value) -> Option<String> {
    extract_str(event, &["data", "object", "customer"]).map(|s| s.to_string())
}

async fn resolve_user_id(
    app_state: &AppState,
    payload: &serde_json::Value,
    evt_type: &str,
) -> Option<Uuid> {
    if evt_type.starts_with("checkout.session") {
        if let Some(id) = extract_checkout_user_id(payload) {
            return Some(id);
        }
    }
    let customer_id = extract_customer_id(payload)?;
    match app_state
        .db
        .find_user_id_by_customer_id(&customer_id)
        .await
    {
        Ok(opt) => opt,
        Err(err) => {
            error!(?err, customer_id, "failed to map processor customer to user");
            None
        }
    }
}

fn ack() -> Response {
    Json(serde_json::json!({ "received": true })).into_response()
}

async fn load_record(app_state: &AppState, user_id: Uuid) -> Option<SubscriptionRecord> {
    match app_state.db.find_subscription(user_id).await {
        Ok(record) => Some(record.unwrap_or_else(|| SubscriptionRecord::empty(user_id))),
        Err(err) => {
            error!(?err, %user_id, "failed to load subscription record for webhook");
            None
        }
    }
}

async fn apply_subscription_upgrade(
    app_state: &AppState,
    user_id: Uuid,
    payload: &serde_json::Value,
) {
    let Some(mut record) = load_record(app_state, user_id).await else {
        return;
    };

    record.tier = Some("pro".into());
    record.status = Some("active".into());
    record.cancel_at_period_end = false;
    if let Some(customer_id) = extract_customer_id(payload) {
        record.processor_customer_id = Some(customer_id);
    }

    // Period bounds and interval come from the subscription object itself;
    // the checkout payload only references it by id.
    if let Some(customer_id) = record.processor_customer_id.clone() {
        match app_state
            .stripe
            .get_active_subscription_for_customer(&customer_id)
            .await
        {
            Ok(Some(sub)) => {
                record.status = Some(sub.status);
                record.billing_interval = sub.interval;
                record.processor_subscription_id = Some(sub.id);
                record.cancel_at_period_end = sub.cancel_at_period_end;
                record.current_period_end =
                    OffsetDateTime::from_unix_timestamp(sub.current_period_end).ok();
            }
            Ok(None) => {
                warn!(%user_id, customer_id, "no active subscription visible after checkout completion");
            }
            Err(err) => {
                warn!(?err, %user_id, customer_id, "failed to sync subscription after checkout completion");
            }
        }
    }

    if let Err(err) = app_state.db.upsert_subscription(&record).await {
        error!(?err, %user_id, "failed to persist subscription upgrade");
        return;
    }
    info!(%user_id, "completed pro upgrade from checkout session");
}

async fn apply_token_purchase(app_state: &AppState, user_id: Uuid, payload: &serde_json::Value) {
    let Some(product_id) = extract_str(payload, &["data", "object", "metadata", "product_id"])
    else {
        warn!(%user_id, "payment checkout completed without product metadata");
        return;
    };
    let Some(product) = find_token_product(product_id) else {
        warn!(%user_id, product_id, "payment checkout references unknown product");
        return;
    };

    match app_state
        .db
        .credit_tokens(user_id, product.kind, product.amount)
        .await
    {
        Ok(new_balance) => {
            info!(%user_id, product_id, amount = product.amount, new_balance, "credited token purchase");
        }
        Err(err) => {
            error!(?err, %user_id, product_id, "failed to credit token purchase");
        }
    }
}

// POST /api/stripe/webhook
pub async fn webhook(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let sig = match headers
        .get("Stripe-Signature")
        .and_then(|h| h.to_str().ok())
    {
        Some(s) => s,
        None => return JsonResponse::bad_request("Missing Stripe-Signature").into_response(),
    };

    let evt = match app_state.stripe.verify_webhook(&body, sig) {
        Ok(e) => e,
        Err(err) => {
            warn!(?err, "stripe webhook verification failed");
            return (StatusCode::BAD_REQUEST, "invalid webhook").into_response();
        }
    };

    // The processor retries and may duplicate deliveries. Recording the
    // event id is the atomic first-delivery check; replays are acked
    // without reapplying side effects.
    match app_state.billing_events.mark_if_new(&evt.id).await {
        Ok(true) => {}
        Ok(false) => {
            info!(event_id = evt.id, "duplicate webhook delivery acknowledged");
            return ack();
        }
        Err(err) => {
            // Fail the delivery so the processor retries once the log is
            // reachable again.
            error!(?err, event_id = evt.id, "failed to record webhook event id");
            return JsonResponse::server_error("event log unavailable").into_response();
        }
    }

    let evt_type = evt.r#type.as_str();
    let payload = &evt.payload;

    match evt_type {
        "checkout.session.completed" => {
            let Some(user_id) = resolve_user_id(&app_state, payload, evt_type).await else {
                warn!(evt_type, "unable to resolve user for checkout completion");
                return ack();
            };

            match extract_str(payload, &["data", "object", "mode"]) {
                Some("payment") => apply_token_purchase(&app_state, user_id, payload).await,
                // Older processor API versions omit the mode on
                // subscription sessions; treat missing as subscription.
                Some("subscription") | None => {
                    apply_subscription_upgrade(&app_state, user_id, payload).await
                }
                Some(other) => {
                    warn!(%user_id, mode = other, "ignoring checkout session with unsupported mode");
                }
            }
            ack()
        }

        "customer.subscription.updated" => {
            let Some(user_id) = resolve_user_id(&app_state, payload, evt_type).await else {
                warn!(evt_type, "subscription update received but user not identified");
                return ack();
            };
            let Some(mut record) = load_record(&app_state, user_id).await else {
                return ack();
            };

            if let Some(status) = extract_str(payload, &["data", "object", "status"]) {
                record.status = Some(status.to_string());
            }
            if let Some(cancel) =
                extract_bool(payload, &["data", "object", "cancel_at_period_end"])
            {
                record.cancel_at_period_end = cancel;
            }
            if let Some(end) = extract_i64(payload, &["data", "object", "current_period_end"]) {
                record.current_period_end = OffsetDateTime::from_unix_timestamp(end).ok();
            }
            if let Some(interval) = payload
                .pointer("/data/object/items/data/0/price/recurring/interval")
                .and_then(|v| v.as_str())
            {
                record.billing_interval = Some(interval.to_string());
            }

            if let Err(err) = app_state.db.upsert_subscription(&record).await {
                error!(?err, %user_id, "failed to persist subscription update");
            } else {
                info!(%user_id, status = ?record.status, "synced subscription update");
            }
            ack()
        }

        // Subscription fully ended -> revert to free
        "customer.subscription.deleted" => {
            let Some(user_id) = resolve_user_id(&app_state, payload, evt_type).await else {
                warn!(evt_type, "subscription deletion received but user not identified");
                return ack();
            };
            let Some(mut record) = load_record(&app_state, user_id).await else {
                return ack();
            };

            record.tier = Some("free".into());
            record.status = Some("cancelled".into());
            record.billing_interval = None;
            record.current_period_end = None;
            record.cancel_at_period_end = false;
            record.processor_subscription_id = None;

            if let Err(err) = app_state.db.upsert_subscription(&record).await {
                error!(?err, %user_id, "failed to revert plan on subscription deletion");
            } else {
                info!(%user_id, "processed subscription deletion: reverted plan to free");
            }
            ack()
        }

        // Renewal failure enters a grace period: status goes past_due, the
        // tier is NOT downgraded until the processor deletes the subscription.
        "invoice.payment_failed" => {
            let Some(user_id) = resolve_user_id(&app_state, payload, evt_type).await else {
                warn!(evt_type, "invoice payment failed but user could not be resolved");
                return ack();
            };
            let Some(mut record) = load_record(&app_state, user_id).await else {
                return ack();
            };

            record.status = Some("past_due".into());
            if let Err(err) = app_state.db.upsert_subscription(&record).await {
                error!(?err, %user_id, "failed to record past_due status");
            } else {
                warn!(%user_id, evt_type, "renewal payment failed; grace period active, no downgrade");
            }
            ack()
        }

        // Other events acknowledged to avoid retries; primary logic handled above.
        _ => {
            info!(evt_type, "unhandled stripe event acknowledged");
            ack()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock_billing_event_log_repository::MockBillingEventLogRepository;
    use crate::db::mock_entitlement_repository::MockEntitlementRepository;
    use crate::models::feature::ConsumableKind;
    use crate::models::plan::{PlanTier, SubscriptionStatus};
    use crate::services::entitlement::EntitlementService;
    use crate::services::stripe::MockStripeService;
    use crate::state::test_state;
    use axum::extract::State as AxumState;
    use axum::http::HeaderValue;
    use std::sync::Arc;

    fn state_with(
        repo: MockEntitlementRepository,
        stripe: MockStripeService,
        events: MockBillingEventLogRepository,
    ) -> AppState {
        let db: Arc<dyn crate::db::entitlement_repository::EntitlementRepository> =
            Arc::new(repo);
        let mut state = test_state();
        state.db = db.clone();
        state.entitlements = EntitlementService::new(db);
        state.stripe = Arc::new(stripe);
        state.billing_events = Arc::new(events);
        state
    }

    fn signed_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Stripe-Signature", HeaderValue::from_static("t=1,v1=stub"));
        headers
    }

    async fn deliver(state: AppState, body: &serde_json::Value) -> Response {
        webhook(
            AxumState(state),
            signed_headers(),
            axum::body::Bytes::from(serde_json::to_vec(body).unwrap()),
        )
        .await
    }

    #[tokio::test]
    async fn token_purchase_credits_once_across_duplicate_deliveries() {
        let repo = MockEntitlementRepository::new();
        let events = MockBillingEventLogRepository::default();
        let user_id = Uuid::new_v4();
        let state = state_with(repo.clone(), MockStripeService::new(), events.clone());

        let body = serde_json::json!({
            "id": "evt_tokens_1",
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_test_tok",
                "mode": "payment",
                "metadata": { "user_id": user_id.to_string(), "product_id": "ai_tokens_20" }
            } }
        });

        let resp = deliver(state.clone(), &body).await;
        assert_eq!(resp.status(), StatusCode::OK);
        // processor retries the exact same event
        let resp = deliver(state, &body).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let credits = repo.credits.lock().unwrap();
        assert_eq!(credits.len(), 1);
        assert_eq!(credits[0], (user_id, ConsumableKind::AiTokens, 20));
        drop(credits);
        assert_eq!(
            repo.balances.lock().unwrap().get(&user_id).unwrap().ai_tokens,
            20
        );
    }

    #[tokio::test]
    async fn subscription_checkout_promotes_to_pro_with_period_bounds() {
        let repo = MockEntitlementRepository::new();
        let user_id = Uuid::new_v4();
        let period_end = OffsetDateTime::now_utc().unix_timestamp() + 30 * 24 * 3600;
        let stripe = MockStripeService::new().with_active_subscription("month", period_end);
        let state = state_with(repo.clone(), stripe, MockBillingEventLogRepository::default());

        let body = serde_json::json!({
            "id": "evt_upgrade_1",
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_test_sub",
                "mode": "subscription",
                "customer": "cus_123",
                "metadata": { "user_id": user_id.to_string(), "plan": "pro_monthly" }
            } }
        });

        let resp = deliver(state, &body).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let subs = repo.subscriptions.lock().unwrap();
        let record = subs.get(&user_id).unwrap();
        assert_eq!(record.tier_normalized(), PlanTier::Pro);
        assert_eq!(record.status_normalized(), SubscriptionStatus::Active);
        assert_eq!(record.billing_interval.as_deref(), Some("month"));
        assert_eq!(record.processor_customer_id.as_deref(), Some("cus_123"));
        assert_eq!(
            record.current_period_end.map(|t| t.unix_timestamp()),
            Some(period_end)
        );
    }

    #[tokio::test]
    async fn subscription_deletion_reverts_to_free() {
        let user_id = Uuid::new_v4();
        let mut record = SubscriptionRecord::empty(user_id);
        record.tier = Some("pro".into());
        record.status = Some("active".into());
        record.processor_customer_id = Some("cus_del".into());
        let repo = MockEntitlementRepository::new().with_subscription(record);
        let state = state_with(
            repo.clone(),
            MockStripeService::new(),
            MockBillingEventLogRepository::default(),
        );

        let body = serde_json::json!({
            "id": "evt_del_1",
            "type": "customer.subscription.deleted",
            "data": { "object": { "id": "sub_del", "customer": "cus_del" } }
        });

        let resp = deliver(state, &body).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let subs = repo.subscriptions.lock().unwrap();
        let record = subs.get(&user_id).unwrap();
        assert_eq!(record.tier_normalized(), PlanTier::Free);
        assert_eq!(record.status_normalized(), SubscriptionStatus::Cancelled);
        assert!(record.current_period_end.is_none());
    }

    #[tokio::test]
    async fn renewal_failure_marks_past_due_without_downgrade() {
        let user_id = Uuid::new_v4();
        let mut record = SubscriptionRecord::empty(user_id);
        record.tier = Some("pro".into());
        record.status = Some("active".into());
        record.processor_customer_id = Some("cus_grace".into());
        let repo = MockEntitlementRepository::new().with_subscription(record);
        let state = state_with(
            repo.clone(),
            MockStripeService::new(),
            MockBillingEventLogRepository::default(),
        );

        let body = serde_json::json!({
            "id": "evt_fail_1",
            "type": "invoice.payment_failed",
            "data": { "object": { "customer": "cus_grace" } }
        });

        let resp = deliver(state, &body).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let subs = repo.subscriptions.lock().unwrap();
        let record = subs.get(&user_id).unwrap();
        // tier retained, benefits lapse through the status
        assert_eq!(record.tier_normalized(), PlanTier::Pro);
        assert_eq!(record.status_normalized(), SubscriptionStatus::PastDue);
    }

    #[tokio::test]
    async fn missing_signature_is_rejected() {
        let state = state_with(
            MockEntitlementRepository::new(),
            MockStripeService::new(),
            MockBillingEventLogRepository::default(),
        );
        let resp = webhook(
            AxumState(state),
            HeaderMap::new(),
            axum::body::Bytes::from_static(b"{}"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_events_are_acknowledged() {
        let events = MockBillingEventLogRepository::default();
        let state = state_with(
            MockEntitlementRepository::new(),
            MockStripeService::new(),
            events.clone(),
        );
        let body = serde_json::json!({
            "id": "evt_other",
            "type": "charge.refunded",
            "data": { "object": {} }
        });
        let resp = deliver(state, &body).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(events.recorded_events(), vec!["evt_other".to_string()]);
    }
}
