use axum::{extract::State, http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::subscription::{SubscriptionRecord, SubscriptionResponse, SubscriptionView};
use crate::responses::JsonResponse;
use crate::routes::auth::AuthSession;
use crate::services::stripe::{
    CheckoutLineItem, CheckoutMode, CreateCheckoutSessionRequest,
};
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutBody {
    pub plan: String,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalBody {
    pub return_url: String,
}

#[derive(Serialize)]
pub struct RedirectUrl {
    pub url: String,
}

fn parse_user_id(claims_id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(claims_id)
        .map_err(|_| JsonResponse::unauthorized("Invalid user ID").into_response())
}

// GET /api/subscription
pub async fn get_subscription(
    State(app_state): State<AppState>,
    AuthSession(claims): AuthSession,
) -> Response {
    let user_id = match parse_user_id(&claims.id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let record = match app_state.db.find_subscription(user_id).await {
        Ok(record) => record.unwrap_or_else(|| SubscriptionRecord::empty(user_id)),
        Err(err) => {
            error!(?err, %user_id, "failed to load subscription record");
            return JsonResponse::server_error("Failed to load subscription").into_response();
        }
    };

    let entitlements = match app_state.entitlements.snapshot_from_record(&record).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            error!(?err, %user_id, "failed to compute entitlement snapshot");
            return JsonResponse::server_error("Failed to load subscription").into_response();
        }
    };

    let body = SubscriptionResponse {
        subscription: SubscriptionView::from(&record),
        entitlements,
    };
    (StatusCode::OK, Json(body)).into_response()
}

/// Resolves (creating if needed) the processor customer for a user. New
/// customers are persisted before the checkout session is created so the
/// webhook can map the customer back to the user.
async fn ensure_customer_id(
    app_state: &AppState,
    user_id: Uuid,
    email: &str,
) -> Result<String, Response> {
    let record = match app_state.db.find_subscription(user_id).await {
        Ok(record) => record,
        Err(err) => {
            error!(?err, %user_id, "failed to load subscription for checkout");
            return Err(JsonResponse::server_error("Failed to start checkout").into_response());
        }
    };

    if let Some(customer_id) = record.and_then(|r| r.processor_customer_id) {
        return Ok(customer_id);
    }

    let customer_id = match app_state.stripe.create_customer(email, None).await {
        Ok(id) => id,
        Err(err) => {
            error!(?err, %user_id, "failed to create processor customer");
            return Err(JsonResponse::server_error("Failed to start checkout").into_response());
        }
    };

    if let Err(err) = app_state.db.set_customer_id(user_id, &customer_id).await {
        error!(?err, %user_id, customer_id, "failed to persist processor customer id");
        return Err(JsonResponse::server_error("Failed to start checkout").into_response());
    }

    Ok(customer_id)
}

// POST /api/subscription/checkout
pub async fn create_checkout(
    State(app_state): State<AppState>,
    AuthSession(claims): AuthSession,
    Json(body): Json<CheckoutBody>,
) -> Response {
    let user_id = match parse_user_id(&claims.id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let Some(price) = app_state.config.stripe.price_for_plan(&body.plan) else {
        warn!(%user_id, plan = body.plan, "checkout requested for unknown plan");
        return JsonResponse::bad_request_with_code("Unknown plan", "unknown_plan")
            .into_response();
    };

    let customer_id = match ensure_customer_id(&app_state, user_id, &claims.email).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let req = CreateCheckoutSessionRequest {
        success_url: body.success_url,
        cancel_url: body.cancel_url,
        mode: CheckoutMode::Subscription,
        line_items: vec![CheckoutLineItem {
            price: price.to_string(),
            quantity: 1,
        }],
        client_reference_id: Some(user_id.to_string()),
        customer: Some(customer_id),
        metadata: Some(
            [
                ("user_id".to_string(), user_id.to_string()),
                ("plan".to_string(), body.plan.clone()),
            ]
            .into_iter()
            .collect(),
        ),
    };

    match app_state.stripe.create_checkout_session(req).await {
        Ok(session) => match session.url {
            Some(url) => {
                info!(%user_id, plan = body.plan, session_id = session.id, "created subscription checkout session");
                (StatusCode::OK, Json(RedirectUrl { url })).into_response()
            }
            None => {
                error!(%user_id, session_id = session.id, "checkout session missing redirect url");
                JsonResponse::server_error("Failed to start checkout").into_response()
            }
        },
        Err(err) => {
            error!(?err, %user_id, "failed to create checkout session");
            JsonResponse::server_error("Failed to start checkout").into_response()
        }
    }
}

// POST /api/subscription/portal
pub async fn create_portal(
    State(app_state): State<AppState>,
    AuthSession(claims): AuthSession,
    Json(body): Json<PortalBody>,
) -> Response {
    let user_id = match parse_user_id(&claims.id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let customer_id = match app_state.db.find_subscription(user_id).await {
        Ok(Some(record)) => record.processor_customer_id,
        Ok(None) => None,
        Err(err) => {
            error!(?err, %user_id, "failed to load subscription for portal");
            return JsonResponse::server_error("Failed to open billing portal").into_response();
        }
    };

    let Some(customer_id) = customer_id else {
        return JsonResponse::bad_request_with_code(
            "No billing account on file",
            "no_billing_account",
        )
        .into_response();
    };

    match app_state
        .stripe
        .create_billing_portal_session(&customer_id, &body.return_url)
        .await
    {
        Ok(url) => (StatusCode::OK, Json(json!({ "url": url }))).into_response(),
        Err(err) => {
            error!(?err, %user_id, "failed to create billing portal session");
            JsonResponse::server_error("Failed to open billing portal").into_response()
        }
    }
}
