use axum::{extract::State, http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::Deserialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::feature::find_token_product;
use crate::responses::JsonResponse;
use crate::routes::auth::AuthSession;
use crate::routes::subscription::RedirectUrl;
use crate::services::stripe::{CheckoutLineItem, CheckoutMode, CreateCheckoutSessionRequest};
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseTokensBody {
    pub product_id: String,
    pub success_url: String,
    pub cancel_url: String,
}

fn parse_user_id(claims_id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(claims_id)
        .map_err(|_| JsonResponse::unauthorized("Invalid user ID").into_response())
}

// GET /api/tokens/balance
pub async fn get_token_balance(
    State(app_state): State<AppState>,
    AuthSession(claims): AuthSession,
) -> Response {
    let user_id = match parse_user_id(&claims.id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match app_state.entitlements.token_balance(user_id).await {
        Ok(balances) => (StatusCode::OK, Json(balances)).into_response(),
        Err(err) => {
            error!(?err, %user_id, "failed to load token balances");
            JsonResponse::server_error("Failed to load token balance").into_response()
        }
    }
}

// POST /api/tokens/purchase
pub async fn purchase_tokens(
    State(app_state): State<AppState>,
    AuthSession(claims): AuthSession,
    Json(body): Json<PurchaseTokensBody>,
) -> Response {
    let user_id = match parse_user_id(&claims.id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let Some(product) = find_token_product(&body.product_id) else {
        warn!(%user_id, product_id = body.product_id, "purchase requested for unknown product");
        return JsonResponse::bad_request_with_code("Unknown product", "unknown_product")
            .into_response();
    };

    let Some(price) = app_state.config.stripe.price_for_product(product.id) else {
        error!(%user_id, product_id = product.id, "no price configured for token product");
        return JsonResponse::server_error("Failed to start purchase").into_response();
    };

    let req = CreateCheckoutSessionRequest {
        success_url: body.success_url,
        cancel_url: body.cancel_url,
        mode: CheckoutMode::Payment,
        line_items: vec![CheckoutLineItem {
            price: price.to_string(),
            quantity: 1,
        }],
        client_reference_id: Some(user_id.to_string()),
        customer: None,
        metadata: Some(
            [
                ("user_id".to_string(), user_id.to_string()),
                ("product_id".to_string(), product.id.to_string()),
            ]
            .into_iter()
            .collect(),
        ),
    };

    match app_state.stripe.create_checkout_session(req).await {
        Ok(session) => match session.url {
            Some(url) => {
                info!(%user_id, product_id = product.id, session_id = session.id, "created token purchase session");
                (StatusCode::OK, Json(RedirectUrl { url })).into_response()
            }
            None => {
                error!(%user_id, session_id = session.id, "purchase session missing redirect url");
                JsonResponse::server_error("Failed to start purchase").into_response()
            }
        },
        Err(err) => {
            error!(?err, %user_id, "failed to create token purchase session");
            JsonResponse::server_error("Failed to start purchase").into_response()
        }
    }
}
