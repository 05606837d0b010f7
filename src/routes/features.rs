use axum::{extract::State, http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

use crate::models::feature::Feature;
use crate::responses::JsonResponse;
use crate::routes::auth::AuthSession;
use crate::state::AppState;

fn default_quantity() -> i64 {
    1
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckFeatureBody {
    pub feature: Feature,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeFeatureBody {
    pub feature: Feature,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    #[serde(default)]
    pub use_tokens: bool,
}

fn parse_user_id(claims_id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(claims_id)
        .map_err(|_| JsonResponse::unauthorized("Invalid user ID").into_response())
}

// POST /api/features/check
pub async fn check_feature(
    State(app_state): State<AppState>,
    AuthSession(claims): AuthSession,
    Json(body): Json<CheckFeatureBody>,
) -> Response {
    let user_id = match parse_user_id(&claims.id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if body.quantity < 1 {
        return JsonResponse::bad_request("quantity must be at least 1").into_response();
    }

    match app_state
        .entitlements
        .check_feature(user_id, body.feature, body.quantity)
        .await
    {
        Ok(decision) => (StatusCode::OK, Json(decision)).into_response(),
        Err(err) => {
            error!(?err, %user_id, feature = body.feature.as_str(), "feature check failed");
            JsonResponse::server_error("Failed to check feature").into_response()
        }
    }
}

// POST /api/features/consume
pub async fn consume_feature(
    State(app_state): State<AppState>,
    AuthSession(claims): AuthSession,
    Json(body): Json<ConsumeFeatureBody>,
) -> Response {
    let user_id = match parse_user_id(&claims.id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if body.quantity < 1 {
        return JsonResponse::bad_request("quantity must be at least 1").into_response();
    }

    match app_state
        .entitlements
        .consume_feature(user_id, body.feature, body.quantity, body.use_tokens)
        .await
    {
        // Denial is a business outcome, not an HTTP error: 200 with
        // success=false and a stable reason.
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err) => {
            error!(?err, %user_id, feature = body.feature.as_str(), "feature consume failed");
            JsonResponse::server_error("Failed to consume feature").into_response()
        }
    }
}
