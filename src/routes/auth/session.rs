use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
};

use crate::routes::auth::claims::Claims;
use crate::state::AppState;
use crate::utils::jwt::decode_jwt;

/// Extracts the authenticated user's claims from an `Authorization: Bearer`
/// header. Endpoints that take this extractor reject with 401 before any
/// handler logic runs, so the core never sees an unauthenticated mutation.
#[derive(Debug, PartialEq)]
pub struct AuthSession(pub Claims);

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

impl<S> FromRequestParts<S> for AuthSession
where
    S: Send + Sync,
    AppState: FromRef<S>,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);
        let token = bearer_token(parts).ok_or(StatusCode::UNAUTHORIZED)?;

        let data = decode_jwt(
            token,
            &app_state.jwt_keys,
            &app_state.config.jwt_issuer,
            &app_state.config.jwt_audience,
        )
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

        Ok(AuthSession(data.claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::auth::claims::Claims;
    use crate::state::test_state;
    use crate::utils::jwt::create_jwt;
    use axum::extract::FromRequestParts;
    use axum::http::{header, Method, Request};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn make_valid_jwt(state: &AppState) -> String {
        let claims = Claims {
            id: uuid::Uuid::new_v4().to_string(),
            email: "test@example.com".into(),
            exp: (SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_secs()
                + 3600) as usize,
            iss: String::new(),
            aud: String::new(),
        };
        create_jwt(
            claims,
            &state.jwt_keys,
            &state.config.jwt_issuer,
            &state.config.jwt_audience,
        )
        .expect("JWT should create successfully")
    }

    #[tokio::test]
    async fn valid_bearer_token_is_extracted() {
        let state = test_state();
        let jwt = make_valid_jwt(&state);

        let request = Request::builder()
            .method(Method::GET)
            .uri("/api/subscription")
            .header(header::AUTHORIZATION, format!("Bearer {jwt}"))
            .body(())
            .unwrap();
        let (mut parts, _) = request.into_parts();

        let session = AuthSession::from_request_parts(&mut parts, &state)
            .await
            .expect("extraction should succeed");
        assert_eq!(session.0.email, "test@example.com");
    }

    #[tokio::test]
    async fn missing_header_is_unauthorized() {
        let state = test_state();
        let request = Request::builder()
            .method(Method::GET)
            .uri("/api/subscription")
            .body(())
            .unwrap();
        let (mut parts, _) = request.into_parts();

        let err = AuthSession::from_request_parts(&mut parts, &state)
            .await
            .unwrap_err();
        assert_eq!(err, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn garbage_token_is_unauthorized() {
        let state = test_state();
        let request = Request::builder()
            .method(Method::GET)
            .uri("/api/subscription")
            .header(header::AUTHORIZATION, "Bearer not-a-jwt")
            .body(())
            .unwrap();
        let (mut parts, _) = request.into_parts();

        let err = AuthSession::from_request_parts(&mut parts, &state)
            .await
            .unwrap_err();
        assert_eq!(err, StatusCode::UNAUTHORIZED);
    }
}
