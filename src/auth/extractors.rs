use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{request::Parts, StatusCode},
};
use tracing::warn;
use uuid::Uuid;

use super::services::JwtKeys;

/// Caller id from a valid access token; rejects with 401 otherwise.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Uuid);

/// Caller id when a valid access token is present. Missing or bad tokens
/// yield `None` so guests can still use the endpoint.
#[derive(Debug, Clone, Copy)]
pub struct MaybeAuthUser(pub Option<Uuid>);

fn bearer(parts: &Parts) -> Option<Result<&str, (StatusCode, String)>> {
    let header = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .map_err(|_| {
            (
                StatusCode::UNAUTHORIZED,
                "Invalid Authorization header".to_string(),
            )
        });
    Some(header.and_then(|h| {
        h.strip_prefix("Bearer ")
            .or_else(|| h.strip_prefix("bearer "))
            .ok_or((
                StatusCode::UNAUTHORIZED,
                "Invalid Authorization header".to_string(),
            ))
    }))
}

fn access_subject(keys: &JwtKeys, token: &str) -> Result<Uuid, (StatusCode, String)> {
    let claims = keys.verify(token).map_err(|e| {
        warn!(error = %e, "invalid or expired token");
        (
            StatusCode::UNAUTHORIZED,
            "Invalid or expired token".to_string(),
        )
    })?;
    if !claims.is_access() {
        return Err((
            StatusCode::UNAUTHORIZED,
            "Access token required".to_string(),
        ));
    }
    Ok(claims.sub)
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    JwtKeys: FromRef<S>,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer(parts).ok_or((
            StatusCode::UNAUTHORIZED,
            "Missing Authorization header".to_string(),
        ))??;
        access_subject(&JwtKeys::from_ref(state), token).map(AuthUser)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for MaybeAuthUser
where
    S: Send + Sync,
    JwtKeys: FromRef<S>,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = match bearer(parts) {
            Some(Ok(token)) => access_subject(&JwtKeys::from_ref(state), token).ok(),
            Some(Err(_)) | None => None,
        };
        Ok(MaybeAuthUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;
    use axum::http::Request;

    fn parts(auth: Option<&str>) -> Parts {
        let mut req = Request::builder().uri("/api/dashboard-stats");
        if let Some(value) = auth {
            req = req.header(axum::http::header::AUTHORIZATION, value);
        }
        req.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn required_auth_rejects_missing_and_refresh_tokens() {
        let state = AppState::fake();
        let keys = JwtKeys::from_ref(&state);

        let err = AuthUser::from_request_parts(&mut parts(None), &state)
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::UNAUTHORIZED);

        let refresh = keys.sign_refresh(Uuid::new_v4()).unwrap();
        let err = AuthUser::from_request_parts(&mut parts(Some(&format!("Bearer {refresh}"))), &state)
            .await
            .unwrap_err();
        assert_eq!(err.1, "Access token required");

        let id = Uuid::new_v4();
        let access = keys.sign_access(id).unwrap();
        let AuthUser(got) =
            AuthUser::from_request_parts(&mut parts(Some(&format!("Bearer {access}"))), &state)
                .await
                .unwrap();
        assert_eq!(got, id);
    }

    #[tokio::test]
    async fn optional_auth_degrades_to_guest() {
        let state = AppState::fake();
        let MaybeAuthUser(none) = MaybeAuthUser::from_request_parts(&mut parts(None), &state)
            .await
            .unwrap();
        assert!(none.is_none());

        let MaybeAuthUser(bad) =
            MaybeAuthUser::from_request_parts(&mut parts(Some("Bearer garbage")), &state)
                .await
                .unwrap();
        assert!(bad.is_none());

        let id = Uuid::new_v4();
        let access = JwtKeys::from_ref(&state).sign_access(id).unwrap();
        let MaybeAuthUser(some) =
            MaybeAuthUser::from_request_parts(&mut parts(Some(&format!("Bearer {access}"))), &state)
                .await
                .unwrap();
        assert_eq!(some, Some(id));
    }
}
