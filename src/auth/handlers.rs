use axum::{
    extract::{FromRef, State},
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use tracing::{error, info, instrument, warn};

use super::{
    dto::{
        AuthResponse, ChangePasswordRequest, LoginRequest, MessageResponse, ProfileResponse,
        RefreshRequest, RegisterRequest, UpdateProfileRequest,
    },
    extractors::AuthUser,
    repo_types::{NewUser, ProfileUpdate, User},
    services::{
        hash_password, is_national_id, is_valid_email, verify_password, JwtKeys, MIN_PASSWORD_LEN,
    },
};
use crate::state::AppState;

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
}

pub fn account_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/profile", get(profile))
        .route("/auth/update-profile", put(update_profile))
        .route("/auth/change-password", put(change_password))
        .route("/auth/delete-account", delete(delete_account))
}

fn internal<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    error!(error = %e, "internal error");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
}

fn bad_request(msg: &str) -> (StatusCode, String) {
    warn!(reason = msg, "rejected auth request");
    (StatusCode::BAD_REQUEST, msg.to_string())
}

fn issue_tokens(
    state: &AppState,
    user: User,
    message: &'static str,
) -> Result<AuthResponse, (StatusCode, String)> {
    let keys = JwtKeys::from_ref(state);
    let access_token = keys.sign_access(user.id).map_err(internal)?;
    let refresh_token = keys.sign_refresh(user.id).map_err(internal)?;
    Ok(AuthResponse {
        message,
        access_token,
        refresh_token,
        user,
    })
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Json(mut payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), (StatusCode, String)> {
    payload.name = payload.name.trim().to_string();
    payload.email = payload.email.trim().to_lowercase();
    payload.national_id = payload.national_id.trim().to_string();

    if payload.name.is_empty() {
        return Err(bad_request("Name is required"));
    }
    if payload.email.is_empty() {
        return Err(bad_request("Email is required"));
    }
    if !is_valid_email(&payload.email) {
        return Err(bad_request("Invalid email"));
    }
    if payload.national_id.is_empty() {
        return Err(bad_request("Aadhar is required"));
    }
    if !is_national_id(&payload.national_id) {
        return Err(bad_request("Aadhar must be 12 digits"));
    }
    if payload.password.len() < MIN_PASSWORD_LEN {
        return Err(bad_request("Password too short"));
    }

    let store = state.store.as_ref();
    if store
        .find_user_by_email(&payload.email)
        .await
        .map_err(internal)?
        .is_some()
    {
        warn!(email = %payload.email, "email already registered");
        return Err((StatusCode::CONFLICT, "Email already registered".into()));
    }
    if store
        .find_user_by_national_id(&payload.national_id)
        .await
        .map_err(internal)?
        .is_some()
    {
        warn!("aadhar already registered");
        return Err((StatusCode::CONFLICT, "Aadhar already registered".into()));
    }

    let password_hash = hash_password(&payload.password).map_err(internal)?;
    let user = store
        .create_user(NewUser {
            name: payload.name,
            email: payload.email,
            national_id: payload.national_id,
            password_hash,
        })
        .await
        .map_err(|e| {
            // lost a race with a concurrent registration
            warn!(error = %e, "create user failed");
            (
                StatusCode::CONFLICT,
                "Email or Aadhar already registered".to_string(),
            )
        })?;

    info!(user_id = %user.id, email = %user.email, "user registered");
    let body = issue_tokens(&state, user, "Registration successful")?;
    Ok((StatusCode::CREATED, Json(body)))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, (StatusCode, String)> {
    let identifier = payload.email.trim();
    if identifier.is_empty() || payload.password.is_empty() {
        return Err(bad_request("Email/Aadhar and password required"));
    }

    let store = state.store.as_ref();
    let found = if is_national_id(identifier) {
        store.find_user_by_national_id(identifier).await
    } else {
        store.find_user_by_email(&identifier.to_lowercase()).await
    };
    let user = match found.map_err(internal)? {
        Some(u) => u,
        None => {
            warn!("login for unknown identifier");
            return Err((StatusCode::UNAUTHORIZED, "Invalid credentials".into()));
        }
    };

    if !verify_password(&payload.password, &user.password_hash).map_err(internal)? {
        warn!(user_id = %user.id, "login invalid password");
        return Err((StatusCode::UNAUTHORIZED, "Invalid credentials".into()));
    }

    info!(user_id = %user.id, "user logged in");
    Ok(Json(issue_tokens(&state, user, "Login successful")?))
}

#[instrument(skip(state, payload))]
pub async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<AuthResponse>, (StatusCode, String)> {
    let keys = JwtKeys::from_ref(&state);
    let claims = keys.verify_refresh(&payload.refresh_token).map_err(|e| {
        warn!(error = %e, "refresh rejected");
        (StatusCode::UNAUTHORIZED, "Invalid refresh token".to_string())
    })?;

    let user = state
        .store
        .find_user(claims.sub)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::UNAUTHORIZED, "User not found".to_string()))?;
    Ok(Json(issue_tokens(&state, user, "Token refreshed")?))
}

/// Tokens are stateless; the client discards them.
pub async fn logout() -> Json<MessageResponse> {
    Json(MessageResponse {
        message: "Logged out successfully",
    })
}

#[instrument(skip(state))]
pub async fn profile(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<User>, (StatusCode, String)> {
    state
        .store
        .find_user(user_id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "User not found".to_string()))
}

#[instrument(skip(state, payload))]
pub async fn update_profile(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<UpdateProfileRequest>,
) -> Result<Json<ProfileResponse>, (StatusCode, String)> {
    let update = ProfileUpdate {
        name: payload
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty()),
        email: payload
            .email
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty()),
    };
    if update.is_empty() {
        return Err(bad_request("No fields to update"));
    }

    let store = state.store.as_ref();
    if let Some(email) = update.email.as_deref() {
        if !is_valid_email(email) {
            return Err(bad_request("Invalid email"));
        }
        let taken = store.find_user_by_email(email).await.map_err(internal)?;
        if taken.is_some_and(|other| other.id != user_id) {
            warn!(%user_id, "email already in use");
            return Err((StatusCode::CONFLICT, "Email already in use".into()));
        }
    }

    let user = store
        .update_profile(user_id, &update)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, "User not found".to_string()))?;
    info!(%user_id, "profile updated");
    Ok(Json(ProfileResponse {
        message: "Profile updated successfully",
        user,
    }))
}

#[instrument(skip(state, payload))]
pub async fn change_password(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    if payload.old_password.is_empty() || payload.new_password.is_empty() {
        return Err(bad_request("Old and new password required"));
    }
    if payload.new_password.len() < MIN_PASSWORD_LEN {
        return Err(bad_request("Password too short"));
    }

    let store = state.store.as_ref();
    let user = store
        .find_user(user_id)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, "User not found".to_string()))?;
    if !verify_password(&payload.old_password, &user.password_hash).map_err(internal)? {
        warn!(%user_id, "change password with wrong old password");
        return Err((StatusCode::UNAUTHORIZED, "Invalid old password".into()));
    }

    let hash = hash_password(&payload.new_password).map_err(internal)?;
    if !store.update_password(user_id, &hash).await.map_err(internal)? {
        return Err((StatusCode::NOT_FOUND, "User not found".into()));
    }
    info!(%user_id, "password changed");
    Ok(Json(MessageResponse {
        message: "Password changed successfully",
    }))
}

#[instrument(skip(state))]
pub async fn delete_account(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    if !state.store.delete_user(user_id).await.map_err(internal)? {
        return Err((StatusCode::NOT_FOUND, "User not found".into()));
    }
    info!(%user_id, "account deleted");
    Ok(Json(MessageResponse {
        message: "Account deleted successfully",
    }))
}
