use axum::extract::{FromRequestParts, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::{async_trait, Json};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{ApiResponse, AppState};
use crate::error::{ApiError, ApiResult, FieldError};
use crate::models::{NewUser, User};
use crate::schema::users;

const ACCESS_TOKEN: &str = "access";
const REFRESH_TOKEN: &str = "refresh";
const DEFAULT_ROLE: &str = "customer";

#[derive(Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
}

/// Signed token payload. `kind` separates access from refresh tokens so one
/// cannot be presented where the other is expected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub role: String,
    pub kind: String,
    pub iat: i64,
    pub exp: i64,
}

fn issue_token(
    config: &AuthConfig,
    user_id: Uuid,
    role: &str,
    kind: &str,
    ttl_secs: i64,
) -> ApiResult<String> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id,
        role: role.to_string(),
        kind: kind.to_string(),
        iat: now,
        exp: now + ttl_secs,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .map_err(|err| ApiError::Internal(err.into()))
}

pub fn issue_access_token(config: &AuthConfig, user_id: Uuid, role: &str) -> ApiResult<String> {
    issue_token(config, user_id, role, ACCESS_TOKEN, config.access_ttl_secs)
}

pub fn issue_refresh_token(config: &AuthConfig, user_id: Uuid, role: &str) -> ApiResult<String> {
    issue_token(config, user_id, role, REFRESH_TOKEN, config.refresh_ttl_secs)
}

/// Signature + expiry + token-kind check. No revocation list: a token is
/// valid until it expires.
pub fn verify_token(config: &AuthConfig, token: &str, expected_kind: &str) -> ApiResult<Claims> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|err| match err.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
            ApiError::Unauthorized("Token expired".to_string())
        }
        _ => ApiError::Unauthorized("Invalid token".to_string()),
    })?;

    if data.claims.kind != expected_kind {
        return Err(ApiError::Unauthorized("Invalid token".to_string()));
    }
    Ok(data.claims)
}

/// Authenticated caller, extracted from the `Authorization: Bearer` header.
/// The subject must still exist as a user row.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: Uuid,
    pub role: String,
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> ApiResult<Self> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("Missing authorization header".to_string()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::Unauthorized("Malformed authorization header".to_string()))?;

        let claims = verify_token(&state.auth, token, ACCESS_TOKEN)?;

        let mut conn = state.pool.get().await?;
        let user = users::table
            .find(claims.sub)
            .first::<User>(&mut conn)
            .await
            .optional()?;
        if user.is_none() {
            return Err(ApiError::Unauthorized("User no longer exists".to_string()));
        }

        Ok(CurrentUser {
            id: claims.sub,
            role: claims.role,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub name: String,
    pub phone: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    pub role: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl From<User> for UserProfile {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            name: user.name,
            phone: user.phone,
            role: user.role,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub user: UserProfile,
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
}

fn validate_register(request: &RegisterRequest) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if request.email.trim().is_empty() || !request.email.contains('@') {
        errors.push(FieldError::new("email", "a valid email is required"));
    }
    if request.password.len() < 6 {
        errors.push(FieldError::new(
            "password",
            "password must be at least 6 characters",
        ));
    }
    if request.name.trim().is_empty() {
        errors.push(FieldError::new("name", "name is required"));
    }
    errors
}

pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<Json<ApiResponse<AuthResponse>>> {
    let errors = validate_register(&request);
    if !errors.is_empty() {
        return Err(ApiError::invalid_fields(errors));
    }

    let mut conn = state.pool.get().await?;

    let existing = users::table
        .filter(users::email.eq(&request.email))
        .first::<User>(&mut conn)
        .await
        .optional()?;
    if existing.is_some() {
        return Err(ApiError::Domain("Email is already registered".to_string()));
    }

    let password_hash = bcrypt::hash(&request.password, bcrypt::DEFAULT_COST)
        .map_err(|err| ApiError::Internal(err.into()))?;

    let new_user = NewUser {
        id: Uuid::new_v4(),
        email: request.email,
        password_hash,
        name: request.name,
        phone: request.phone,
        role: DEFAULT_ROLE.to_string(),
    };

    diesel::insert_into(users::table)
        .values(&new_user)
        .execute(&mut conn)
        .await?;

    let user = users::table.find(new_user.id).first::<User>(&mut conn).await?;

    tracing::info!("Registered user {}", user.id);

    let access_token = issue_access_token(&state.auth, user.id, &user.role)?;
    let refresh_token = issue_refresh_token(&state.auth, user.id, &user.role)?;

    Ok(ApiResponse::ok(AuthResponse {
        user: user.into(),
        access_token,
        refresh_token,
    }))
}

pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<ApiResponse<AuthResponse>>> {
    let mut conn = state.pool.get().await?;

    let user = users::table
        .filter(users::email.eq(&request.email))
        .first::<User>(&mut conn)
        .await
        .optional()?
        .ok_or_else(|| ApiError::Unauthorized("Invalid email or password".to_string()))?;

    let valid = bcrypt::verify(&request.password, &user.password_hash)
        .map_err(|err| ApiError::Internal(err.into()))?;
    if !valid {
        return Err(ApiError::Unauthorized("Invalid email or password".to_string()));
    }

    let access_token = issue_access_token(&state.auth, user.id, &user.role)?;
    let refresh_token = issue_refresh_token(&state.auth, user.id, &user.role)?;

    Ok(ApiResponse::ok(AuthResponse {
        user: user.into(),
        access_token,
        refresh_token,
    }))
}

/// Exchanges a valid refresh token for a new access token. The refresh token
/// itself is not re-issued.
pub async fn refresh_token(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> ApiResult<Json<ApiResponse<RefreshResponse>>> {
    let claims = verify_token(&state.auth, &request.refresh_token, REFRESH_TOKEN)?;

    let mut conn = state.pool.get().await?;
    let user = users::table
        .find(claims.sub)
        .first::<User>(&mut conn)
        .await
        .optional()?
        .ok_or_else(|| ApiError::Unauthorized("User no longer exists".to_string()))?;

    let access_token = issue_access_token(&state.auth, user.id, &user.role)?;

    Ok(ApiResponse::ok(RefreshResponse { access_token }))
}

pub async fn me(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<ApiResponse<UserProfile>>> {
    let mut conn = state.pool.get().await?;
    let user = users::table
        .find(user.id)
        .first::<User>(&mut conn)
        .await
        .optional()?
        .ok_or_else(|| ApiError::Unauthorized("User no longer exists".to_string()))?;

    Ok(ApiResponse::ok(user.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AuthConfig {
        AuthConfig {
            jwt_secret: "unit-test-secret".to_string(),
            access_ttl_secs: 900,
            refresh_ttl_secs: 1209600,
        }
    }

    #[test]
    fn access_token_round_trips() {
        let config = test_config();
        let user_id = Uuid::new_v4();
        let token = issue_access_token(&config, user_id, "customer").unwrap();
        let claims = verify_token(&config, &token, ACCESS_TOKEN).unwrap();
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.role, "customer");
        assert_eq!(claims.kind, ACCESS_TOKEN);
    }

    #[test]
    fn refresh_token_is_rejected_as_access_token() {
        let config = test_config();
        let token = issue_refresh_token(&config, Uuid::new_v4(), "customer").unwrap();
        let err = verify_token(&config, &token, ACCESS_TOKEN).unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
        // The other direction must fail too.
        let token = issue_access_token(&config, Uuid::new_v4(), "customer").unwrap();
        assert!(verify_token(&config, &token, REFRESH_TOKEN).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        // Past the decoder's default leeway.
        let config = AuthConfig {
            access_ttl_secs: -300,
            ..test_config()
        };
        let token = issue_access_token(&config, Uuid::new_v4(), "customer").unwrap();
        let err = verify_token(&config, &token, ACCESS_TOKEN).unwrap_err();
        match err {
            ApiError::Unauthorized(message) => assert_eq!(message, "Token expired"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn tampered_token_is_rejected() {
        let config = test_config();
        let token = issue_access_token(&config, Uuid::new_v4(), "customer").unwrap();
        let other = AuthConfig {
            jwt_secret: "different-secret".to_string(),
            ..test_config()
        };
        assert!(verify_token(&other, &token, ACCESS_TOKEN).is_err());
        assert!(verify_token(&config, "not-a-token", ACCESS_TOKEN).is_err());
    }

    #[test]
    fn password_hash_verifies() {
        let hash = bcrypt::hash("s3cret-pw", 4).unwrap();
        assert!(bcrypt::verify("s3cret-pw", &hash).unwrap());
        assert!(!bcrypt::verify("wrong-pw", &hash).unwrap());
    }

    #[test]
    fn register_validation_reports_each_bad_field() {
        let request = RegisterRequest {
            email: "not-an-email".to_string(),
            password: "short".to_string(),
            name: "".to_string(),
            phone: None,
        };
        let errors = validate_register(&request);
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["email", "password", "name"]);

        let request = RegisterRequest {
            email: "a@example.com".to_string(),
            password: "long-enough".to_string(),
            name: "A".to_string(),
            phone: None,
        };
        assert!(validate_register(&request).is_empty());
    }
}
