use axum::{extract::FromRequestParts, http::request::Parts};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::Settings;
use crate::error::ApiError;

/// JWT claims carried by every authenticated request
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub user_id: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub exp: i64,
}

/// The authenticated subject, after token validation and tenant resolution
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub username: String,
    pub user_id: String,
    pub role: String,
    pub tenant_id: Option<String>,
}

fn algorithm(settings: &Settings) -> Algorithm {
    match settings.jwt_algorithm.as_str() {
        "HS384" => Algorithm::HS384,
        "HS512" => Algorithm::HS512,
        _ => Algorithm::HS256,
    }
}

fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check the configured admin credentials
pub fn verify_login(settings: &Settings, username: &str, password: &str) -> bool {
    if username != settings.admin_username {
        return false;
    }
    match &settings.admin_password_sha256 {
        Some(expected) => sha256_hex(password) == *expected,
        None => {
            tracing::warn!("login rejected: ADMIN_PASSWORD_SHA256 not configured");
            false
        }
    }
}

pub fn issue_token(settings: &Settings, username: &str) -> Result<String, ApiError> {
    let secret = settings
        .secret_key
        .as_deref()
        .ok_or_else(|| ApiError::Internal("SECRET_KEY not set".to_string()))?;

    let claims = Claims {
        sub: username.to_string(),
        user_id: username.to_string(),
        role: "admin".to_string(),
        tenant_id: Some("default".to_string()),
        exp: (Utc::now() + Duration::minutes(settings.access_token_expire_minutes as i64))
            .timestamp(),
    };

    encode(
        &Header::new(algorithm(settings)),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ApiError::Internal(format!("token encoding failed: {}", e)))
}

pub fn decode_token(settings: &Settings, token: &str) -> Result<Claims, ApiError> {
    let secret = settings
        .secret_key
        .as_deref()
        .ok_or_else(|| ApiError::Internal("SECRET_KEY not set".to_string()))?;

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(algorithm(settings)),
    )
    .map_err(|_| ApiError::Unauthorized("invalid token".to_string()))?;

    Ok(data.claims)
}

impl CurrentUser {
    fn from_claims(claims: Claims, tenant_override: Option<String>, settings: &Settings) -> Self {
        // Tenant override is a test/staging convenience only
        let tenant_id = if settings.is_production() {
            claims.tenant_id
        } else {
            tenant_override.or(claims.tenant_id)
        };
        Self {
            username: claims.sub,
            user_id: claims.user_id,
            role: claims.role,
            tenant_id,
        }
    }

    /// Reject requests whose payload tenant does not match the subject tenant
    pub fn enforce_tenant(&self, payload_tenant_id: &str) -> Result<(), ApiError> {
        if let Some(tenant_id) = &self.tenant_id {
            if !tenant_id.is_empty() && tenant_id != payload_tenant_id {
                return Err(ApiError::Forbidden("Tenant mismatch".to_string()));
            }
        }
        Ok(())
    }
}

#[axum::async_trait]
impl FromRequestParts<crate::AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &crate::AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;

        let claims = decode_token(&state.settings, token)?;
        let tenant_override = parts
            .headers
            .get("x-tenant-id")
            .and_then(|value| value.to_str().ok())
            .map(String::from);

        Ok(CurrentUser::from_claims(
            claims,
            tenant_override,
            &state.settings,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvState;

    fn settings_with_secret() -> Settings {
        let mut settings = Settings::from_env().unwrap();
        settings.secret_key = Some("unit-test-secret".to_string());
        settings.admin_username = "admin".to_string();
        settings.admin_password_sha256 = Some(sha256_hex("letmein"));
        settings
    }

    #[test]
    fn token_roundtrip_preserves_claims() {
        let settings = settings_with_secret();
        let token = issue_token(&settings, "admin").unwrap();
        let claims = decode_token(&settings, &token).unwrap();
        assert_eq!(claims.sub, "admin");
        assert_eq!(claims.tenant_id.as_deref(), Some("default"));
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn tampered_token_is_rejected() {
        let settings = settings_with_secret();
        let token = issue_token(&settings, "admin").unwrap();
        let tampered = format!("{}x", token);
        assert!(decode_token(&settings, &tampered).is_err());
    }

    #[test]
    fn login_checks_username_and_password_digest() {
        let settings = settings_with_secret();
        assert!(verify_login(&settings, "admin", "letmein"));
        assert!(!verify_login(&settings, "admin", "wrong"));
        assert!(!verify_login(&settings, "root", "letmein"));
    }

    #[test]
    fn tenant_mismatch_is_forbidden() {
        let user = CurrentUser {
            username: "admin".to_string(),
            user_id: "admin".to_string(),
            role: "admin".to_string(),
            tenant_id: Some("acme".to_string()),
        };
        assert!(user.enforce_tenant("acme").is_ok());
        assert!(matches!(
            user.enforce_tenant("globex"),
            Err(ApiError::Forbidden(_))
        ));
    }

    #[test]
    fn tenant_override_ignored_in_production() {
        let mut settings = settings_with_secret();
        settings.env_state = EnvState::Production;
        let claims = Claims {
            sub: "admin".to_string(),
            user_id: "admin".to_string(),
            role: "admin".to_string(),
            tenant_id: Some("real".to_string()),
            exp: 0,
        };
        let user =
            CurrentUser::from_claims(claims.clone(), Some("spoofed".to_string()), &settings);
        assert_eq!(user.tenant_id.as_deref(), Some("real"));

        settings.env_state = EnvState::Development;
        let user = CurrentUser::from_claims(claims, Some("spoofed".to_string()), &settings);
        assert_eq!(user.tenant_id.as_deref(), Some("spoofed"));
    }
}
