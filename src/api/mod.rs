use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::apikey::{self, ApiKeyError};
use crate::config;
use crate::database;
use crate::keyvault;
use crate::models::{ApiKey, ApiKeyType, Realm};
use crate::ratelimit;
use crate::secrets;
use crate::store::{CodeError, TokenError};

pub mod certificate;
pub mod codestatus;
pub mod issue;
pub mod verify;

/// Error envelope returned on every non-2xx response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
    /// Stable taxonomy string for programmatic handling
    #[serde(rename = "errorCode")]
    pub error_code: String,
}

/// API error taxonomy. Every variant carries its wire `errorCode`; the
/// HTTP status falls out of the classification.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    MissingApiKey,
    TokenInvalid,
    TokenExpired,
    TokenUsed,
    TokenMetadataMismatch,
    NonceInvalid,
    CodeNotFound,
    CodeExpired,
    CodeAlreadyClaimed,
    TestTypeNotAccepted,
    HmacInvalid,
    HmacLengthInvalid,
    QuotaExceeded,
    RateLimited,
    InvalidRequest(String),
    MissingField(&'static str),
    BadSymptomDate(String),
    SymptomTooOld,
    MaintenanceMode,
    SmsFailure,
    Internal(String),
}

impl ApiError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::MissingApiKey => "missing_api_key",
            ApiError::TokenInvalid => "token_invalid",
            ApiError::TokenExpired => "token_expired",
            ApiError::TokenUsed => "token_used",
            ApiError::TokenMetadataMismatch => "token_metadata_mismatch",
            ApiError::NonceInvalid => "nonce_invalid",
            ApiError::CodeNotFound => "code_not_found",
            ApiError::CodeExpired => "code_expired",
            ApiError::CodeAlreadyClaimed => "code_already_claimed",
            ApiError::TestTypeNotAccepted => "test_type_not_accepted",
            ApiError::HmacInvalid => "hmac_invalid",
            ApiError::HmacLengthInvalid => "hmac_length_invalid",
            ApiError::QuotaExceeded => "quota_exceeded",
            ApiError::RateLimited => "rate_limited",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::MissingField(_) => "missing_field",
            ApiError::BadSymptomDate(_) => "bad_symptom_date",
            ApiError::SymptomTooOld => "symptom_too_old",
            ApiError::MaintenanceMode => "maintenance_mode",
            ApiError::SmsFailure => "sms_failure",
            ApiError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized | ApiError::MissingApiKey => StatusCode::UNAUTHORIZED,
            ApiError::QuotaExceeded | ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::MaintenanceMode => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::Unauthorized => "API key rejected".to_string(),
            ApiError::MissingApiKey => "X-API-Key header is required".to_string(),
            ApiError::TokenInvalid => "verification token is invalid".to_string(),
            ApiError::TokenExpired => "verification token has expired".to_string(),
            ApiError::TokenUsed => "verification token was already used".to_string(),
            ApiError::TokenMetadataMismatch => {
                "token metadata does not match the claimed code".to_string()
            }
            ApiError::NonceInvalid => "nonce does not match".to_string(),
            ApiError::CodeNotFound => "code does not exist".to_string(),
            ApiError::CodeExpired => "code has expired".to_string(),
            ApiError::CodeAlreadyClaimed => "code was already claimed".to_string(),
            ApiError::TestTypeNotAccepted => {
                "the client does not accept this test type".to_string()
            }
            ApiError::HmacInvalid => "ekeyhmac is not valid base64".to_string(),
            ApiError::HmacLengthInvalid => {
                "ekeyhmac must decode to exactly 32 bytes".to_string()
            }
            ApiError::QuotaExceeded => "daily issuance quota exceeded".to_string(),
            ApiError::RateLimited => "too many requests".to_string(),
            ApiError::InvalidRequest(msg) => msg.clone(),
            ApiError::MissingField(field) => format!("missing required field: {}", field),
            ApiError::BadSymptomDate(msg) => msg.clone(),
            ApiError::SymptomTooOld => "symptom date is older than the realm allows".to_string(),
            ApiError::MaintenanceMode => {
                "the realm is in maintenance mode, try again later".to_string()
            }
            ApiError::SmsFailure => "failed to deliver SMS".to_string(),
            ApiError::Internal(_) => "internal error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(detail) = &self {
            tracing::error!(error_code = self.error_code(), detail, "request failed");
        }
        let body = ErrorResponse {
            error: self.message(),
            error_code: self.error_code().to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<CodeError> for ApiError {
    fn from(e: CodeError) -> Self {
        match e {
            CodeError::InvalidRequest(msg) => ApiError::InvalidRequest(msg),
            CodeError::BadSymptomDate(msg) => ApiError::BadSymptomDate(msg),
            CodeError::SymptomTooOld => ApiError::SymptomTooOld,
            CodeError::NotFound => ApiError::CodeNotFound,
            CodeError::Expired => ApiError::CodeExpired,
            CodeError::AlreadyClaimed => ApiError::CodeAlreadyClaimed,
            CodeError::TestTypeNotAccepted => ApiError::TestTypeNotAccepted,
            CodeError::NonceMismatch => ApiError::NonceInvalid,
            CodeError::Collision => ApiError::Internal("code collision not resolved".to_string()),
            CodeError::Database(e) => ApiError::Internal(e.to_string()),
            CodeError::Kms(e) => ApiError::Internal(e.to_string()),
            CodeError::Internal(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::NotFound => ApiError::TokenInvalid,
            TokenError::Expired => ApiError::TokenExpired,
            TokenError::Used => ApiError::TokenUsed,
            TokenError::MetadataMismatch => ApiError::TokenMetadataMismatch,
            TokenError::Database(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<ApiKeyError> for ApiError {
    fn from(e: ApiKeyError) -> Self {
        match e {
            ApiKeyError::Unauthorized => ApiError::Unauthorized,
            ApiKeyError::Database(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}

/// An authorized admin API key and its realm.
pub struct AdminKey {
    pub api_key: ApiKey,
    pub realm: Realm,
}

/// An authorized device API key and its realm.
pub struct DeviceKey {
    pub api_key: ApiKey,
    pub realm: Realm,
}

async fn authorize_parts(parts: &Parts, expected: ApiKeyType) -> Result<(ApiKey, Realm), ApiError> {
    let header = parts
        .headers
        .get("x-api-key")
        .ok_or(ApiError::MissingApiKey)?;
    let provided = header.to_str().map_err(|_| ApiError::Unauthorized)?;

    let (api_key, realm) =
        apikey::authorize(database::get_db(), secrets::get_secrets(), provided).await?;

    if api_key.key_type != expected {
        return Err(ApiError::Unauthorized);
    }
    Ok((api_key, realm))
}

#[async_trait]
impl<S> FromRequestParts<S> for AdminKey
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let (api_key, realm) = authorize_parts(parts, ApiKeyType::Admin).await?;
        Ok(AdminKey { api_key, realm })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for DeviceKey
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let (api_key, realm) = authorize_parts(parts, ApiKeyType::Device).await?;
        Ok(DeviceKey { api_key, realm })
    }
}

/// Two-tier rate limit: per API key (realm-configured bucket) and per
/// client address (global defaults).
pub async fn enforce_rate_limit(
    realm: &Realm,
    api_key: &ApiKey,
    headers: &HeaderMap,
) -> Result<(), ApiError> {
    let settings = config::get_settings();
    let limiter = ratelimit::get_ratelimit();
    let secrets = secrets::get_secrets();

    let key_scope = format!("apikey:{}:{}", realm.id, api_key.storage_hmac);
    if !limiter
        .allow(
            secrets,
            &key_scope,
            realm.rate_limit_burst,
            realm.rate_limit_refill,
        )
        .await
    {
        return Err(ApiError::RateLimited);
    }

    if let Some(ip) = client_ip(headers) {
        let ip_scope = format!("ip:{}", ip);
        if !limiter
            .allow(
                secrets,
                &ip_scope,
                settings.rate_limit_burst,
                settings.rate_limit_refill,
            )
            .await
        {
            return Err(ApiError::RateLimited);
        }
    }
    Ok(())
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers.get("x-forwarded-for")?.to_str().ok()?;
    let first = forwarded.split(',').next()?.trim();
    if first.is_empty() {
        None
    } else {
        Some(first.to_string())
    }
}

/// Health check response
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// API version
    pub version: String,
    /// Build information
    pub build: BuildInfo,
}

/// Build and version information
#[derive(Debug, Serialize, ToSchema)]
pub struct BuildInfo {
    pub git_hash: String,
    pub git_branch: String,
    pub build_timestamp: String,
    pub rust_version: String,
}

/// Health check endpoint
///
/// Healthy iff the database answers a ping and the signer cache holds at
/// least one valid entry.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is unavailable", body = ErrorResponse)
    )
)]
pub async fn health_handler() -> Response {
    let settings = config::get_settings();

    let db_ok = database::ping().await.is_ok();
    let signer_ok = keyvault::get_keyvault().has_valid_signer();

    if !db_ok || !signer_ok {
        let body = ErrorResponse {
            error: format!("unhealthy: database={} signer_cache={}", db_ok, signer_ok),
            error_code: "internal".to_string(),
        };
        return (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
    }

    Json(HealthResponse {
        status: "ok".to_string(),
        version: settings.version.clone(),
        build: BuildInfo {
            git_hash: env!("GIT_HASH").to_string(),
            git_branch: env!("GIT_BRANCH").to_string(),
            build_timestamp: env!("BUILD_TIMESTAMP").to_string(),
            rust_version: env!("RUST_VERSION").to_string(),
        },
    })
    .into_response()
}

/// OpenAPI documentation
#[derive(utoipa::OpenApi)]
#[openapi(
    paths(
        issue::issue_handler,
        issue::batch_issue_handler,
        codestatus::check_status_handler,
        codestatus::expire_handler,
        verify::verify_handler,
        certificate::certificate_handler,
        health_handler,
    ),
    components(
        schemas(
            issue::IssueRequest,
            issue::IssueResponse,
            issue::BatchIssueRequest,
            issue::BatchIssueResponse,
            issue::BatchIssueEntry,
            codestatus::CodeStatusRequest,
            codestatus::CodeStatusResponse,
            codestatus::ExpireResponse,
            verify::VerifyRequest,
            verify::VerifyResponse,
            certificate::CertificateRequest,
            certificate::CertificateResponse,
            ErrorResponse,
            HealthResponse,
            BuildInfo,
        )
    ),
    tags(
        (name = "issue", description = "Code issuance (admin API key)"),
        (name = "verify", description = "Code verification and certification (device API key)"),
        (name = "health", description = "Health check"),
    ),
    info(
        title = "Code Verification API",
        version = "0.1.0",
        description = "Multi-tenant diagnosis code verification service"
    )
)]
pub struct ApiDoc;
