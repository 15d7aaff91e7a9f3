use axum::{http::HeaderMap, Json};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use crate::api::{enforce_rate_limit, ApiError, DeviceKey, ErrorResponse};
use crate::config;
use crate::database;
use crate::jws::{self, CertificateClaims, JwsError, Subject, TokenClaims};
use crate::keyvault;
use crate::keyvault::kms::KmsError;
use crate::secrets;
use crate::store::tokens;

const TEK_HMAC_LENGTH: usize = 32;

/// Request to exchange a token plus the device TEK-HMAC for a certificate
#[derive(Debug, Deserialize, ToSchema)]
pub struct CertificateRequest {
    /// Verification token from /api/verify
    pub token: Option<String>,
    /// Base64 HMAC-SHA256 over the device's temporary exposure keys
    pub ekeyhmac: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CertificateResponse {
    /// Signed verification certificate for the upstream key server
    pub certificate: String,
}

/// Exchange a verification token for a verification certificate
///
/// The certificate is signed before the token is claimed, so a claim
/// success is always paired with a response the caller received; the claim
/// is the commit point.
#[utoipa::path(
    post,
    path = "/api/certificate",
    tag = "verify",
    request_body = CertificateRequest,
    responses(
        (status = 200, description = "Certificate minted", body = CertificateResponse),
        (status = 400, description = "Token or HMAC rejected", body = ErrorResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 429, description = "Rate limited", body = ErrorResponse)
    )
)]
pub async fn certificate_handler(
    device: DeviceKey,
    headers: HeaderMap,
    Json(req): Json<CertificateRequest>,
) -> Result<Json<CertificateResponse>, ApiError> {
    enforce_rate_limit(&device.realm, &device.api_key, &headers).await?;

    let token = match req.token.as_deref() {
        None | Some("") => return Err(ApiError::MissingField("token")),
        Some(token) => token,
    };
    let ekeyhmac = match req.ekeyhmac.as_deref() {
        None | Some("") => return Err(ApiError::MissingField("ekeyhmac")),
        Some(raw) => raw,
    };

    let settings = config::get_settings();
    let pool = database::get_db();
    let vault = keyvault::get_keyvault();

    // Resolve the verifying key by the token's kid; the realm may have
    // rotated since the token was minted.
    let kid = jws::decode_kid(token).map_err(|_| ApiError::TokenInvalid)?;
    let public_key = vault
        .public_key(pool, &kid)
        .await
        .map_err(classify_key_error)?;

    let claims: TokenClaims = jws::verify_compact(
        token,
        &public_key,
        &settings.token_issuer,
        &settings.token_issuer,
        settings.allowed_clock_skew_secs,
    )
    .map_err(|e| match e {
        JwsError::Expired => ApiError::TokenExpired,
        _ => ApiError::TokenInvalid,
    })?;

    let subject = Subject::decode(&claims.sub).ok_or(ApiError::TokenInvalid)?;

    let hmac_bytes = STANDARD
        .decode(ekeyhmac)
        .map_err(|_| ApiError::HmacInvalid)?;
    if hmac_bytes.len() != TEK_HMAC_LENGTH {
        return Err(ApiError::HmacLengthInvalid);
    }

    let signer = vault
        .certificate_signer(pool, &device.realm)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let now = Utc::now();
    let expires = now + Duration::seconds(signer.duration_secs);
    let certificate_claims = CertificateClaims {
        iss: signer.issuer.clone(),
        aud: signer.audience.clone(),
        iat: now.timestamp(),
        nbf: now.timestamp() - settings.allowed_clock_skew_secs,
        exp: expires.timestamp(),
        report_type: subject.test_type.as_str().to_string(),
        symptom_onset_interval: subject.symptom_interval,
        tekmac: ekeyhmac.to_string(),
    };

    // Sign first, claim second. A signed-but-unclaimed certificate is
    // harmless; a claimed-but-unsigned token would strand the device.
    let certificate = jws::sign_compact(vault, &signer.signer, &certificate_claims)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    tokens::claim(
        pool,
        secrets::get_secrets(),
        &claims.jti,
        device.realm.id,
        &claims.sub,
        now.naive_utc(),
    )
    .await?;

    info!(
        realm_id = device.realm.id,
        token_id = %claims.jti,
        kid = %signer.signer.kid,
        "certificate issued"
    );

    Ok(Json(CertificateResponse { certificate }))
}

fn classify_key_error(e: anyhow::Error) -> ApiError {
    if let Some(kms_error) = e.downcast_ref::<KmsError>() {
        if kms_error.is_transient() {
            return ApiError::Internal(kms_error.to_string());
        }
    }
    if e.downcast_ref::<sqlx::Error>().is_some() {
        return ApiError::Internal(e.to_string());
    }
    ApiError::TokenInvalid
}
