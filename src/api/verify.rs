use axum::{http::HeaderMap, Json};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use utoipa::ToSchema;

use crate::api::{enforce_rate_limit, ApiError, DeviceKey, ErrorResponse};
use crate::config;
use crate::database;
use crate::jws::{self, Subject, TokenClaims};
use crate::keyvault;
use crate::models::TestType;
use crate::secrets;
use crate::store::codes;
use crate::store::tokens;

/// Request to exchange a code for a verification token
#[derive(Debug, Deserialize, ToSchema)]
pub struct VerifyRequest {
    /// Plaintext short or long code
    pub code: Option<String>,
    /// Test types the client is willing to accept
    #[serde(rename = "acceptTestTypes", default)]
    pub accept_test_types: Vec<String>,
    /// SMS nonce, required when the realm uses authenticated SMS
    pub nonce: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VerifyResponse {
    #[serde(rename = "testType")]
    pub test_type: TestType,
    #[serde(rename = "symptomDate", skip_serializing_if = "Option::is_none")]
    pub symptom_date: Option<String>,
    /// Signed verification token
    pub token: String,
    #[serde(rename = "tokenType")]
    pub token_type: String,
}

/// Exchange a code for a verification token
///
/// Claims the code atomically; exactly one of two racing claimants wins.
#[utoipa::path(
    post,
    path = "/api/verify",
    tag = "verify",
    request_body = VerifyRequest,
    responses(
        (status = 200, description = "Code claimed, token minted", body = VerifyResponse),
        (status = 400, description = "Code rejected", body = ErrorResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 429, description = "Rate limited", body = ErrorResponse)
    )
)]
pub async fn verify_handler(
    device: DeviceKey,
    headers: HeaderMap,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
    enforce_rate_limit(&device.realm, &device.api_key, &headers).await?;

    let code = match req.code.as_deref() {
        None | Some("") => return Err(ApiError::MissingField("code")),
        Some(code) => code,
    };

    // Accepting only "confirmed" is the compatibility default for clients
    // that predate acceptTestTypes.
    let accept_types = if req.accept_test_types.is_empty() {
        vec![TestType::Confirmed]
    } else {
        req.accept_test_types
            .iter()
            .map(|raw| {
                TestType::parse(raw).ok_or_else(|| {
                    ApiError::InvalidRequest(format!("unknown test type: {}", raw))
                })
            })
            .collect::<Result<Vec<_>, _>>()?
    };

    let nonce = if device.realm.use_authenticated_sms {
        let raw = match req.nonce.as_deref() {
            None | Some("") => return Err(ApiError::MissingField("nonce")),
            Some(raw) => raw,
        };
        Some(
            URL_SAFE_NO_PAD
                .decode(raw)
                .map_err(|_| ApiError::NonceInvalid)?,
        )
    } else {
        None
    };

    let settings = config::get_settings();
    let pool = database::get_db();
    let secrets = secrets::get_secrets();
    let now = Utc::now().naive_utc();

    let (mut tx, claimed) = codes::verify_claim(
        pool,
        secrets,
        &device.realm,
        code,
        &accept_types,
        nonce.as_deref(),
        now,
    )
    .await?;

    let subject = Subject {
        test_type: claimed.test_type,
        symptom_interval: claimed.symptom_date.map(jws::onset_interval),
        tz_offset_minutes: claimed.tz_offset_minutes,
    };

    let token_id = uuid::Uuid::new_v4();
    let expires_at = now + Duration::seconds(settings.verification_token_duration_secs);
    tokens::insert_tx(
        &mut tx,
        secrets,
        token_id,
        device.realm.id,
        claimed.test_type,
        subject.symptom_interval,
        &subject.encode(),
        now,
        expires_at,
    )
    .await?;
    tx.commit().await?;

    let claims = TokenClaims {
        iss: settings.token_issuer.clone(),
        aud: settings.token_issuer.clone(),
        iat: now.and_utc().timestamp(),
        nbf: now.and_utc().timestamp() - settings.allowed_clock_skew_secs,
        exp: expires_at.and_utc().timestamp(),
        jti: token_id.to_string(),
        sub: subject.encode(),
        nonce: nonce
            .as_deref()
            .map(|n| URL_SAFE_NO_PAD.encode(Sha256::digest(n))),
    };

    let vault = keyvault::get_keyvault();
    let signer = vault
        .token_signer()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let token = jws::sign_compact(vault, &signer, &claims)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    info!(
        realm_id = device.realm.id,
        code_uuid = %claimed.uuid,
        token_id = %token_id,
        "code verified"
    );

    Ok(Json(VerifyResponse {
        test_type: claimed.test_type,
        symptom_date: claimed.symptom_date.map(|d| d.to_string()),
        token,
        token_type: "verificationToken".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::helpers::{
        cleanup_db, create_test_api_key, create_test_realm, issue_code, recent_symptom_date,
        setup,
    };
    use crate::models::ApiKeyType;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        routing::post,
        Router,
    };
    use serde_json::json;
    use serial_test::serial;
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new().route("/api/verify", post(verify_handler))
    }

    fn verify_request(api_key: &str, payload: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/verify")
            .header("content-type", "application/json")
            .header("x-api-key", api_key)
            .body(Body::from(serde_json::to_vec(&payload).unwrap()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    #[serial]
    async fn verify_mints_a_signed_token() {
        setup().await;
        cleanup_db().await;

        let realm = create_test_realm("verify-happy").await;
        let (device_key, _) = create_test_api_key(realm.id, ApiKeyType::Device).await;
        let symptom_date = recent_symptom_date();
        let issued = issue_code(&realm, Some(symptom_date)).await;

        let response = app()
            .oneshot(verify_request(
                &device_key,
                json!({"code": issued.code, "acceptTestTypes": ["confirmed"]}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["testType"], "confirmed");
        assert_eq!(body["tokenType"], "verificationToken");
        assert_eq!(body["symptomDate"], symptom_date.to_string());

        let token = body["token"].as_str().unwrap();
        assert_eq!(token.split('.').count(), 3);
        assert_eq!(jws::decode_kid(token).unwrap(), "v1");

        cleanup_db().await;
    }

    #[tokio::test]
    #[serial]
    async fn long_code_also_claims() {
        setup().await;
        cleanup_db().await;

        let realm = create_test_realm("verify-long").await;
        let (device_key, _) = create_test_api_key(realm.id, ApiKeyType::Device).await;
        let issued = issue_code(&realm, None).await;

        let response = app()
            .oneshot(verify_request(
                &device_key,
                json!({"code": issued.long_code, "acceptTestTypes": ["confirmed"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        cleanup_db().await;
    }

    #[tokio::test]
    #[serial]
    async fn unknown_code_is_not_found() {
        setup().await;
        cleanup_db().await;

        let realm = create_test_realm("verify-missing").await;
        let (device_key, _) = create_test_api_key(realm.id, ApiKeyType::Device).await;

        let response = app()
            .oneshot(verify_request(
                &device_key,
                json!({"code": "00000000", "acceptTestTypes": ["confirmed"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["errorCode"], "code_not_found");

        cleanup_db().await;
    }

    #[tokio::test]
    #[serial]
    async fn second_claim_is_rejected() {
        setup().await;
        cleanup_db().await;

        let realm = create_test_realm("verify-double").await;
        let (device_key, _) = create_test_api_key(realm.id, ApiKeyType::Device).await;
        let issued = issue_code(&realm, None).await;

        let payload = json!({"code": issued.code, "acceptTestTypes": ["confirmed"]});
        let first = app()
            .oneshot(verify_request(&device_key, payload.clone()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app()
            .oneshot(verify_request(&device_key, payload))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(second).await["errorCode"],
            "code_already_claimed"
        );

        cleanup_db().await;
    }

    #[tokio::test]
    #[serial]
    async fn racing_claims_have_exactly_one_winner() {
        setup().await;
        cleanup_db().await;

        let realm = create_test_realm("verify-race").await;
        let (device_key, _) = create_test_api_key(realm.id, ApiKeyType::Device).await;
        let issued = issue_code(&realm, None).await;

        let payload = json!({"code": issued.code, "acceptTestTypes": ["confirmed"]});
        let (a, b) = tokio::join!(
            app().oneshot(verify_request(&device_key, payload.clone())),
            app().oneshot(verify_request(&device_key, payload)),
        );
        let statuses = [a.unwrap().status(), b.unwrap().status()];
        let wins = statuses.iter().filter(|s| **s == StatusCode::OK).count();
        assert_eq!(wins, 1);

        cleanup_db().await;
    }

    #[tokio::test]
    #[serial]
    async fn unaccepted_test_type_is_rejected() {
        setup().await;
        cleanup_db().await;

        let realm = create_test_realm("verify-types").await;
        let (device_key, _) = create_test_api_key(realm.id, ApiKeyType::Device).await;
        let issued = issue_code(&realm, None).await;

        let response = app()
            .oneshot(verify_request(
                &device_key,
                json!({"code": issued.code, "acceptTestTypes": ["negative"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await["errorCode"],
            "test_type_not_accepted"
        );

        cleanup_db().await;
    }

    #[tokio::test]
    #[serial]
    async fn expired_code_is_rejected() {
        setup().await;
        cleanup_db().await;

        let realm = create_test_realm("verify-expired").await;
        let (device_key, _) = create_test_api_key(realm.id, ApiKeyType::Device).await;
        let issued = issue_code(&realm, None).await;

        sqlx::query(
            "UPDATE codes SET short_expires_at = NOW() - INTERVAL '1 hour',
                              long_expires_at = NOW() - INTERVAL '1 hour'
             WHERE realm_id = $1",
        )
        .bind(realm.id)
        .execute(crate::database::get_db())
        .await
        .unwrap();

        let response = app()
            .oneshot(verify_request(
                &device_key,
                json!({"code": issued.code, "acceptTestTypes": ["confirmed"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["errorCode"], "code_expired");

        cleanup_db().await;
    }

    #[tokio::test]
    #[serial]
    async fn authenticated_sms_requires_matching_nonce() {
        setup().await;
        cleanup_db().await;

        let realm = create_test_realm("verify-nonce").await;
        sqlx::query("UPDATE realms SET use_authenticated_sms = TRUE WHERE id = $1")
            .bind(realm.id)
            .execute(crate::database::get_db())
            .await
            .unwrap();
        let realm = crate::test_utils::helpers::reload_realm(realm.id).await;
        let (device_key, _) = create_test_api_key(realm.id, ApiKeyType::Device).await;
        let issued = issue_code(&realm, None).await;
        let nonce = issued.nonce.as_ref().expect("authenticated sms sets a nonce");

        // Missing nonce.
        let response = app()
            .oneshot(verify_request(
                &device_key,
                json!({"code": issued.code, "acceptTestTypes": ["confirmed"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Wrong nonce.
        let response = app()
            .oneshot(verify_request(
                &device_key,
                json!({
                    "code": issued.code,
                    "acceptTestTypes": ["confirmed"],
                    "nonce": URL_SAFE_NO_PAD.encode([9u8; 32])
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["errorCode"], "nonce_invalid");

        // Correct nonce claims, and the token binds SHA256(nonce).
        let response = app()
            .oneshot(verify_request(
                &device_key,
                json!({
                    "code": issued.code,
                    "acceptTestTypes": ["confirmed"],
                    "nonce": URL_SAFE_NO_PAD.encode(nonce)
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let token = body["token"].as_str().unwrap();
        let payload_b64 = token.split('.').nth(1).unwrap();
        let payload: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload_b64).unwrap()).unwrap();
        assert_eq!(
            payload["nonce"],
            URL_SAFE_NO_PAD.encode(Sha256::digest(nonce))
        );

        cleanup_db().await;
    }
}
