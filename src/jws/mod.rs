use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::NaiveDate;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use p256::ecdsa::VerifyingKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keyvault::{KeyVault, SignerRef};
use crate::models::TestType;

#[derive(Debug, Error)]
pub enum JwsError {
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Claims of the verification token minted by Verify.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Claims of the verification certificate minted by Certify. The upstream
/// key server consumes these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateClaims {
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    #[serde(rename = "reportType")]
    pub report_type: String,
    #[serde(
        rename = "symptomOnsetInterval",
        skip_serializing_if = "Option::is_none"
    )]
    pub symptom_onset_interval: Option<i64>,
    pub tekmac: String,
}

/// Token subject: the code attributes asserted again at certify time and
/// compared byte-for-byte against what Verify recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub test_type: TestType,
    pub symptom_interval: Option<i64>,
    pub tz_offset_minutes: i32,
}

impl Subject {
    pub fn encode(&self) -> String {
        let interval = self
            .symptom_interval
            .map(|i| i.to_string())
            .unwrap_or_default();
        format!(
            "{}|{}|{}",
            self.test_type.as_str(),
            interval,
            self.tz_offset_minutes
        )
    }

    pub fn decode(s: &str) -> Option<Self> {
        let mut parts = s.split('|');
        let test_type = TestType::parse(parts.next()?)?;
        let interval_part = parts.next()?;
        let symptom_interval = if interval_part.is_empty() {
            None
        } else {
            Some(interval_part.parse().ok()?)
        };
        let tz_offset_minutes = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Subject {
            test_type,
            symptom_interval,
            tz_offset_minutes,
        })
    }
}

/// 10-minute interval number for a symptom onset date, counted from the
/// unix epoch at UTC midnight of that date.
pub fn onset_interval(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc()
        .timestamp()
        / 600
}

#[derive(Serialize)]
struct Header<'a> {
    alg: &'a str,
    typ: &'a str,
    kid: &'a str,
}

/// Assemble and sign a compact JWS. The private key never leaves the KMS:
/// the signing input is built here and the signature requested through the
/// vault.
pub async fn sign_compact<C: Serialize>(
    vault: &KeyVault,
    signer: &SignerRef,
    claims: &C,
) -> Result<String, JwsError> {
    let header = Header {
        alg: "ES256",
        typ: "JWT",
        kid: &signer.kid,
    };
    let header_b64 = URL_SAFE_NO_PAD.encode(
        serde_json::to_vec(&header).map_err(|e| JwsError::Signing(e.to_string()))?,
    );
    let payload_b64 = URL_SAFE_NO_PAD.encode(
        serde_json::to_vec(claims).map_err(|e| JwsError::Signing(e.to_string()))?,
    );

    let signing_input = format!("{}.{}", header_b64, payload_b64);
    let signature = vault
        .sign(&signer.kms_key_version, signing_input.as_bytes())
        .await
        .map_err(|e| JwsError::Signing(e.to_string()))?;

    Ok(format!(
        "{}.{}",
        signing_input,
        URL_SAFE_NO_PAD.encode(signature)
    ))
}

/// Extract the `kid` header without verifying.
pub fn decode_kid(token: &str) -> Result<String, JwsError> {
    let header =
        jsonwebtoken::decode_header(token).map_err(|e| JwsError::Invalid(e.to_string()))?;
    header
        .kid
        .ok_or_else(|| JwsError::Invalid("missing kid header".to_string()))
}

/// Verify a compact ES256 JWS against a resolved public key, checking
/// signature, `iss`, `aud`, `exp`, and `nbf` with the allowed clock skew.
pub fn verify_compact<C: DeserializeOwned>(
    token: &str,
    public_key: &VerifyingKey,
    issuer: &str,
    audience: &str,
    leeway_secs: i64,
) -> Result<C, JwsError> {
    let point = public_key.to_encoded_point(false);
    let x = point
        .x()
        .ok_or_else(|| JwsError::Invalid("malformed public key".to_string()))?;
    let y = point
        .y()
        .ok_or_else(|| JwsError::Invalid("malformed public key".to_string()))?;
    let decoding_key =
        DecodingKey::from_ec_components(&URL_SAFE_NO_PAD.encode(x), &URL_SAFE_NO_PAD.encode(y))
            .map_err(|e| JwsError::Invalid(e.to_string()))?;

    let mut validation = Validation::new(Algorithm::ES256);
    validation.leeway = leeway_secs.max(0) as u64;
    validation.validate_nbf = true;
    validation.set_issuer(&[issuer]);
    validation.set_audience(&[audience]);

    let data = jsonwebtoken::decode::<C>(token, &decoding_key, &validation).map_err(|e| {
        match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwsError::Expired,
            _ => JwsError::Invalid(e.to_string()),
        }
    })?;
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyvault::kms::{InMemoryKms, Kms};
    use chrono::Utc;
    use std::sync::Arc;

    fn claims(now_offset: i64, ttl: i64) -> TokenClaims {
        let now = Utc::now().timestamp() + now_offset;
        TokenClaims {
            iss: "issuer".to_string(),
            aud: "issuer".to_string(),
            iat: now,
            nbf: now - 60,
            exp: now + ttl,
            jti: "jti-1".to_string(),
            sub: "confirmed|2840112|0".to_string(),
            nonce: None,
        }
    }

    async fn vault_with_kms() -> (KeyVault, Arc<InMemoryKms>, SignerRef) {
        let kms = Arc::new(InMemoryKms::new());
        let vault = KeyVault::new(kms.clone());
        let signer = SignerRef {
            kid: "v1".to_string(),
            kms_key_version: "system/token".to_string(),
        };
        (vault, kms, signer)
    }

    #[tokio::test]
    async fn sign_and_verify_round_trip() {
        let (vault, kms, signer) = vault_with_kms().await;
        let token = sign_compact(&vault, &signer, &claims(0, 1800)).await.unwrap();
        assert_eq!(token.split('.').count(), 3);
        assert_eq!(decode_kid(&token).unwrap(), "v1");

        let public = kms.public_key("system/token").await.unwrap();
        let decoded: TokenClaims =
            verify_compact(&token, &public, "issuer", "issuer", 60).unwrap();
        assert_eq!(decoded.jti, "jti-1");
        assert_eq!(decoded.sub, "confirmed|2840112|0");
    }

    #[tokio::test]
    async fn expired_token_is_classified() {
        let (vault, kms, signer) = vault_with_kms().await;
        let token = sign_compact(&vault, &signer, &claims(-4000, 1800))
            .await
            .unwrap();
        let public = kms.public_key("system/token").await.unwrap();
        let err = verify_compact::<TokenClaims>(&token, &public, "issuer", "issuer", 60)
            .unwrap_err();
        assert!(matches!(err, JwsError::Expired));
    }

    #[tokio::test]
    async fn audience_mismatch_is_invalid() {
        let (vault, kms, signer) = vault_with_kms().await;
        let token = sign_compact(&vault, &signer, &claims(0, 1800)).await.unwrap();
        let public = kms.public_key("system/token").await.unwrap();
        let err = verify_compact::<TokenClaims>(&token, &public, "issuer", "other", 60)
            .unwrap_err();
        assert!(matches!(err, JwsError::Invalid(_)));
    }

    #[tokio::test]
    async fn tampered_payload_fails_verification() {
        let (vault, kms, signer) = vault_with_kms().await;
        let token = sign_compact(&vault, &signer, &claims(0, 1800)).await.unwrap();
        let public = kms.public_key("system/token").await.unwrap();

        let mut parts: Vec<&str> = token.split('.').collect();
        let mut forged = claims(0, 1800);
        forged.sub = "negative|2840112|0".to_string();
        let forged_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        parts[1] = &forged_b64;
        let tampered = parts.join(".");

        assert!(
            verify_compact::<TokenClaims>(&tampered, &public, "issuer", "issuer", 60).is_err()
        );
    }

    #[tokio::test]
    async fn wrong_key_fails_verification() {
        let (vault, kms, signer) = vault_with_kms().await;
        let token = sign_compact(&vault, &signer, &claims(0, 1800)).await.unwrap();
        let public = kms.public_key("system/other").await.unwrap();
        assert!(verify_compact::<TokenClaims>(&token, &public, "issuer", "issuer", 60).is_err());
    }

    #[test]
    fn subject_round_trip() {
        let subject = Subject {
            test_type: TestType::Confirmed,
            symptom_interval: Some(2840112),
            tz_offset_minutes: -480,
        };
        assert_eq!(subject.encode(), "confirmed|2840112|-480");
        assert_eq!(Subject::decode("confirmed|2840112|-480"), Some(subject));

        let no_onset = Subject {
            test_type: TestType::Negative,
            symptom_interval: None,
            tz_offset_minutes: 0,
        };
        assert_eq!(no_onset.encode(), "negative||0");
        assert_eq!(Subject::decode("negative||0"), Some(no_onset));

        assert_eq!(Subject::decode("bogus|1|0"), None);
        assert_eq!(Subject::decode("confirmed|1"), None);
    }

    #[test]
    fn onset_interval_formula() {
        // 2024-01-01 00:00:00 UTC = 1704067200; 1704067200 / 600 = 2840112.
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(onset_interval(date), 2840112);
    }
}
