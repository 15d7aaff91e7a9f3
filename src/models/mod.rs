use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Test result classification carried by a code, token, and certificate.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, utoipa::ToSchema,
)]
#[sqlx(type_name = "VARCHAR")]
pub enum TestType {
    #[serde(rename = "confirmed")]
    #[sqlx(rename = "confirmed")]
    Confirmed,
    #[serde(rename = "likely")]
    #[sqlx(rename = "likely")]
    Likely,
    #[serde(rename = "negative")]
    #[sqlx(rename = "negative")]
    Negative,
    #[serde(rename = "user-report")]
    #[sqlx(rename = "user-report")]
    UserReport,
}

impl TestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::Confirmed => "confirmed",
            TestType::Likely => "likely",
            TestType::Negative => "negative",
            TestType::UserReport => "user-report",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "confirmed" => Some(TestType::Confirmed),
            "likely" => Some(TestType::Likely),
            "negative" => Some(TestType::Negative),
            "user-report" => Some(TestType::UserReport),
            _ => None,
        }
    }
}

/// Lifecycle state of a realm signing key version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
pub enum KeyState {
    Pending,
    Active,
    Retired,
}

/// What a signing key signs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
pub enum KeyPurpose {
    Token,
    Certificate,
}

impl KeyPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyPurpose::Token => "token",
            KeyPurpose::Certificate => "certificate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
pub enum ApiKeyType {
    Admin,
    Device,
    Stats,
}

/// A tenant. Owns its codes, signing keys, and API keys.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Realm {
    pub id: i64,
    pub name: String,
    pub region_code: String,
    pub code_length: i32,
    pub code_duration_secs: i64,
    pub long_code_duration_secs: i64,
    pub allowed_test_types: Vec<String>,
    pub symptom_age_days: i32,
    pub daily_quota: i64,
    pub allow_bulk_issue: bool,
    pub maintenance_mode: bool,
    pub use_realm_certificate_key: bool,
    pub certificate_issuer: String,
    pub certificate_audience: String,
    pub certificate_duration_secs: i64,
    pub use_authenticated_sms: bool,
    pub sms_text_template: String,
    pub sms_text_alt_templates: Option<serde_json::Value>,
    pub sms_fail_closed: bool,
    pub rate_limit_burst: i64,
    pub rate_limit_refill: f64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Realm {
    pub fn allows_test_type(&self, t: TestType) -> bool {
        self.allowed_test_types.iter().any(|a| a == t.as_str())
    }

    /// SMS body template for the given label, falling back to the default
    /// template when the label is absent.
    pub fn sms_template(&self, label: Option<&str>) -> &str {
        if let (Some(label), Some(alts)) = (label, self.sms_text_alt_templates.as_ref()) {
            if let Some(serde_json::Value::String(t)) = alts.get(label) {
                return t;
            }
        }
        &self.sms_text_template
    }
}

/// A single issuance. Plaintext codes are never stored; the HMACs index them.
#[allow(dead_code)]
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Code {
    pub id: i64,
    pub realm_id: i64,
    pub uuid: Uuid,
    pub short_hmac: String,
    pub long_hmac: String,
    pub test_type: TestType,
    pub symptom_date: Option<NaiveDate>,
    pub test_date: Option<NaiveDate>,
    pub phone_encrypted: Option<Vec<u8>>,
    pub nonce: Option<Vec<u8>>,
    pub issuing_user_id: i64,
    pub issuing_app_id: i64,
    pub tz_offset_min: i32,
    pub created_at: NaiveDateTime,
    pub short_expires_at: NaiveDateTime,
    pub long_expires_at: NaiveDateTime,
    pub claimed: bool,
    pub claimed_at: Option<NaiveDateTime>,
}

/// The intermediate artifact minted by Verify and consumed by Certify.
#[allow(dead_code)]
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TokenRecord {
    pub id: i64,
    pub token_id: Uuid,
    pub token_hmac: String,
    pub realm_id: i64,
    pub test_type: TestType,
    pub symptom_interval: Option<i64>,
    pub subject: String,
    pub issued_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
    pub used: bool,
    pub used_at: Option<NaiveDateTime>,
}

#[allow(dead_code)]
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SigningKey {
    pub id: i64,
    pub realm_id: i64,
    pub purpose: KeyPurpose,
    pub kms_key_version: String,
    pub kid: String,
    pub state: KeyState,
    pub created_at: NaiveDateTime,
    pub activated_at: Option<NaiveDateTime>,
    pub retired_at: Option<NaiveDateTime>,
}

#[allow(dead_code)]
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKey {
    pub id: i64,
    pub realm_id: i64,
    pub key_type: ApiKeyType,
    pub signature_hmac: String,
    pub storage_hmac: String,
    pub name: String,
    pub disabled: bool,
    pub created_at: NaiveDateTime,
    pub last_used_at: Option<NaiveDateTime>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_round_trip() {
        for t in [
            TestType::Confirmed,
            TestType::Likely,
            TestType::Negative,
            TestType::UserReport,
        ] {
            assert_eq!(TestType::parse(t.as_str()), Some(t));
        }
        assert_eq!(TestType::parse("bogus"), None);
    }

    #[test]
    fn test_type_serde_uses_wire_names() {
        let json = serde_json::to_string(&TestType::UserReport).unwrap();
        assert_eq!(json, "\"user-report\"");
        let back: TestType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TestType::UserReport);
    }
}
