use axum::{http::HeaderMap, Json};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use utoipa::ToSchema;

use crate::api::{enforce_rate_limit, AdminKey, ApiError, ErrorResponse};
use crate::database;
use crate::keyvault;
use crate::models::{Realm, TestType};
use crate::quota;
use crate::secrets;
use crate::sms;
use crate::store::codes::{self, IssueSpec, IssuedCode};

pub const MAX_BATCH_SIZE: usize = 10;

/// Request to issue a verification code
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct IssueRequest {
    /// Test type: confirmed, likely, negative, or user-report
    #[serde(rename = "testType")]
    pub test_type: Option<String>,
    /// Symptom onset date (YYYY-MM-DD)
    #[serde(rename = "symptomDate")]
    pub symptom_date: Option<String>,
    /// Test date (YYYY-MM-DD)
    #[serde(rename = "testDate")]
    pub test_date: Option<String>,
    /// Client UTC offset in minutes, used for day-boundary math
    #[serde(rename = "tzOffset", default)]
    pub tz_offset: i32,
    /// Recipient phone number in E.164 format
    #[serde(default)]
    pub phone: Option<String>,
    /// Caller-side identifier used to reconcile batch entries and dedup
    /// SMS retries
    #[serde(rename = "externalId")]
    pub external_id: Option<String>,
    /// Render the SMS body into the response instead of enqueueing it
    #[serde(rename = "onlyGenerateSMS", default)]
    pub only_generate_sms: bool,
    /// Select one of the realm's alternate SMS templates
    #[serde(rename = "smsTemplateLabel")]
    pub sms_template_label: Option<String>,
}

/// Issued code response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct IssueResponse {
    /// Opaque external identifier for status queries (not a code)
    pub uuid: String,
    /// Short human-enterable code
    pub code: String,
    /// Long code embedded in SMS links
    #[serde(rename = "longCode")]
    pub long_code: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: String,
    #[serde(rename = "expiresAtTimestamp")]
    pub expires_at_timestamp: i64,
    #[serde(rename = "longExpiresAt")]
    pub long_expires_at: String,
    #[serde(rename = "longExpiresAtTimestamp")]
    pub long_expires_at_timestamp: i64,
    #[serde(rename = "testType")]
    pub test_type: TestType,
    /// Populated when SMS delivery failed but the realm fails open
    #[serde(rename = "smsErrorCode", skip_serializing_if = "Option::is_none")]
    pub sms_error_code: Option<String>,
    /// Rendered SMS body, present only for onlyGenerateSMS requests
    #[serde(rename = "generatedSMS", skip_serializing_if = "Option::is_none")]
    pub generated_sms: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BatchIssueRequest {
    pub codes: Vec<IssueRequest>,
}

/// Per-entry result; either the issued fields or an error pair.
#[derive(Debug, Serialize, ToSchema)]
pub struct BatchIssueEntry {
    #[serde(flatten)]
    pub issued: Option<IssueResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "errorCode", skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BatchIssueResponse {
    pub codes: Vec<BatchIssueEntry>,
}

/// Issue a verification code
#[utoipa::path(
    post,
    path = "/api/issue",
    tag = "issue",
    request_body = IssueRequest,
    responses(
        (status = 200, description = "Code issued", body = IssueResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 429, description = "Rate limited or over quota", body = ErrorResponse),
        (status = 503, description = "Realm in maintenance mode", body = ErrorResponse)
    )
)]
pub async fn issue_handler(
    admin: AdminKey,
    headers: HeaderMap,
    Json(req): Json<IssueRequest>,
) -> Result<Json<IssueResponse>, ApiError> {
    if admin.realm.maintenance_mode {
        return Err(ApiError::MaintenanceMode);
    }
    enforce_rate_limit(&admin.realm, &admin.api_key, &headers).await?;

    let response = issue_one(&admin.realm, admin.api_key.id, &req).await?;
    Ok(Json(response))
}

/// Issue up to 10 codes in one call
///
/// Always 200 unless the batch itself is malformed; entries succeed or
/// fail independently and the response preserves request order.
#[utoipa::path(
    post,
    path = "/api/batch-issue",
    tag = "issue",
    request_body = BatchIssueRequest,
    responses(
        (status = 200, description = "Per-entry results", body = BatchIssueResponse),
        (status = 400, description = "Invalid batch", body = ErrorResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 503, description = "Realm in maintenance mode", body = ErrorResponse)
    )
)]
pub async fn batch_issue_handler(
    admin: AdminKey,
    headers: HeaderMap,
    Json(req): Json<BatchIssueRequest>,
) -> Result<Json<BatchIssueResponse>, ApiError> {
    if admin.realm.maintenance_mode {
        return Err(ApiError::MaintenanceMode);
    }
    enforce_rate_limit(&admin.realm, &admin.api_key, &headers).await?;

    if !admin.realm.allow_bulk_issue {
        return Err(ApiError::InvalidRequest(
            "bulk issue is not enabled for this realm".to_string(),
        ));
    }
    if req.codes.is_empty() {
        return Err(ApiError::MissingField("codes"));
    }
    if req.codes.len() > MAX_BATCH_SIZE {
        return Err(ApiError::InvalidRequest(format!(
            "batch size exceeds the maximum of {}",
            MAX_BATCH_SIZE
        )));
    }

    let mut entries = Vec::with_capacity(req.codes.len());
    for entry in &req.codes {
        match issue_one(&admin.realm, admin.api_key.id, entry).await {
            Ok(issued) => entries.push(BatchIssueEntry {
                issued: Some(issued),
                error: None,
                error_code: None,
            }),
            Err(e) => entries.push(BatchIssueEntry {
                issued: None,
                error: Some(e.message()),
                error_code: Some(e.error_code().to_string()),
            }),
        }
    }

    Ok(Json(BatchIssueResponse { codes: entries }))
}

/// Validate, dedup, reserve quota, create, and (maybe) send the SMS for a
/// single issuance. Shared by the single and batch endpoints.
async fn issue_one(
    realm: &Realm,
    issuing_app_id: i64,
    req: &IssueRequest,
) -> Result<IssueResponse, ApiError> {
    let spec = parse_request(req)?;

    let pool = database::get_db();
    let secrets = secrets::get_secrets();
    let kms = keyvault::get_keyvault().kms().as_ref();
    let cache = crate::store::get_code_cache();

    // A retried SMS request replays the original issuance instead of
    // minting a second code.
    let fingerprint = codes::fingerprint(realm.id, &spec);
    if let Some(fp) = &fingerprint {
        if let Some(original) = codes::fingerprint_lookup(cache, secrets, kms, fp).await {
            return Ok(build_response(&original, None, None));
        }
    }

    let now = Utc::now().naive_utc();

    // Reserve quota before creation; released again if anything downstream
    // fails so a failed issue never consumes it.
    let reserved = quota::get_quota()
        .take(realm, now)
        .await
        .map_err(ApiError::from)?;
    if !reserved {
        return Err(ApiError::QuotaExceeded);
    }

    let issued = match codes::issue(pool, secrets, kms, realm, &spec, issuing_app_id, now).await {
        Ok(issued) => issued,
        Err(e) => {
            quota::get_quota().release(realm.id, now).await.ok();
            return Err(e.into());
        }
    };

    let mut sms_error_code = None;
    let mut generated_sms = None;
    if let Some(phone) = &spec.phone {
        let template = realm.sms_template(req.sms_template_label.as_deref());
        let body = sms::render(realm, template, &issued);

        if req.only_generate_sms {
            generated_sms = Some(body);
        } else if let Err(e) = sms::get_sms().enqueue(phone, &body).await {
            warn!(realm_id = realm.id, code_uuid = %issued.uuid, error = %e, "sms enqueue failed");
            if realm.sms_fail_closed {
                codes::expire(pool, realm.id, issued.uuid, now).await.ok();
                quota::get_quota().release(realm.id, now).await.ok();
                return Err(ApiError::SmsFailure);
            }
            sms_error_code = Some("sms_failure".to_string());
        }
    } else if req.only_generate_sms {
        return Err(ApiError::InvalidRequest(
            "onlyGenerateSMS requires a phone number".to_string(),
        ));
    }

    // Cached only after delivery is settled so a fail-closed SMS error is
    // not replayed as a success.
    if let Some(fp) = &fingerprint {
        codes::fingerprint_store(cache, secrets, kms, fp, &issued).await;
    }

    Ok(build_response(&issued, sms_error_code, generated_sms))
}

fn parse_request(req: &IssueRequest) -> Result<IssueSpec, ApiError> {
    let test_type = match req.test_type.as_deref() {
        None | Some("") => return Err(ApiError::MissingField("testType")),
        Some(raw) => TestType::parse(raw)
            .ok_or_else(|| ApiError::InvalidRequest(format!("unknown test type: {}", raw)))?,
    };

    let symptom_date = parse_date(req.symptom_date.as_deref())
        .map_err(|_| ApiError::BadSymptomDate("symptomDate must be YYYY-MM-DD".to_string()))?;
    let test_date = parse_date(req.test_date.as_deref())
        .map_err(|_| ApiError::InvalidRequest("testDate must be YYYY-MM-DD".to_string()))?;

    Ok(IssueSpec {
        test_type,
        symptom_date,
        test_date,
        tz_offset_minutes: req.tz_offset,
        phone: req.phone.clone().filter(|p| !p.is_empty()),
        external_id: req.external_id.clone().filter(|id| !id.is_empty()),
    })
}

fn parse_date(raw: Option<&str>) -> Result<Option<NaiveDate>, chrono::ParseError> {
    match raw {
        None | Some("") => Ok(None),
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d").map(Some),
    }
}

fn build_response(
    issued: &IssuedCode,
    sms_error_code: Option<String>,
    generated_sms: Option<String>,
) -> IssueResponse {
    IssueResponse {
        uuid: issued.uuid.to_string(),
        code: issued.code.clone(),
        long_code: issued.long_code.clone(),
        expires_at: http_date(issued.short_expires_at),
        expires_at_timestamp: issued.short_expires_at.and_utc().timestamp(),
        long_expires_at: http_date(issued.long_expires_at),
        long_expires_at_timestamp: issued.long_expires_at.and_utc().timestamp(),
        test_type: issued.test_type,
        sms_error_code,
        generated_sms,
    }
}

fn http_date(t: NaiveDateTime) -> String {
    t.format("%a, %d %b %Y %H:%M:%S UTC").to_string()
}
