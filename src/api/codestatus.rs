use axum::{http::HeaderMap, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::api::{enforce_rate_limit, AdminKey, ApiError, ErrorResponse};
use crate::database;
use crate::store::codes;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CodeStatusRequest {
    /// The opaque UUID returned at issue time
    pub uuid: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CodeStatusResponse {
    pub claimed: bool,
    #[serde(rename = "expiresAtTimestamp")]
    pub expires_at_timestamp: i64,
    #[serde(rename = "longExpiresAtTimestamp")]
    pub long_expires_at_timestamp: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ExpireResponse {
    #[serde(rename = "expiresAtTimestamp")]
    pub expires_at_timestamp: i64,
    #[serde(rename = "longExpiresAtTimestamp")]
    pub long_expires_at_timestamp: i64,
}

fn parse_uuid(raw: Option<&str>) -> Result<Uuid, ApiError> {
    match raw {
        None | Some("") => Err(ApiError::MissingField("uuid")),
        Some(raw) => Uuid::parse_str(raw)
            .map_err(|_| ApiError::InvalidRequest("uuid is not valid".to_string())),
    }
}

/// Look up the claim/expiry status of an issued code
#[utoipa::path(
    post,
    path = "/api/checkcodestatus",
    tag = "issue",
    request_body = CodeStatusRequest,
    responses(
        (status = 200, description = "Code status", body = CodeStatusResponse),
        (status = 400, description = "Unknown code", body = ErrorResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    )
)]
pub async fn check_status_handler(
    admin: AdminKey,
    headers: HeaderMap,
    Json(req): Json<CodeStatusRequest>,
) -> Result<Json<CodeStatusResponse>, ApiError> {
    enforce_rate_limit(&admin.realm, &admin.api_key, &headers).await?;
    let uuid = parse_uuid(req.uuid.as_deref())?;

    let status = codes::check_status(database::get_db(), admin.realm.id, uuid).await?;
    Ok(Json(CodeStatusResponse {
        claimed: status.claimed,
        expires_at_timestamp: status.short_expires_at.and_utc().timestamp(),
        long_expires_at_timestamp: status.long_expires_at.and_utc().timestamp(),
    }))
}

/// Expire a never-claimed code immediately
#[utoipa::path(
    post,
    path = "/api/expirecode",
    tag = "issue",
    request_body = CodeStatusRequest,
    responses(
        (status = 200, description = "Code expired", body = ExpireResponse),
        (status = 400, description = "Unknown or already-claimed code", body = ErrorResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    )
)]
pub async fn expire_handler(
    admin: AdminKey,
    headers: HeaderMap,
    Json(req): Json<CodeStatusRequest>,
) -> Result<Json<ExpireResponse>, ApiError> {
    enforce_rate_limit(&admin.realm, &admin.api_key, &headers).await?;
    let uuid = parse_uuid(req.uuid.as_deref())?;

    let now = Utc::now().naive_utc();
    let status = codes::expire(database::get_db(), admin.realm.id, uuid, now).await?;
    Ok(Json(ExpireResponse {
        expires_at_timestamp: status.short_expires_at.and_utc().timestamp(),
        long_expires_at_timestamp: status.long_expires_at.and_utc().timestamp(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::helpers::{
        cleanup_db, create_test_api_key, create_test_realm, issue_code, setup,
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
        Router::new()
            .route("/api/checkcodestatus", post(check_status_handler))
            .route("/api/expirecode", post(expire_handler))
    }

    fn post_json(uri: &str, api_key: &str, payload: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
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
    async fn status_then_expire_then_status() {
        setup().await;
        cleanup_db().await;

        let realm = create_test_realm("codestatus").await;
        let (key, _) = create_test_api_key(realm.id, ApiKeyType::Admin).await;
        let issued = issue_code(&realm, None).await;
        let uuid = issued.uuid.to_string();

        let response = app()
            .oneshot(post_json("/api/checkcodestatus", &key, json!({"uuid": uuid})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["claimed"], false);
        assert!(body["expiresAtTimestamp"].as_i64().unwrap() > Utc::now().timestamp());

        let response = app()
            .oneshot(post_json("/api/expirecode", &key, json!({"uuid": uuid})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["expiresAtTimestamp"].as_i64().unwrap() <= Utc::now().timestamp());

        let response = app()
            .oneshot(post_json("/api/checkcodestatus", &key, json!({"uuid": uuid})))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert!(body["expiresAtTimestamp"].as_i64().unwrap() <= Utc::now().timestamp());

        cleanup_db().await;
    }

    #[tokio::test]
    #[serial]
    async fn expire_refuses_claimed_codes() {
        setup().await;
        cleanup_db().await;

        let realm = create_test_realm("codestatus-claimed").await;
        let (key, _) = create_test_api_key(realm.id, ApiKeyType::Admin).await;
        let issued = issue_code(&realm, None).await;

        sqlx::query("UPDATE codes SET claimed = TRUE WHERE uuid = $1")
            .bind(issued.uuid)
            .execute(crate::database::get_db())
            .await
            .unwrap();

        let response = app()
            .oneshot(post_json(
                "/api/expirecode",
                &key,
                json!({"uuid": issued.uuid.to_string()}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await["errorCode"],
            "code_already_claimed"
        );

        cleanup_db().await;
    }

    #[tokio::test]
    #[serial]
    async fn unknown_uuid_and_bad_uuid() {
        setup().await;
        cleanup_db().await;

        let realm = create_test_realm("codestatus-unknown").await;
        let (key, _) = create_test_api_key(realm.id, ApiKeyType::Admin).await;

        let response = app()
            .oneshot(post_json(
                "/api/checkcodestatus",
                &key,
                json!({"uuid": uuid::Uuid::new_v4().to_string()}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["errorCode"], "code_not_found");

        let response = app()
            .oneshot(post_json("/api/checkcodestatus", &key, json!({"uuid": "zzz"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["errorCode"], "invalid_request");

        cleanup_db().await;
    }
}
