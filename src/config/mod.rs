use once_cell::sync::Lazy;
use std::env;

#[derive(Debug, Clone)]
pub struct Settings {
    // Server Settings
    pub app_name: String,
    pub version: String,
    pub host: String,
    pub port: u16,

    // Database Settings
    pub database_url: String,

    // Redis Settings
    pub redis_url: String,

    // System signing keys (KMS handles) and the kid values embedded in
    // signed headers when a realm has no key of its own
    pub token_signing_key: String,
    pub certificate_signing_key: String,
    pub token_signing_key_id: String,
    pub certificate_signing_key_id: String,

    // Symmetric KMS key used to encrypt secret database columns
    pub db_encryption_key: String,

    // HMAC key-sets, comma-separated base64; first entry signs
    pub db_apikey_signature_key: String,
    pub db_apikey_database_key: String,
    pub db_verification_code_database_key: String,
    pub db_token_database_key: String,
    pub cache_hmac_key: String,
    pub rate_limit_hmac_key: String,

    // Token / certificate policy (seconds)
    pub allowed_symptom_age_secs: i64,
    pub verification_token_duration_secs: i64,
    pub certificate_duration_secs: i64,
    pub allowed_clock_skew_secs: i64,
    pub token_issuer: String,
    pub certificate_issuer: String,
    pub certificate_audience: String,

    // Issuance
    pub collision_retry_count: u32,
    pub sms_fail_closed: bool,
    pub issue_fingerprint_window_secs: u64,
    pub api_key_prefix: String,

    // Rate limiting defaults (per-realm overrides live on the realm row)
    pub rate_limit_burst: i64,
    pub rate_limit_refill: f64,

    // Background tasks (seconds)
    pub key_rotation_interval_secs: i64,
    pub key_rotation_tick_secs: u64,
    pub sweep_interval_secs: u64,
    pub sweep_grace_secs: i64,

    // KeyVault cache TTLs (seconds)
    pub signer_cache_ttl_secs: u64,
    pub public_key_cache_ttl_secs: u64,
}

impl Settings {
    pub fn new() -> Self {
        // Tests read their environment from .env.test regardless of which
        // test first touches the settings singleton.
        #[cfg(test)]
        dotenvy::from_filename(".env.test").ok();

        Settings {
            app_name: get_env("APP_NAME", "Code Verification API"),
            version: get_env("VERSION", "0.1.0"),
            host: get_env("HOST", "0.0.0.0"),
            port: get_env_int("PORT", 8080) as u16,

            database_url: get_env(
                "DATABASE_URL",
                "postgres://localhost:5432/codeverify?sslmode=disable",
            ),
            redis_url: get_env("REDIS_URL", "redis://localhost:6379"),

            token_signing_key: get_env("TOKEN_SIGNING_KEY", "system/token"),
            certificate_signing_key: get_env("CERTIFICATE_SIGNING_KEY", "system/certificate"),
            token_signing_key_id: get_env("TOKEN_SIGNING_KEY_ID", "v1"),
            certificate_signing_key_id: get_env("CERTIFICATE_SIGNING_KEY_ID", "v1"),

            db_encryption_key: get_env("DB_ENCRYPTION_KEY", "system/db-encryption"),

            db_apikey_signature_key: get_env("DB_APIKEY_SIGNATURE_KEY", ""),
            db_apikey_database_key: get_env("DB_APIKEY_DATABASE_KEY", ""),
            db_verification_code_database_key: get_env("DB_VERIFICATION_CODE_DATABASE_KEY", ""),
            db_token_database_key: get_env("DB_TOKEN_DATABASE_KEY", ""),
            cache_hmac_key: get_env("CACHE_HMAC_KEY", ""),
            rate_limit_hmac_key: get_env("RATE_LIMIT_HMAC_KEY", ""),

            allowed_symptom_age_secs: get_env_int("ALLOWED_SYMPTOM_AGE", 14 * 86400) as i64,
            verification_token_duration_secs: get_env_int("VERIFICATION_TOKEN_DURATION", 1800)
                as i64,
            certificate_duration_secs: get_env_int("CERTIFICATE_DURATION", 900) as i64,
            allowed_clock_skew_secs: get_env_int("ALLOWED_CLOCK_SKEW", 60) as i64,
            token_issuer: get_env("TOKEN_ISSUER", "diagnosis-verification-example"),
            certificate_issuer: get_env("CERTIFICATE_ISSUER", "diagnosis-verification-example"),
            certificate_audience: get_env("CERTIFICATE_AUDIENCE", "exposure-notifications-server"),

            collision_retry_count: get_env_int("COLLISION_RETRY_COUNT", 6) as u32,
            sms_fail_closed: get_env_bool("SMS_FAIL_CLOSED", false),
            issue_fingerprint_window_secs: get_env_int("ISSUE_FINGERPRINT_WINDOW", 60) as u64,
            api_key_prefix: get_env("API_KEY_PREFIX", "cv_"),

            rate_limit_burst: get_env_int("RATE_LIMIT_BURST", 60) as i64,
            rate_limit_refill: get_env_float("RATE_LIMIT_REFILL", 1.0),

            key_rotation_interval_secs: get_env_int("KEY_ROTATION_INTERVAL", 30 * 86400) as i64,
            key_rotation_tick_secs: get_env_int("KEY_ROTATION_TICK", 3600) as u64,
            sweep_interval_secs: get_env_int("SWEEP_INTERVAL", 900) as u64,
            sweep_grace_secs: get_env_int("SWEEP_GRACE", 86400) as i64,

            signer_cache_ttl_secs: get_env_int("SIGNER_CACHE_TTL", 300) as u64,
            public_key_cache_ttl_secs: get_env_int("PUBLIC_KEY_CACHE_TTL", 900) as u64,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn allowed_symptom_age_days(&self) -> i64 {
        self.allowed_symptom_age_secs / 86400
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

pub static SETTINGS: Lazy<Settings> = Lazy::new(Settings::new);

pub fn get_settings() -> &'static Settings {
    &SETTINGS
}

fn get_env(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_env_int(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_env_float(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
