use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::models::Realm;
use crate::store::codes::IssuedCode;

#[derive(Debug, Error)]
pub enum SmsError {
    #[error("sms delivery failed: {0}")]
    Delivery(String),
}

/// Outbound SMS capability. The service only enqueues; delivery itself is
/// an external collaborator.
#[async_trait]
pub trait Sms: Send + Sync {
    async fn enqueue(&self, to: &str, message: &str) -> Result<(), SmsError>;
}

/// Default backend when no provider is configured: drop the message.
pub struct NoopSms;

#[async_trait]
impl Sms for NoopSms {
    async fn enqueue(&self, _to: &str, message: &str) -> Result<(), SmsError> {
        debug!(length = message.len(), "sms provider not configured, dropping message");
        Ok(())
    }
}

/// Test backend that records enqueued messages.
#[derive(Default)]
pub struct MemorySms {
    sent: Mutex<Vec<(String, String)>>,
    fail: Mutex<bool>,
}

impl MemorySms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock() = fail;
    }
}

#[async_trait]
impl Sms for MemorySms {
    async fn enqueue(&self, to: &str, message: &str) -> Result<(), SmsError> {
        if *self.fail.lock() {
            return Err(SmsError::Delivery("injected failure".to_string()));
        }
        self.sent.lock().push((to.to_string(), message.to_string()));
        Ok(())
    }
}

/// Render the realm's SMS template for an issued code.
///
/// Placeholders: `[code]`, `[longcode]`, `[expires]` (minutes),
/// `[longexpires]` (hours), `[longlink]`. The long link carries the long
/// code and, for authenticated SMS, the nonce the device must echo.
pub fn render(realm: &Realm, template: &str, issued: &IssuedCode) -> String {
    let expires_min = realm.code_duration_secs / 60;
    let long_expires_h = realm.long_code_duration_secs / 3600;

    let region = if realm.region_code.is_empty() {
        "us".to_string()
    } else {
        realm.region_code.to_lowercase()
    };
    let mut link = format!(
        "https://{}.verification.example.com/v?c={}",
        region, issued.long_code
    );
    if let Some(nonce) = &issued.nonce {
        link.push_str("&n=");
        link.push_str(&URL_SAFE_NO_PAD.encode(nonce));
    }

    template
        .replace("[code]", &issued.code)
        .replace("[longcode]", &issued.long_code)
        .replace("[expires]", &expires_min.to_string())
        .replace("[longexpires]", &long_expires_h.to_string())
        .replace("[longlink]", &link)
}

static SMS: OnceCell<Box<dyn Sms>> = OnceCell::new();

pub fn init_sms() -> Result<()> {
    init_sms_with(Box::new(NoopSms))
}

pub fn init_sms_with(backend: Box<dyn Sms>) -> Result<()> {
    if SMS.get().is_some() {
        return Ok(());
    }
    SMS.set(backend).ok();
    info!("SMS adapter initialized");
    Ok(())
}

pub fn get_sms() -> &'static dyn Sms {
    SMS.get().expect("SMS adapter not initialized").as_ref()
}
