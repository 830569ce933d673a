use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use serde_json::{Map, Value, json};
use sha1::Sha1;
use sha2::Sha256;

use super::TriggerConfig;
use crate::core::errors::{OrchestratorError, Result};

const DEFAULT_SHA256_HEADERS: [&str; 2] = ["x-hub-signature-256", "x-webhook-signature"];
const DEFAULT_SHA1_HEADERS: [&str; 2] = ["x-hub-signature", "x-webhook-signature"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAuth {
    None,
    ApiKey,
    Bearer,
    HmacSha256,
    HmacSha1,
}

impl WebhookAuth {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" | "none" => Some(WebhookAuth::None),
            "api_key" => Some(WebhookAuth::ApiKey),
            "bearer" => Some(WebhookAuth::Bearer),
            "hmac_sha256" => Some(WebhookAuth::HmacSha256),
            "hmac_sha1" => Some(WebhookAuth::HmacSha1),
            _ => None,
        }
    }

    fn of(config: &TriggerConfig) -> Result<Self> {
        let raw = config.config_str("auth_type").unwrap_or("none");
        Self::parse(raw).ok_or_else(|| {
            OrchestratorError::Configuration(format!("unknown webhook auth_type '{}'", raw))
        })
    }
}

fn secret(config: &TriggerConfig, auth: WebhookAuth) -> Result<&str> {
    let alias = match auth {
        WebhookAuth::ApiKey => "api_key",
        WebhookAuth::Bearer => "token",
        _ => "secret",
    };
    config
        .config_str("secret")
        .or_else(|| config.config_str(alias))
        .ok_or_else(|| {
            OrchestratorError::Configuration(format!(
                "webhook trigger '{}' requires a secret for auth_type {:?}",
                config.id, auth
            ))
        })
}

pub fn validate_config(config: &TriggerConfig) -> Result<()> {
    let auth = WebhookAuth::of(config)?;
    if auth != WebhookAuth::None {
        secret(config, auth)?;
    }
    Ok(())
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Checks an inbound webhook against the trigger's auth settings.
///
/// HMAC signatures are computed over `raw_body` exactly as received.
pub fn verify_webhook_auth(
    config: &TriggerConfig,
    headers: &HeaderMap,
    raw_body: &[u8],
) -> Result<()> {
    let auth = WebhookAuth::of(config)?;
    let denied = |why: &str| -> Result<()> {
        Err(OrchestratorError::Authentication(why.to_string()))
    };

    match auth {
        WebhookAuth::None => Ok(()),
        WebhookAuth::ApiKey => {
            let expected = secret(config, auth)?;
            let provided = header(headers, "x-api-key").or_else(|| header(headers, "x-webhook-secret"));
            match provided {
                Some(key) if constant_time_eq(key.as_bytes(), expected.as_bytes()) => Ok(()),
                Some(_) => denied("invalid API key"),
                None => denied("missing X-API-Key header"),
            }
        }
        WebhookAuth::Bearer => {
            let expected = secret(config, auth)?;
            match header(headers, "authorization").and_then(|v| v.strip_prefix("Bearer ")) {
                Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(()),
                Some(_) => denied("invalid bearer token"),
                None => denied("missing bearer token"),
            }
        }
        WebhookAuth::HmacSha256 | WebhookAuth::HmacSha1 => {
            let key = secret(config, auth)?;
            let (prefix, defaults) = if auth == WebhookAuth::HmacSha256 {
                ("sha256=", DEFAULT_SHA256_HEADERS)
            } else {
                ("sha1=", DEFAULT_SHA1_HEADERS)
            };
            let provided = match config.config_str("signature_header") {
                Some(name) => header(headers, &name.to_ascii_lowercase()),
                None => defaults.iter().find_map(|name| header(headers, name)),
            };
            let Some(provided) = provided else {
                return denied("missing signature header");
            };
            let provided = provided.trim();
            let provided = provided.strip_prefix(prefix).unwrap_or(provided);
            let expected = if auth == WebhookAuth::HmacSha256 {
                hmac_sha256_hex(key.as_bytes(), raw_body)
            } else {
                hmac_sha1_hex(key.as_bytes(), raw_body)
            };
            if constant_time_eq(provided.to_ascii_lowercase().as_bytes(), expected.as_bytes()) {
                Ok(())
            } else {
                denied("signature mismatch")
            }
        }
    }
}

pub fn hmac_sha256_hex(key: &[u8], body: &[u8]) -> String {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = match Hmac::<Sha256>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub fn hmac_sha1_hex(key: &[u8], body: &[u8]) -> String {
    let mut mac = match Hmac::<Sha1>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison to prevent timing attacks.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() || a.is_empty() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Job input and metadata for a verified request body.
pub fn event_from_request(
    headers: &HeaderMap,
    raw_body: &[u8],
) -> (Map<String, Value>, Map<String, Value>) {
    let payload = match serde_json::from_slice::<Value>(raw_body) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
        Err(_) if raw_body.is_empty() => Map::new(),
        Err(_) => {
            let mut map = Map::new();
            map.insert(
                "body".to_string(),
                Value::String(String::from_utf8_lossy(raw_body).into_owned()),
            );
            map
        }
    };

    let mut metadata = Map::new();
    metadata.insert("source".to_string(), json!("webhook"));
    metadata.insert("body_bytes".to_string(), json!(raw_body.len()));
    if let Some(ct) = header(headers, "content-type") {
        metadata.insert("content_type".to_string(), json!(ct));
    }
    if let Some(ua) = header(headers, "user-agent") {
        metadata.insert("user_agent".to_string(), json!(ua));
    }
    (payload, metadata)
}

