//! Data model for the push dispatch pipeline.
//!
//! Everything here is transport-agnostic: normalized requests, rendered
//! messages, and vendor results pass between the dispatcher, the renderers,
//! and the vendor clients without any axum/reqwest types leaking through.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// =============================================================================
// Application binding
// =============================================================================

/// Vendor platform a binding talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Apple,
    Firebase,
}

impl Platform {
    /// Canonicalize `{ios,apple}` -> apple, `{android,firebase,fcm}` -> firebase.
    pub fn canonicalize(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "apple" | "ios" => Some(Self::Apple),
            "firebase" | "android" | "fcm" => Some(Self::Firebase),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Apple => "apple",
            Self::Firebase => "firebase",
        }
    }
}

/// Renderer key selecting which `(family, platform)` payload rules apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Sylk,
    Linphone,
}

impl Family {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "sylk" => Some(Self::Sylk),
            "linphone" => Some(Self::Linphone),
            _ => None,
        }
    }
}

/// Credentials for one vendor binding, resolved against the credentials dir.
#[derive(Debug, Clone)]
pub enum VendorCredentials {
    Apns {
        cert_file: String,
        key_file: Option<String>,
        push_url: String,
    },
    FcmLegacy {
        auth_key: String,
        push_url: String,
    },
    FcmOAuth2 {
        service_account_file: String,
        push_url: String,
    },
}

/// Optional remote audit log targets configured per application section.
#[derive(Debug, Clone, Default)]
pub struct LogRemote {
    pub urls: Vec<String>,
    pub key: Option<String>,
    pub timeout_s: Option<u64>,
}

/// A resolved `(app_id, platform)` entry in the registry. Immutable after
/// load; reload replaces the whole table rather than mutating a binding.
#[derive(Debug, Clone)]
pub struct Binding {
    pub app_id: String,
    pub platform: Platform,
    pub family: Family,
    pub voip: bool,
    pub credentials: VendorCredentials,
    pub log_remote: Option<LogRemote>,
}

/// Why a section in the application table failed to become a binding.
#[derive(Debug, Clone)]
pub struct InvalidBinding {
    pub app_id: String,
    pub platform_raw: String,
    pub reason: String,
}

// =============================================================================
// Normalized push request
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    IncomingSession,
    IncomingConferenceRequest,
    Cancel,
    Message,
}

impl Event {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "incoming_session" => Some(Self::IncomingSession),
            "incoming_conference_request" => Some(Self::IncomingConferenceRequest),
            "cancel" => Some(Self::Cancel),
            "message" => Some(Self::Message),
            _ => None,
        }
    }

    pub const fn is_voip(self) -> bool {
        matches!(self, Self::IncomingSession | Self::IncomingConferenceRequest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaType {
    Audio,
    Video,
    Chat,
    Sms,
    FileTransfer,
}

impl MediaType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            "chat" => Some(Self::Chat),
            "sms" => Some(Self::Sms),
            "file-transfer" => Some(Self::FileTransfer),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Chat => "chat",
            Self::Sms => "sms",
            Self::FileTransfer => "file-transfer",
        }
    }
}

/// A push request after platform-name canonicalization and alias-stripping.
/// This is the shape the dispatcher and renderers operate on; the wire
/// (dashed, SIP-flavored) shape lives only in `handlers.rs`.
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    pub app_id: String,
    pub platform: Platform,
    pub event: Event,
    pub token: String,
    pub device_id: Option<String>,
    pub call_id: String,
    pub sip_from: String,
    pub sip_to: String,
    pub from_display_name: Option<String>,
    pub media_type: Option<MediaType>,
    pub silent: bool,
    pub reason: Option<String>,
    pub badge: i64,
}

// =============================================================================
// Rendered message
// =============================================================================

/// Opaque to the retry engine: headers + a JSON payload body.
#[derive(Debug, Clone)]
pub struct RenderedMessage {
    pub headers: HashMap<String, String>,
    pub payload: serde_json::Value,
}

// =============================================================================
// Device record (token store)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub app_id: String,
    pub platform: String,
    pub token: String,
    pub background_token: Option<String>,
    #[serde(default = "default_true")]
    pub silent: bool,
    pub user_agent: Option<String>,
}

fn default_true() -> bool {
    true
}

impl DeviceRecord {
    /// Key inside an account's device map: `"{app_id}-{device_id}"`.
    pub fn key(app_id: &str, device_id: &str) -> String {
        format!("{app_id}-{device_id}")
    }

    /// Split a raw token on the token store's delimiter into
    /// `(token, background_token)`. Resolved as `#` (see DESIGN.md).
    pub fn split_token(raw: &str) -> (String, Option<String>) {
        match raw.split_once('#') {
            Some((token, background)) => (token.to_string(), Some(background.to_string())),
            None => (raw.to_string(), None),
        }
    }
}

// =============================================================================
// Vendor result / dispatch outcome
// =============================================================================

/// Result of one vendor `send` attempt (the last attempt, if retried).
#[derive(Debug, Clone, Serialize)]
pub struct VendorResult {
    pub code: u16,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    pub url: String,
    #[serde(skip)]
    pub retriable: bool,
    #[serde(skip)]
    pub expired: bool,
}

/// What the edge returns, aggregating one or many vendor results.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub code: u16,
    pub description: String,
    pub data: serde_json::Value,
}

impl Outcome {
    pub fn from_vendor_result(r: &VendorResult) -> Self {
        Self {
            code: r.code,
            description: r.reason.clone(),
            data: serde_json::json!({
                "body": r.body,
                "code": r.code,
                "reason": r.reason,
                "url": r.url,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_canonicalizes_aliases() {
        assert_eq!(Platform::canonicalize("ios"), Some(Platform::Apple));
        assert_eq!(Platform::canonicalize("IOS"), Some(Platform::Apple));
        assert_eq!(Platform::canonicalize("android"), Some(Platform::Firebase));
        assert_eq!(Platform::canonicalize("fcm"), Some(Platform::Firebase));
        assert_eq!(Platform::canonicalize("windows"), None);
    }

    #[test]
    fn event_voip_classification() {
        assert!(Event::IncomingSession.is_voip());
        assert!(Event::IncomingConferenceRequest.is_voip());
        assert!(!Event::Cancel.is_voip());
        assert!(!Event::Message.is_voip());
    }

    #[test]
    fn device_record_key_and_token_split() {
        assert_eq!(DeviceRecord::key("com.example.app", "dev1"), "com.example.app-dev1");

        let (token, bg) = DeviceRecord::split_token("aabbcc#ddeeff");
        assert_eq!(token, "aabbcc");
        assert_eq!(bg.as_deref(), Some("ddeeff"));

        let (token, bg) = DeviceRecord::split_token("aabbcc");
        assert_eq!(token, "aabbcc");
        assert_eq!(bg, None);
    }
}
