//! Renderers: pure `(family, platform)` functions from a normalized request
//! to `(headers, payload)`.
//!
//! Per REDESIGN FLAGS, lookup is a static registration table keyed by
//! `(Family, Platform)` rather than the original's `importlib`-based
//! `"{Vendor}{Family}Headers"`/`"Payload"` class-name convention.

use crate::models::{Event, Family, MediaType, NormalizedRequest, Platform, RenderedMessage, VendorCredentials};
use crate::util::{session_id, strip_env_suffix};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;

pub type RenderFn = fn(&NormalizedRequest, &VendorCredentials) -> RenderedMessage;

/// Static table of the four `(family, platform)` renderer pairs this crate
/// ships with. Extending it is a match arm, not a string-keyed lookup.
pub struct RendererRegistry;

impl RendererRegistry {
    pub fn lookup(family: Family, platform: Platform) -> Option<RenderFn> {
        match (family, platform) {
            (Family::Sylk, Platform::Apple) => Some(apns_sylk),
            (Family::Linphone, Platform::Apple) => Some(apns_linphone),
            (Family::Sylk, Platform::Firebase) => Some(fcm_sylk),
            (Family::Linphone, Platform::Firebase) => Some(fcm_linphone),
        }
    }
}

fn h(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

// =============================================================================
// APNs, family=sylk
// =============================================================================

fn apns_sylk(req: &NormalizedRequest, _creds: &VendorCredentials) -> RenderedMessage {
    let push_type = match req.event {
        Event::IncomingSession | Event::IncomingConferenceRequest => "voip",
        Event::Cancel => "background",
        Event::Message => "alert",
    };
    let mut topic = strip_env_suffix(&req.app_id);
    if req.event.is_voip() {
        topic = format!("{topic}.voip");
    }
    let priority = if req.event.is_voip() { "10" } else { "5" };

    let mut headers = h(&[
        ("apns-push-type", push_type),
        ("apns-topic", &topic),
        ("apns-priority", priority),
        ("apns-expiration", "120"),
    ]);
    if push_type == "background" {
        headers.insert("content-available".into(), "1".into());
    }

    let payload = match req.event {
        Event::Cancel => json!({
            "event": "cancel",
            "call-id": req.call_id,
            "session-id": session_id(&req.call_id),
            "reason": req.reason,
        }),
        Event::Message => json!({
            "aps": {
                "alert": {
                    "title": "New message",
                    "body": format!("From {}", req.sip_from),
                },
                "message_id": req.call_id,
                "sound": "default",
                "badge": req.badge,
            }
        }),
        _ => json!({
            "event": event_name(req.event),
            "call-id": req.call_id,
            "session-id": session_id(&req.call_id),
            "media-type": req.media_type.map(MediaType::as_str),
            "from_uri": req.sip_from,
            "from_display_name": req.from_display_name,
            "to_uri": req.sip_to,
        }),
    };

    RenderedMessage { headers, payload }
}

fn event_name(event: Event) -> &'static str {
    match event {
        Event::IncomingSession => "incoming_session",
        Event::IncomingConferenceRequest => "incoming_conference_request",
        Event::Cancel => "cancel",
        Event::Message => "message",
    }
}

// =============================================================================
// APNs, family=linphone
// =============================================================================

fn apns_linphone(req: &NormalizedRequest, _creds: &VendorCredentials) -> RenderedMessage {
    let mut topic = strip_env_suffix(&req.app_id);
    if !topic.contains(".voip") {
        topic = format!("{topic}.voip");
    }

    let headers = h(&[
        ("apns-push-type", "voip"),
        ("apns-topic", &topic),
        ("apns-priority", "10"),
        ("apns-expiration", "10"),
    ]);

    let send_time = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();

    let payload = if req.silent {
        json!({
            "aps": {
                "sound": "",
                "loc-key": "IC_SIL",
                "call-id": req.call_id,
                "send-time": send_time,
            },
            "from-uri": req.sip_from,
            "pn_ttl": 2_592_000,
        })
    } else {
        json!({
            "aps": {
                "alert": {
                    "loc-key": "IC_MSG",
                    "loc-args": req.sip_from,
                },
                "sound": "msg.caf",
                "badge": 1,
            },
            "pn_ttl": 2_592_000,
            "call-id": req.call_id,
            "send-time": send_time,
        })
    };

    RenderedMessage { headers, payload }
}

// =============================================================================
// FCM, family=sylk
// =============================================================================

fn fcm_sylk(req: &NormalizedRequest, _creds: &VendorCredentials) -> RenderedMessage {
    let from_display_name = req.from_display_name.clone().unwrap_or_else(|| req.sip_from.clone());

    let data = match req.event {
        Event::Cancel => json!({
            "event": "cancel",
            "call-id": req.call_id,
            "session-id": session_id(&req.call_id),
            "reason": req.reason,
        }),
        Event::Message => json!({
            "event": "message",
            "from_uri": req.sip_from,
            "to_uri": req.sip_to,
        }),
        _ => json!({
            "event": event_name(req.event),
            "call-id": req.call_id,
            "session-id": session_id(&req.call_id),
            "media-type": req.media_type.map(MediaType::as_str),
            "from_uri": req.sip_from,
            "from_display_name": from_display_name,
            "to_uri": req.sip_to,
        }),
    };

    let payload = if req.event == Event::Message {
        json!({
            "message": {
                "token": req.token,
                "data": data,
                "notification": {
                    "title": "New message",
                    "body": format!("From {}", req.sip_from),
                },
                "apns": { "headers": { "apns-priority": "5" } },
                "android": {
                    "priority": "high",
                    "ttl": "60s",
                    "notification": {
                        "channel_id": "sylk-messages-sound",
                        "sound": "default",
                        "default_sound": true,
                        "notification_priority": "PRIORITY_HIGH",
                    }
                }
            }
        })
    } else {
        json!({
            "message": {
                "token": req.token,
                "data": data,
                "android": { "priority": "high", "ttl": "60s" }
            }
        })
    };

    RenderedMessage {
        headers: HashMap::new(),
        payload,
    }
}

// =============================================================================
// FCM, family=linphone
// =============================================================================

fn fcm_linphone(req: &NormalizedRequest, _creds: &VendorCredentials) -> RenderedMessage {
    let send_time = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();

    let payload = json!({
        "to": req.token,
        "time_to_live": 2_419_199,
        "priority": "high",
        "data": {
            "call-id": req.call_id,
            "sip-from": req.sip_from,
            "loc-key": "",
            "loc-args": req.sip_from,
            "send-time": send_time,
        }
    });

    RenderedMessage {
        headers: HashMap::new(),
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Event as Ev, MediaType as Mt};

    fn base_request() -> NormalizedRequest {
        NormalizedRequest {
            app_id: "com.example.app.dev".into(),
            platform: Platform::Apple,
            event: Ev::IncomingSession,
            token: "AABB".into(),
            device_id: Some("dev1".into()),
            call_id: "call-42".into(),
            sip_from: "sip:a@b".into(),
            sip_to: "sip:c@d".into(),
            from_display_name: Some("Alice".into()),
            media_type: Some(Mt::Audio),
            silent: false,
            reason: None,
            badge: 1,
        }
    }

    #[test]
    fn apns_sylk_incoming_session_headers_and_session_id() {
        let creds = VendorCredentials::Apns {
            cert_file: "c".into(),
            key_file: None,
            push_url: "api.push.apple.com".into(),
        };
        let rendered = apns_sylk(&base_request(), &creds);
        assert_eq!(rendered.headers.get("apns-push-type").unwrap(), "voip");
        assert_eq!(rendered.headers.get("apns-priority").unwrap(), "10");
        assert_eq!(rendered.headers.get("apns-topic").unwrap(), "com.example.app.voip");
        assert_eq!(
            rendered.payload["session-id"],
            json!(session_id("call-42"))
        );
    }

    #[test]
    fn fcm_linphone_default_event_payload_shape() {
        let creds = VendorCredentials::FcmLegacy {
            auth_key: "k".into(),
            push_url: "https://fcm.googleapis.com/fcm/send".into(),
        };
        let mut req = base_request();
        req.platform = Platform::Firebase;
        req.token = "tok123".into();
        let rendered = fcm_linphone(&req, &creds);
        assert_eq!(rendered.payload["to"], json!("tok123"));
        assert_eq!(rendered.payload["time_to_live"], json!(2_419_199));
        assert_eq!(rendered.payload["priority"], json!("high"));
        assert_eq!(rendered.payload["data"]["call-id"], json!("call-42"));
        // Authorization/Content-Type are FcmClient's responsibility, not the
        // renderer's, so a one-shot OAuth2 401 refresh can regenerate them.
        assert!(rendered.headers.is_empty());
    }

    #[test]
    fn apns_sylk_cancel_payload_is_bare_not_aps_wrapped() {
        let mut req = base_request();
        req.event = Ev::Cancel;
        req.reason = Some("busy".into());
        let creds = VendorCredentials::Apns {
            cert_file: "c".into(),
            key_file: None,
            push_url: "api.push.apple.com".into(),
        };
        let rendered = apns_sylk(&req, &creds);
        assert_eq!(rendered.payload["event"], json!("cancel"));
        assert_eq!(rendered.payload["reason"], json!("busy"));
        assert!(rendered.payload.get("aps").is_none());
    }
}
