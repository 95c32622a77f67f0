//! HTTP edge for the push dispatch pipeline (spec.md §6).
//!
//! Thin by design: alias mapping between the wire's dash/SIP-flavored field
//! names and the normalized request, the ACL check, and the sync-vs-async
//! return mode. Everything else is delegated to `Dispatcher`.

use crate::acl::AccessList;
use crate::dispatcher::{Dispatcher, FanoutPatch};
use crate::errors::DispatchError;
use crate::models::{DeviceRecord, Event, MediaType, NormalizedRequest, Outcome, Platform};
use crate::registry::Registry;
use arc_swap::ArcSwap;
use axum::{
    extract::{ConnectInfo, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ArcSwap<Registry>>,
    pub dispatcher: Arc<Dispatcher>,
    pub acl: Arc<AccessList>,
    pub return_async: bool,
}

impl AppState {
    pub fn new(registry: Arc<ArcSwap<Registry>>, dispatcher: Arc<Dispatcher>, acl: AccessList, return_async: bool) -> Self {
        Self { registry, dispatcher, acl: Arc::new(acl), return_async }
    }
}

fn check_acl(acl: &AccessList, addr: SocketAddr) -> Result<(), DispatchError> {
    if acl.allows(addr.ip()) {
        Ok(())
    } else {
        Err(DispatchError::AccessDenied)
    }
}

// =============================================================================
// GET /health
// =============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub bindings: usize,
}

/// Liveness probe: every process this dispatcher runs alongside ships one,
/// so it's not gated by the ACL that guards the push/token-store endpoints.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION"), bindings: state.registry.load().bindings.len() })
}

// =============================================================================
// POST /push
// =============================================================================

/// Wire shape of a single-device push request: dashed, SIP-flavored field
/// names (spec.md §6's alias table), all structurally optional so field
/// presence can be validated by hand and reported per-field (spec.md §7).
#[derive(Debug, Deserialize)]
pub struct WakeUpRequestWire {
    #[serde(rename = "app-id")]
    pub app_id: Option<String>,
    pub platform: Option<String>,
    pub event: Option<String>,
    pub token: Option<String>,
    #[serde(rename = "device-id")]
    pub device_id: Option<String>,
    #[serde(rename = "call-id")]
    pub call_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    #[serde(rename = "from-display-name")]
    pub from_display_name: Option<String>,
    #[serde(rename = "media-type")]
    pub media_type: Option<String>,
    pub silent: Option<bool>,
    pub reason: Option<String>,
    pub badge: Option<i64>,
}

fn normalize_push_request(wire: WakeUpRequestWire, registry: &Registry) -> Result<NormalizedRequest, DispatchError> {
    let app_id = wire.app_id.ok_or_else(|| DispatchError::ValidationError("Field 'app-id' required".to_string()))?;
    let platform_raw = wire.platform.ok_or_else(|| DispatchError::ValidationError("Field 'platform' required".to_string()))?;
    let platform = Platform::canonicalize(&platform_raw)
        .ok_or_else(|| DispatchError::ValidationError(format!("'{platform_raw}' platform is not configured")))?;
    let token = wire.token.ok_or_else(|| DispatchError::ValidationError("Field 'token' required".to_string()))?;
    let call_id = wire.call_id.ok_or_else(|| DispatchError::ValidationError("Field 'call-id' required".to_string()))?;
    let sip_from = wire.from.ok_or_else(|| DispatchError::ValidationError("Field 'from' required".to_string()))?;
    let sip_to = wire.to.ok_or_else(|| DispatchError::ValidationError("Field 'to' required".to_string()))?;

    let media_type = wire
        .media_type
        .map(|raw| MediaType::parse(&raw).ok_or_else(|| DispatchError::ValidationError("media-type must be 'audio', 'video', 'chat', 'sms', 'file-transfer'".to_string())))
        .transpose()?;

    // A linphone binding defaults a missing event to `incoming_session`
    // (original_source/pushserver/models/requests.py's
    // `WakeUpRequest.check_items_by_app` root validator); every other
    // family requires it explicitly.
    let family = registry.lookup(&app_id, platform).map(|b| b.family);
    let event = match wire.event {
        Some(raw) => Event::parse(&raw).ok_or_else(|| {
            DispatchError::ValidationError("event must be 'incoming_session', 'incoming_conference_request', 'cancel' or 'message'".to_string())
        })?,
        None if family == Some(crate::models::Family::Linphone) => Event::IncomingSession,
        None => return Err(DispatchError::ValidationError("Field 'event' required".to_string())),
    };

    Ok(NormalizedRequest {
        app_id,
        platform,
        event,
        token,
        device_id: wire.device_id,
        call_id,
        sip_from,
        sip_to,
        from_display_name: wire.from_display_name,
        media_type,
        silent: wire.silent.unwrap_or(true),
        reason: wire.reason,
        badge: wire.badge.unwrap_or(1),
    })
}

pub async fn push(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(wire): Json<WakeUpRequestWire>,
) -> Result<impl IntoResponse, DispatchError> {
    check_acl(&state.acl, addr)?;

    let registry = state.registry.load_full();
    let req = normalize_push_request(wire, &registry)?;
    let request_id = format!("{:?}-{}-{}", req.event, req.app_id, req.call_id);
    drop(registry);

    info!(%request_id, app_id = %req.app_id, "push request received");

    if state.return_async {
        let dispatcher = state.dispatcher.clone();
        tokio::spawn(async move {
            match dispatcher.dispatch(req).await {
                Ok(outcome) => debug!(%request_id, code = outcome.code, "async push dispatched"),
                Err(e) => debug!(%request_id, error = %e, "async push failed"),
            }
        });
        return Ok((StatusCode::ACCEPTED, Json(accepted_outcome())));
    }

    let outcome = state.dispatcher.dispatch(req).await?;
    let status = StatusCode::from_u16(outcome.code).unwrap_or(StatusCode::OK);
    Ok((status, Json(outcome)))
}

fn accepted_outcome() -> Outcome {
    Outcome { code: 202, description: "accepted for delivery".to_string(), data: serde_json::Value::Null }
}

// =============================================================================
// POST /v2/tokens/{account}
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct AddRequestWire {
    #[serde(rename = "app-id")]
    pub app_id: Option<String>,
    pub platform: Option<String>,
    pub token: Option<String>,
    #[serde(rename = "device-id")]
    pub device_id: Option<String>,
    pub silent: Option<bool>,
    #[serde(rename = "user-agent")]
    pub user_agent: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AddResponseWire {
    #[serde(rename = "app-id")]
    pub app_id: String,
    pub platform: String,
    pub token: String,
    #[serde(rename = "device-id")]
    pub device_id: String,
    pub silent: bool,
    #[serde(rename = "user-agent")]
    pub user_agent: Option<String>,
}

pub async fn add_token(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(account): Path<String>,
    Json(wire): Json<AddRequestWire>,
) -> Result<impl IntoResponse, DispatchError> {
    check_acl(&state.acl, addr)?;

    let app_id = wire.app_id.ok_or_else(|| DispatchError::ValidationError("Field 'app-id' required".to_string()))?;
    let platform_raw = wire.platform.ok_or_else(|| DispatchError::ValidationError("Field 'platform' required".to_string()))?;
    let platform = Platform::canonicalize(&platform_raw)
        .ok_or_else(|| DispatchError::ValidationError(format!("'{platform_raw}' platform is not configured")))?;
    let token = wire.token.ok_or_else(|| DispatchError::ValidationError("Field 'token' required".to_string()))?;
    let device_id = wire.device_id.ok_or_else(|| DispatchError::ValidationError("Field 'device-id' required".to_string()))?;
    let silent = wire.silent.unwrap_or(true);

    let record = DeviceRecord {
        device_id: device_id.clone(),
        app_id: app_id.clone(),
        platform: platform.as_str().to_string(),
        token: token.clone(),
        background_token: None,
        silent,
        user_agent: wire.user_agent.clone(),
    };

    state.dispatcher.store().add(&account, record).await.map_err(|e| DispatchError::StoreError(e.to_string()))?;

    info!(%account, %app_id, %device_id, "device token registered");

    Ok(Json(AddResponseWire {
        app_id,
        platform: platform.as_str().to_string(),
        token,
        device_id,
        silent,
        user_agent: wire.user_agent,
    }))
}

// =============================================================================
// DELETE /v2/tokens/{account}
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct RemoveRequestWire {
    #[serde(rename = "app-id")]
    pub app_id: Option<String>,
    #[serde(rename = "device-id")]
    pub device_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RemoveResponseWire {
    #[serde(rename = "app-id")]
    pub app_id: String,
    #[serde(rename = "device-id")]
    pub device_id: Option<String>,
}

pub async fn remove_token(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(account): Path<String>,
    Json(wire): Json<RemoveRequestWire>,
) -> Result<impl IntoResponse, DispatchError> {
    check_acl(&state.acl, addr)?;

    let app_id = wire.app_id.ok_or_else(|| DispatchError::ValidationError("Field 'app-id' required".to_string()))?;
    let store = state.dispatcher.store();

    let devices = store.get(&account).await.map_err(|e| DispatchError::StoreError(e.to_string()))?;
    if devices.is_empty() {
        return Err(DispatchError::NotFound("user not found".to_string()));
    }

    match &wire.device_id {
        Some(device_id) => {
            let key = DeviceRecord::key(&app_id, device_id);
            if !devices.contains_key(&key) {
                return Err(DispatchError::NotFound("device not found".to_string()));
            }
            store.remove_device(&account, &app_id, device_id).await.map_err(|e| DispatchError::StoreError(e.to_string()))?;
            info!(%account, %app_id, %device_id, "device token removed");
        }
        None => {
            store.remove_account(&account).await.map_err(|e| DispatchError::StoreError(e.to_string()))?;
            info!(%account, %app_id, "account tokens removed");
        }
    }

    Ok(Json(RemoveResponseWire { app_id, device_id: wire.device_id }))
}

// =============================================================================
// POST /v2/tokens/{account}/push[/{device}]
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct PushRequestWire {
    pub event: Option<String>,
    #[serde(rename = "call-id")]
    pub call_id: Option<String>,
    pub from: Option<String>,
    #[serde(rename = "from-display-name")]
    pub from_display_name: Option<String>,
    pub to: Option<String>,
    #[serde(rename = "media-type")]
    pub media_type: Option<String>,
    pub reason: Option<String>,
    pub badge: Option<i64>,
}

fn build_fanout_patch(wire: PushRequestWire) -> Result<FanoutPatch, DispatchError> {
    let event = wire
        .event
        .map(|raw| {
            Event::parse(&raw).ok_or_else(|| {
                DispatchError::ValidationError("event must be 'incoming_session', 'incoming_conference_request', 'cancel' or 'message'".to_string())
            })
        })
        .transpose()?;
    let media_type = wire
        .media_type
        .map(|raw| MediaType::parse(&raw).ok_or_else(|| DispatchError::ValidationError("media-type must be 'audio', 'video', 'chat', 'sms', 'file-transfer'".to_string())))
        .transpose()?;

    Ok(FanoutPatch {
        event,
        call_id: wire.call_id.ok_or_else(|| DispatchError::ValidationError("Field 'call-id' required".to_string()))?,
        sip_from: wire.from.ok_or_else(|| DispatchError::ValidationError("Field 'from' required".to_string()))?,
        sip_to: wire.to.ok_or_else(|| DispatchError::ValidationError("Field 'to' required".to_string()))?,
        from_display_name: wire.from_display_name,
        media_type,
        reason: wire.reason,
        badge: wire.badge.unwrap_or(1),
    })
}

async fn fanout_push(
    state: AppState,
    addr: SocketAddr,
    account: String,
    device: Option<String>,
    wire: PushRequestWire,
) -> Result<impl IntoResponse, DispatchError> {
    check_acl(&state.acl, addr)?;

    let patch = build_fanout_patch(wire)?;
    let request_id = format!("{:?}-{}-{}", patch.event, account, patch.call_id);

    info!(%request_id, %account, "fanout push request received");

    if state.return_async {
        let dispatcher = state.dispatcher.clone();
        tokio::spawn(async move {
            match dispatcher.fanout(&account, &patch, device.as_deref()).await {
                Ok(outcomes) => debug!(%request_id, count = outcomes.len(), "async fanout dispatched"),
                Err(e) => debug!(%request_id, error = %e, "async fanout failed"),
            }
        });
        return Ok((StatusCode::ACCEPTED, Json(accepted_outcome())));
    }

    let outcomes = state.dispatcher.fanout(&account, &patch, device.as_deref()).await?;
    Ok((StatusCode::OK, Json(aggregate_outcomes(outcomes))))
}

fn aggregate_outcomes(outcomes: Vec<Outcome>) -> Outcome {
    let code = outcomes.last().map(|o| o.code).unwrap_or(200);
    let data = serde_json::Value::Array(outcomes.into_iter().map(|o| o.data).collect());
    Outcome { code, description: "push notification responses".to_string(), data }
}

pub async fn fanout_push_account(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(account): Path<String>,
    Json(wire): Json<PushRequestWire>,
) -> Result<impl IntoResponse, DispatchError> {
    fanout_push(state, addr, account, None, wire).await
}

pub async fn fanout_push_device(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((account, device)): Path<(String, String)>,
    Json(wire): Json<PushRequestWire>,
) -> Result<impl IntoResponse, DispatchError> {
    fanout_push(state, addr, account, Some(device), wire).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Family;

    fn empty_registry() -> Registry {
        Registry {
            bindings: Default::default(),
            apns_clients: Default::default(),
            fcm_clients: Default::default(),
            invalid: Vec::new(),
        }
    }

    fn base_wire() -> WakeUpRequestWire {
        WakeUpRequestWire {
            app_id: Some("com.example.app".to_string()),
            platform: Some("ios".to_string()),
            event: Some("incoming_session".to_string()),
            token: Some("AABB".to_string()),
            device_id: None,
            call_id: Some("call-1".to_string()),
            from: Some("sip:a@b".to_string()),
            to: Some("sip:c@d".to_string()),
            from_display_name: None,
            media_type: Some("audio".to_string()),
            silent: None,
            reason: None,
            badge: None,
        }
    }

    #[test]
    fn missing_app_id_is_a_field_specific_validation_error() {
        let mut wire = base_wire();
        wire.app_id = None;
        let err = normalize_push_request(wire, &empty_registry()).unwrap_err();
        assert!(matches!(err, DispatchError::ValidationError(msg) if msg == "Field 'app-id' required"));
    }

    #[test]
    fn platform_alias_canonicalizes() {
        let req = normalize_push_request(base_wire(), &empty_registry()).unwrap();
        assert_eq!(req.platform, Platform::Apple);
    }

    #[test]
    fn missing_event_is_required_when_family_unknown() {
        let mut wire = base_wire();
        wire.event = None;
        let err = normalize_push_request(wire, &empty_registry()).unwrap_err();
        assert!(matches!(err, DispatchError::ValidationError(msg) if msg == "Field 'event' required"));
    }

    #[test]
    fn missing_event_defaults_to_incoming_session_for_linphone() {
        let mut registry = empty_registry();
        registry.bindings.insert(
            ("com.example.app".to_string(), Platform::Apple),
            crate::models::Binding {
                app_id: "com.example.app".to_string(),
                platform: Platform::Apple,
                family: Family::Linphone,
                voip: true,
                credentials: crate::models::VendorCredentials::Apns {
                    cert_file: "c".into(),
                    key_file: None,
                    push_url: "api.push.apple.com".into(),
                },
                log_remote: None,
            },
        );
        let mut wire = base_wire();
        wire.event = None;
        let req = normalize_push_request(wire, &registry).unwrap();
        assert_eq!(req.event, Event::IncomingSession);
    }
}
