//! Dispatcher: validates/normalizes incoming requests, resolves the
//! registry entry, renders the vendor message, drives the retry engine, and
//! (on the fanout path) prunes expired tokens. spec.md §4.4.

use crate::errors::DispatchError;
use crate::models::{
    DeviceRecord, Event, Family, MediaType, NormalizedRequest, Outcome, Platform, VendorResult,
};
use crate::registry::Registry;
use crate::renderers::RendererRegistry;
use crate::retry::{self, RetryPolicy};
use crate::store::TokenStore;
use arc_swap::ArcSwap;
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct Dispatcher {
    registry: Arc<ArcSwap<Registry>>,
    store: Arc<dyn TokenStore>,
}

/// Caller-specified overrides applied on top of a stored device record
/// during fanout (spec.md §4.4 step 2). `app_id`/`platform`/`silent`/
/// `device_id`/`token` always come from the device record; these fields win
/// from the caller's request body.
#[derive(Debug, Clone, Default)]
pub struct FanoutPatch {
    pub event: Option<Event>,
    pub call_id: String,
    pub sip_from: String,
    pub sip_to: String,
    pub from_display_name: Option<String>,
    pub media_type: Option<MediaType>,
    pub reason: Option<String>,
    pub badge: i64,
}

impl Dispatcher {
    pub fn new(registry: Arc<ArcSwap<Registry>>, store: Arc<dyn TokenStore>) -> Self {
        Self { registry, store }
    }

    /// Exposes the token store for the edge layer's `/v2/tokens` handlers,
    /// which mutate it directly rather than through the dispatch pipeline.
    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    /// `dispatch(req) -> Outcome`, the single-device path (spec.md §4.4).
    pub async fn dispatch(&self, req: NormalizedRequest) -> Result<Outcome, DispatchError> {
        let registry = self.registry.load_full();

        let binding = registry.lookup(&req.app_id, req.platform).ok_or_else(|| DispatchError::NotConfigured {
            app_id: req.app_id.clone(),
            platform: req.platform.as_str().to_string(),
        })?;

        validate_family_requirements(&req, binding.family)?;

        let render = RendererRegistry::lookup(binding.family, binding.platform)
            .ok_or_else(|| DispatchError::RendererError(format!("no renderer registered for {:?}/{:?}", binding.family, binding.platform)))?;
        let message = render(&req, &binding.credentials);

        let policy = RetryPolicy::for_media_type(req.media_type);
        let cancel = CancellationToken::new();

        let attempt = match req.platform {
            Platform::Apple => {
                let client = registry.apns_client(&req.app_id, req.platform).ok_or_else(|| {
                    DispatchError::NotConfigured { app_id: req.app_id.clone(), platform: req.platform.as_str().to_string() }
                })?;
                let token = req.token.clone();
                retry::drive(policy, &cancel, |_attempt_no| {
                    let client = client.clone();
                    let message = message.clone();
                    let token = token.clone();
                    async move { client.send(&token, &message).await }
                })
                .await
            }
            Platform::Firebase => {
                let client = registry.fcm_client(&req.app_id, req.platform).ok_or_else(|| {
                    DispatchError::NotConfigured { app_id: req.app_id.clone(), platform: req.platform.as_str().to_string() }
                })?;
                retry::drive(policy, &cancel, |_attempt_no| {
                    let client = client.clone();
                    let message = message.clone();
                    async move { client.send(&message).await }
                })
                .await
            }
        };

        let expired = attempt.code == 410;
        let vendor_result =
            VendorResult { code: attempt.code, reason: attempt.reason, body: attempt.body, url: attempt.url, retriable: false, expired };

        if vendor_result.expired {
            info!(app_id = %req.app_id, device_id = ?req.device_id, "token-expired");
        }

        Ok(Outcome::from_vendor_result(&vendor_result))
    }

    /// `fanout(account, req') -> Outcome[]`, the account path (spec.md §4.4).
    pub async fn fanout(&self, account: &str, patch: &FanoutPatch, device_filter: Option<&str>) -> Result<Vec<Outcome>, DispatchError> {
        let devices = self.store.get(account).await.map_err(|e| DispatchError::StoreError(e.to_string()))?;

        if devices.is_empty() {
            let _ = self.store.remove_account(account).await;
            return Err(DispatchError::NotFound("user not found".to_string()));
        }

        let mut normalized = Vec::new();
        for record in devices.values() {
            if let Some(filter) = device_filter {
                if filter != record.device_id {
                    continue;
                }
            }
            normalized.push((record.clone(), merge_fanout_request(record, patch)?));
        }

        if normalized.is_empty() {
            return Err(DispatchError::NotFound("device not found".to_string()));
        }

        let dispatches = normalized.iter().map(|(_, req)| self.dispatch(req.clone()));
        let results = join_all(dispatches).await;

        let mut outcomes = Vec::with_capacity(results.len());
        let mut expired = Vec::new();
        for ((record, _), result) in normalized.into_iter().zip(results) {
            let mut outcome = result?;
            if outcome.code == 410 {
                expired.push((record.app_id.clone(), record.device_id.clone()));
                outcome.code = 200;
            }
            outcomes.push(outcome);
        }

        for (app_id, device_id) in expired {
            let _ = self.store.remove_device(account, &app_id, &device_id).await;
        }

        Ok(outcomes)
    }
}

/// Merge a stored device record with the caller's fanout request body.
/// Device-specific fields (`platform`, `token`, `silent`, `app_id`,
/// `device_id`) win; caller-specified fields win for everything else
/// (spec.md §4.4 step 2). Background-token substitution applies to
/// `{cancel, message}` per the Open Questions resolution (SPEC_FULL.md §9).
fn merge_fanout_request(record: &DeviceRecord, patch: &FanoutPatch) -> Result<NormalizedRequest, DispatchError> {
    let platform = Platform::canonicalize(&record.platform)
        .ok_or_else(|| DispatchError::ValidationError(format!("device record has unknown platform '{}'", record.platform)))?;

    let event = patch.event.ok_or_else(|| DispatchError::ValidationError("Field 'event' required".to_string()))?;

    let mut token = record.token.clone();
    if matches!(event, Event::Cancel | Event::Message) {
        if let Some(background) = &record.background_token {
            token = background.clone();
        }
    }

    if patch.call_id.is_empty() {
        return Err(DispatchError::ValidationError("Field 'call-id' required".to_string()));
    }
    if patch.sip_from.is_empty() {
        return Err(DispatchError::ValidationError("Field 'from' required".to_string()));
    }
    if patch.sip_to.is_empty() {
        return Err(DispatchError::ValidationError("Field 'to' required".to_string()));
    }
    if event != Event::Cancel && patch.media_type.is_none() {
        return Err(DispatchError::ValidationError("Field 'media-type' required".to_string()));
    }

    Ok(NormalizedRequest {
        app_id: record.app_id.clone(),
        platform,
        event,
        token,
        device_id: Some(record.device_id.clone()),
        call_id: patch.call_id.clone(),
        sip_from: patch.sip_from.clone(),
        sip_to: patch.sip_to.clone(),
        from_display_name: patch.from_display_name.clone(),
        media_type: patch.media_type,
        silent: record.silent,
        reason: patch.reason.clone(),
        badge: patch.badge,
    })
}

/// Family-specific required-field checks that can only run once the
/// registry has resolved which family applies (spec.md §4.4 step 1,
/// grounded on `pushserver/models/requests.py::WakeUpRequest`'s
/// root validator). Structural presence of the common fields
/// (`app_id`/`platform`/`token`/`call_id`/`sip_from`/`sip_to`) is enforced
/// earlier, at request normalization in the edge layer.
fn validate_family_requirements(req: &NormalizedRequest, family: Family) -> Result<(), DispatchError> {
    if req.event != Event::Cancel && req.media_type.is_none() {
        return Err(DispatchError::ValidationError("Field 'media-type' required".to_string()));
    }
    if family == Family::Linphone && req.event != Event::IncomingSession {
        return Err(DispatchError::ValidationError("event not found (must be incoming_session)".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(app_id: &str, device_id: &str, token: &str, background: Option<&str>) -> DeviceRecord {
        DeviceRecord {
            device_id: device_id.to_string(),
            app_id: app_id.to_string(),
            platform: "apple".to_string(),
            token: token.to_string(),
            background_token: background.map(str::to_string),
            silent: true,
            user_agent: None,
        }
    }

    fn patch(event: Event) -> FanoutPatch {
        FanoutPatch {
            event: Some(event),
            call_id: "call-1".to_string(),
            sip_from: "sip:a@b".to_string(),
            sip_to: "sip:c@d".to_string(),
            from_display_name: None,
            media_type: Some(MediaType::Audio),
            reason: None,
            badge: 1,
        }
    }

    #[test]
    fn background_token_substitutes_for_cancel_and_message() {
        let rec = record("app1", "dev1", "primary", Some("background"));

        let cancel = merge_fanout_request(&rec, &patch(Event::Cancel)).unwrap();
        assert_eq!(cancel.token, "background");

        let message = merge_fanout_request(&rec, &patch(Event::Message)).unwrap();
        assert_eq!(message.token, "background");

        let session = merge_fanout_request(&rec, &patch(Event::IncomingSession)).unwrap();
        assert_eq!(session.token, "primary");
    }

    #[test]
    fn missing_event_is_a_validation_error() {
        let rec = record("app1", "dev1", "primary", None);
        let mut p = patch(Event::IncomingSession);
        p.event = None;
        assert!(merge_fanout_request(&rec, &p).is_err());
    }

    #[test]
    fn linphone_rejects_non_incoming_session_events() {
        let req = NormalizedRequest {
            app_id: "a".into(),
            platform: Platform::Apple,
            event: Event::Cancel,
            token: "t".into(),
            device_id: None,
            call_id: "c".into(),
            sip_from: "sip:a@b".into(),
            sip_to: "sip:c@d".into(),
            from_display_name: None,
            media_type: None,
            silent: true,
            reason: None,
            badge: 1,
        };
        assert!(validate_family_requirements(&req, Family::Linphone).is_err());
    }

    #[test]
    fn media_type_required_unless_cancel() {
        let mut req = NormalizedRequest {
            app_id: "a".into(),
            platform: Platform::Apple,
            event: Event::IncomingSession,
            token: "t".into(),
            device_id: None,
            call_id: "c".into(),
            sip_from: "sip:a@b".into(),
            sip_to: "sip:c@d".into(),
            from_display_name: None,
            media_type: None,
            silent: true,
            reason: None,
            badge: 1,
        };
        assert!(validate_family_requirements(&req, Family::Sylk).is_err());
        req.event = Event::Cancel;
        assert!(validate_family_requirements(&req, Family::Sylk).is_ok());
    }
}
