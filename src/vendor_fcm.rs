//! FCM client: legacy key auth or OAuth2 service-account auth over plain
//! `reqwest`/JSON, with one-shot token refresh on a `401`.
//!
//! The teacher has no counterpart for this vendor (ASH only ever spoke
//! APNs); built new, grounded in the corpus' general outbound-JSON-HTTP
//! posture and in `other_examples/manifests/nightly-labs-oauth_fcm` for the
//! JWT-bearer-assertion dance. Header construction lives here rather than
//! in the renderer (contrast `examples/original_source/pushserver/
//! applications/firebase.py::FirebaseHeaders`, which builds them inline)
//! because a one-shot 401 refresh needs to regenerate `Authorization`
//! across a retried send; a pure renderer function can't hold that state.

use crate::models::{RenderedMessage, VendorCredentials};
use crate::retry::Attempt;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, warn};

const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, Deserialize)]
struct ServiceAccountFile {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    TOKEN_ENDPOINT.to_string()
}

#[derive(Debug, Serialize)]
struct JwtClaims {
    iss: String,
    scope: &'static str,
    aud: String,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: SystemTime,
}

enum Auth {
    Legacy { auth_key: String },
    OAuth2 { service_account_file: String, cached: RwLock<Option<CachedToken>> },
}

pub struct FcmClient {
    client: reqwest::Client,
    push_url: String,
    auth: Auth,
}

impl FcmClient {
    pub fn new(credentials: &VendorCredentials) -> Result<Arc<Self>, String> {
        let (auth, push_url) = match credentials {
            VendorCredentials::FcmLegacy { auth_key, push_url } => {
                (Auth::Legacy { auth_key: auth_key.clone() }, push_url.clone())
            }
            VendorCredentials::FcmOAuth2 { service_account_file, push_url } => (
                Auth::OAuth2 {
                    service_account_file: service_account_file.clone(),
                    cached: RwLock::new(None),
                },
                push_url.clone(),
            ),
            VendorCredentials::Apns { .. } => return Err("not an fcm binding".to_string()),
        };

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| format!("cannot build fcm client: {e}"))?;

        Ok(Arc::new(Self { client, push_url, auth }))
    }

    async fn authorization_header(&self, force_refresh: bool) -> Result<String, String> {
        match &self.auth {
            Auth::Legacy { auth_key } => Ok(format!("key={auth_key}")),
            Auth::OAuth2 { service_account_file, cached } => {
                if !force_refresh {
                    if let Some(token) = cached.read().await.as_ref() {
                        if token.expires_at > SystemTime::now() {
                            return Ok(format!("Bearer {}", token.access_token));
                        }
                    }
                }

                let token = mint_access_token(service_account_file).await?;
                let header = format!("Bearer {}", token.access_token);
                *cached.write().await = Some(token);
                Ok(header)
            }
        }
    }

    fn content_type(&self) -> &'static str {
        match &self.auth {
            Auth::Legacy { .. } => "application/json",
            Auth::OAuth2 { .. } => "application/json; UTF-8",
        }
    }

    /// Send one attempt. On a `401` from an OAuth2 binding, refreshes the
    /// token once and retries inline before reporting back to the caller's
    /// retry loop — the original's `access_token` property regenerates a
    /// fresh token on every call, so a single stale-token bounce here is
    /// the Rust-idiomatic equivalent of that unconditional refresh. This
    /// happens on every call to `send`, not just the first one a binding
    /// ever sees, since a revoked or expired cached token can trigger a 401
    /// on any later request too.
    pub async fn send(&self, message: &RenderedMessage) -> Attempt {
        match self.send_once(message, false).await {
            Ok(attempt) if attempt.code == 401 && matches!(self.auth, Auth::OAuth2 { .. }) => {
                warn!("fcm 401, refreshing access token and retrying once");
                match self.send_once(message, true).await {
                    Ok(retried) => retried,
                    Err(e) => e,
                }
            }
            Ok(attempt) => attempt,
            Err(e) => e,
        }
    }

    async fn send_once(&self, message: &RenderedMessage, force_refresh: bool) -> Result<Attempt, Attempt> {
        let authorization = self.authorization_header(force_refresh).await.map_err(|e| Attempt {
            code: 500,
            reason: format!("cannot obtain fcm credentials: {e}"),
            body: None,
            url: self.push_url.clone(),
            retriable: false,
        })?;

        debug!(url = %self.push_url, "fcm request");
        let response = self
            .client
            .post(&self.push_url)
            .header("Authorization", authorization)
            .header("Content-Type", self.content_type())
            .json(&message.payload)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                return Ok(Attempt {
                    code: 599,
                    reason: format!("connection failed: {e}"),
                    body: None,
                    url: self.push_url.clone(),
                    retriable: true,
                })
            }
        };

        let status = response.status().as_u16();
        let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);

        let (code, reason) = remap(status, &body);
        if code != 200 {
            warn!(code, %reason, "fcm push failed");
        }

        let retriable = (500..600).contains(&code);
        Ok(Attempt { code, reason, body: Some(body), url: self.push_url.clone(), retriable })
    }
}

/// Legacy/v1-envelope status remap, ported from
/// `pushserver/pns/firebase.py::send_http_notification`'s post-response
/// branch: a `200` with an internal failure marker becomes a terminal
/// `410`, and so does a `400`/`404` naming an invalid or unknown token.
fn remap(status: u16, body: &serde_json::Value) -> (u16, String) {
    if status == 200 {
        if body.get("_content").and_then(|c| c.get("failure")).and_then(|f| f.as_i64()) == Some(1) {
            let description = body
                .pointer("/_content/results/0/error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown failure reason")
                .to_string();
            return (410, description);
        }
        return (200, "OK".to_string());
    }

    let details = body.pointer("/_content/error/message").and_then(|v| v.as_str());
    let internal_code = body.pointer("/_content/error/code").and_then(|v| v.as_i64());

    let is_invalid_token = (internal_code == Some(400)
        && details.is_some_and(|d| d.contains("not a valid FCM registration token")))
        || internal_code == Some(404);

    let reason = body.get("reason").and_then(|v| v.as_str());
    let description = match (reason, details) {
        (Some(r), Some(d)) => format!("{r} {d}"),
        (Some(r), None) => r.to_string(),
        (None, Some(d)) => d.to_string(),
        (None, None) => "unknown failure reason".to_string(),
    };

    if is_invalid_token {
        (410, description)
    } else {
        (status, description)
    }
}

async fn mint_access_token(service_account_file: &str) -> Result<CachedToken, String> {
    let raw = tokio::fs::read(service_account_file)
        .await
        .map_err(|e| format!("{service_account_file} - no such file: {e}"))?;
    let account: ServiceAccountFile =
        serde_json::from_slice(&raw).map_err(|e| format!("{service_account_file} - bad service account json: {e}"))?;

    let now = SystemTime::now().duration_since(UNIX_EPOCH).map_err(|e| e.to_string())?.as_secs();
    let claims = JwtClaims {
        iss: account.client_email.clone(),
        scope: FCM_SCOPE,
        aud: account.token_uri.clone(),
        iat: now,
        exp: now + 3600,
    };

    let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())
        .map_err(|e| format!("{service_account_file} - bad private key: {e}"))?;
    let assertion = encode(&Header::new(Algorithm::RS256), &claims, &key).map_err(|e| format!("cannot sign jwt: {e}"))?;

    let client = reqwest::Client::new();
    let response = client
        .post(&account.token_uri)
        .form(&[
            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
            ("assertion", assertion.as_str()),
        ])
        .send()
        .await
        .map_err(|e| format!("token request failed: {e}"))?;

    if !response.status().is_success() {
        return Err(format!("token endpoint returned {}", response.status()));
    }

    let token: TokenResponse = response.json().await.map_err(|e| format!("bad token response: {e}"))?;
    Ok(CachedToken {
        access_token: token.access_token,
        expires_at: SystemTime::now() + Duration::from_secs(token.expires_in.saturating_sub(60)),
    })
}
