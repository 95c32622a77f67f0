//! Application registry: parses the per-application INI table into
//! `Binding`s, resolves vendor clients, and watches the config for changes.
//!
//! Per REDESIGN FLAGS §9 the renderer and vendor-client lookups are plain
//! match arms / keyed maps built once here, never a string-keyed dynamic
//! import as `pushserver.pns.register.get_pns_from_config` does.

use crate::models::{Binding, Family, InvalidBinding, LogRemote, Platform, VendorCredentials};
use crate::vendor_apns::ApnsClient;
use crate::vendor_fcm::FcmClient;
use arc_swap::ArcSwap;
use ini::Ini;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{info, warn};

/// Key into the registry: `(app_id, platform)`, unique per spec.md §3.
pub type BindingKey = (String, Platform);

/// One generation of the application table: resolved bindings plus the
/// vendor clients built from their credentials, and the sections that
/// failed to resolve (kept around so `/push` can report why).
pub struct Registry {
    pub bindings: HashMap<BindingKey, Binding>,
    pub apns_clients: HashMap<BindingKey, Arc<ApnsClient>>,
    pub fcm_clients: HashMap<BindingKey, Arc<FcmClient>>,
    pub invalid: Vec<InvalidBinding>,
}

impl Registry {
    pub fn lookup(&self, app_id: &str, platform: Platform) -> Option<&Binding> {
        self.bindings.get(&(app_id.to_string(), platform))
    }

    pub fn apns_client(&self, app_id: &str, platform: Platform) -> Option<Arc<ApnsClient>> {
        self.apns_clients.get(&(app_id.to_string(), platform)).cloned()
    }

    pub fn fcm_client(&self, app_id: &str, platform: Platform) -> Option<Arc<FcmClient>> {
        self.fcm_clients.get(&(app_id.to_string(), platform)).cloned()
    }
}

/// Build a registry generation from the application-table INI file. Failure
/// of an individual section marks that binding invalid (reason recorded)
/// rather than aborting the whole load, mirroring
/// `pushserver/pns/register.py::get_pns_from_config`.
pub fn build(applications_path: &Path, credentials_dir: &Path) -> Registry {
    let mut bindings = HashMap::new();
    let mut apns_clients = HashMap::new();
    let mut fcm_clients = HashMap::new();
    let mut invalid = Vec::new();

    let ini = match Ini::load_from_file(applications_path) {
        Ok(ini) => ini,
        Err(e) => {
            warn!(path = %applications_path.display(), error = %e, "cannot read application table");
            return Registry { bindings, apns_clients, fcm_clients, invalid };
        }
    };

    for (section_name, props) in ini.iter() {
        let Some(section_name) = section_name else { continue };

        let app_id = match props.get("app_id") {
            Some(v) => v.to_string(),
            None => {
                invalid.push(InvalidBinding {
                    app_id: section_name.to_string(),
                    platform_raw: String::new(),
                    reason: "app_id not found in applications.ini".to_string(),
                });
                continue;
            }
        };
        let platform_raw = props.get("app_platform").unwrap_or_default().to_string();
        let Some(platform) = Platform::canonicalize(&platform_raw) else {
            invalid.push(InvalidBinding {
                app_id,
                platform_raw,
                reason: "app_platform not found or unsupported in applications.ini".to_string(),
            });
            continue;
        };

        let family_raw = props.get("app_type").unwrap_or_default().to_string();
        let Some(family) = Family::parse(&family_raw) else {
            invalid.push(InvalidBinding {
                app_id,
                platform_raw,
                reason: format!("'{family_raw}' app_type is not a known renderer family"),
            });
            continue;
        };

        let voip = props.get("voip").map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let log_remote = props.get("log_remote_urls").map(|urls| LogRemote {
            urls: urls.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect(),
            key: props.get("log_key").map(str::to_string),
            timeout_s: props.get("log_time_out").and_then(|v| v.parse().ok()),
        });

        let credentials = match platform {
            Platform::Apple => resolve_apns_credentials(&props_map(props), credentials_dir),
            Platform::Firebase => resolve_fcm_credentials(&props_map(props), credentials_dir),
        };

        let credentials = match credentials {
            Ok(c) => c,
            Err(reason) => {
                invalid.push(InvalidBinding { app_id, platform_raw, reason });
                continue;
            }
        };

        let key = (app_id.clone(), platform);

        match &credentials {
            VendorCredentials::Apns { .. } => match ApnsClient::new(&credentials) {
                Ok(client) => {
                    apns_clients.insert(key.clone(), client);
                }
                Err(reason) => {
                    invalid.push(InvalidBinding { app_id, platform_raw, reason });
                    continue;
                }
            },
            VendorCredentials::FcmLegacy { .. } | VendorCredentials::FcmOAuth2 { .. } => {
                match FcmClient::new(&credentials) {
                    Ok(client) => {
                        fcm_clients.insert(key.clone(), client);
                    }
                    Err(reason) => {
                        invalid.push(InvalidBinding { app_id, platform_raw, reason });
                        continue;
                    }
                }
            }
        }

        bindings.insert(
            key,
            Binding { app_id, platform, family, voip, credentials, log_remote },
        );
    }

    info!(
        bindings = bindings.len(),
        invalid = invalid.len(),
        path = %applications_path.display(),
        "application registry loaded"
    );
    for bad in &invalid {
        warn!(app_id = %bad.app_id, platform = %bad.platform_raw, reason = %bad.reason, "invalid binding");
    }

    Registry { bindings, apns_clients, fcm_clients, invalid }
}

fn props_map(props: &ini::Properties) -> HashMap<String, String> {
    props.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn resolve_path(raw: &str, credentials_dir: &Path) -> String {
    let p = Path::new(raw);
    if p.is_absolute() {
        raw.to_string()
    } else {
        credentials_dir.join(raw).to_string_lossy().into_owned()
    }
}

fn resolve_apns_credentials(props: &HashMap<String, String>, credentials_dir: &Path) -> Result<VendorCredentials, String> {
    let push_url = props.get("apple_push_url").cloned().ok_or("apple_push_url not found in applications.ini")?;
    let cert_file_raw = props.get("apple_certificate").cloned().ok_or("apple_certificate not found in applications.ini")?;
    let cert_file = resolve_path(&cert_file_raw, credentials_dir);
    if !Path::new(&cert_file).exists() {
        return Err(format!("{cert_file} - no such file"));
    }
    let key_file = props.get("apple_key").map(|k| resolve_path(k, credentials_dir));
    Ok(VendorCredentials::Apns { cert_file, key_file, push_url })
}

fn resolve_fcm_credentials(props: &HashMap<String, String>, credentials_dir: &Path) -> Result<VendorCredentials, String> {
    let push_url = props.get("firebase_push_url").cloned().ok_or("firebase_push_url not found in applications.ini")?;
    if let Some(auth_key) = props.get("firebase_authorization_key") {
        return Ok(VendorCredentials::FcmLegacy { auth_key: auth_key.clone(), push_url });
    }
    if let Some(auth_file) = props.get("firebase_authorization_file") {
        let service_account_file = resolve_path(auth_file, credentials_dir);
        if !Path::new(&service_account_file).exists() {
            return Err(format!("{service_account_file} - no such file"));
        }
        return Ok(VendorCredentials::FcmOAuth2 { service_account_file, push_url });
    }
    Err("not firebase_authorization_key or firebase_authorization_file found in applications.ini".to_string())
}

/// Poll `applications_path`/`credentials_dir` mtimes every `interval` and
/// atomically swap a fresh registry generation into `current` on change.
/// In-flight requests keep whatever `Arc<Registry>` they already loaded
/// (spec.md §4.1, §5).
pub async fn watch(current: Arc<ArcSwap<Registry>>, applications_path: PathBuf, credentials_dir: PathBuf, interval: std::time::Duration) {
    let mut last_seen = newest_mtime(&applications_path, &credentials_dir);
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let seen = newest_mtime(&applications_path, &credentials_dir);
        if seen != last_seen {
            info!("application table or credentials changed, reloading registry");
            let fresh = build(&applications_path, &credentials_dir);
            current.store(Arc::new(fresh));
            last_seen = seen;
        }
    }
}

fn newest_mtime(applications_path: &Path, credentials_dir: &Path) -> Option<SystemTime> {
    let mut newest = std::fs::metadata(applications_path).ok().and_then(|m| m.modified().ok());
    if let Ok(entries) = std::fs::read_dir(credentials_dir) {
        for entry in entries.flatten() {
            if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                let is_newer = match newest {
                    Some(n) => modified > n,
                    None => true,
                };
                if is_newer {
                    newest = Some(modified);
                }
            }
        }
    }
    newest
}
