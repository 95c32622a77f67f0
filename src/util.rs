//! Small stateless helpers shared across renderers and the edge layer.

use md5::{Digest, Md5};

/// Derive the UUIDv4-shaped `session-id` field from a SIP `call_id`: the hex
/// digest of MD5(call_id), segmented `8-4-4-4-12`.
pub fn session_id(call_id: &str) -> String {
    let digest = Md5::digest(call_id.as_bytes());
    let hex = hex::encode(digest);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Strip a trailing `.dev`/`.prod` environment suffix from a bundle id.
pub fn strip_env_suffix(app_id: &str) -> String {
    if app_id.ends_with(".dev") || app_id.ends_with(".prod") {
        app_id.rsplit_once('.').map(|(head, _)| head.to_string()).unwrap_or_else(|| app_id.to_string())
    } else {
        app_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_stable_and_shaped() {
        let a = session_id("call-42");
        let b = session_id("call-42");
        assert_eq!(a, b);
        let parts: Vec<&str> = a.split('-').collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts.iter().map(|p| p.len()).collect::<Vec<_>>(), vec![8, 4, 4, 4, 12]);
    }

    #[test]
    fn session_id_differs_across_inputs() {
        assert_ne!(session_id("call-1"), session_id("call-2"));
    }

    #[test]
    fn strip_env_suffix_only_strips_known_suffixes() {
        assert_eq!(strip_env_suffix("com.example.app.dev"), "com.example.app");
        assert_eq!(strip_env_suffix("com.example.app.prod"), "com.example.app");
        assert_eq!(strip_env_suffix("com.example.app"), "com.example.app");
    }
}
