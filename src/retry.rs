//! Shared retry/backoff engine for both vendor clients.

use crate::models::MediaType;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_factor: f64,
}

impl RetryPolicy {
    /// `media_type ∈ {sms}` or missing -> 11 attempts, otherwise 7.
    pub fn for_media_type(media_type: Option<MediaType>) -> Self {
        let max_attempts = match media_type {
            None | Some(MediaType::Sms) => 11,
            Some(_) => 7,
        };
        Self { max_attempts, backoff_factor: 0.5 }
    }

    /// Sleep before attempt `n` (0-indexed): `backoff_factor * 2^n` seconds.
    pub fn backoff(&self, n: u32) -> Duration {
        Duration::from_secs_f64(self.backoff_factor * 2f64.powi(n as i32))
    }
}

/// One vendor attempt's outcome, as reported by the vendor client.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub code: u16,
    pub reason: String,
    pub body: Option<serde_json::Value>,
    pub url: String,
    pub retriable: bool,
}

/// Drive `send` under `policy` until it returns a non-retriable attempt or
/// the attempt cap is hit. `send` receives the 0-indexed attempt number.
/// Sleeps between attempts are interruptible via `cancel`.
pub async fn drive<F, Fut>(policy: RetryPolicy, cancel: &CancellationToken, mut send: F) -> Attempt
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt>,
{
    let mut attempt_index = 0u32;
    loop {
        let result = send(attempt_index).await;
        if !result.retriable {
            return result;
        }

        attempt_index += 1;
        if attempt_index >= policy.max_attempts {
            return Attempt {
                reason: "maximum retries reached".to_string(),
                ..result
            };
        }

        let backoff = policy.backoff(attempt_index - 1);
        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            () = cancel.cancelled() => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_by_media_type() {
        assert_eq!(RetryPolicy::for_media_type(None).max_attempts, 11);
        assert_eq!(RetryPolicy::for_media_type(Some(MediaType::Sms)).max_attempts, 11);
        assert_eq!(RetryPolicy::for_media_type(Some(MediaType::Audio)).max_attempts, 7);
    }

    #[test]
    fn backoff_is_geometric_ratio_two() {
        let policy = RetryPolicy::for_media_type(Some(MediaType::Audio));
        assert_eq!(policy.backoff(0), Duration::from_secs_f64(0.5));
        assert_eq!(policy.backoff(1), Duration::from_secs_f64(1.0));
        assert_eq!(policy.backoff(2), Duration::from_secs_f64(2.0));
        assert_eq!(policy.backoff(3), Duration::from_secs_f64(4.0));
        assert_eq!(policy.backoff(4), Duration::from_secs_f64(8.0));
    }

    #[tokio::test]
    async fn drive_stops_at_first_non_retriable_result() {
        let policy = RetryPolicy::for_media_type(Some(MediaType::Audio));
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let result = drive(policy, &cancel, |_| {
            calls += 1;
            async move {
                Attempt { code: 200, reason: "OK".into(), body: None, url: "u".into(), retriable: false }
            }
        })
        .await;
        assert_eq!(calls, 1);
        assert_eq!(result.code, 200);
    }

    #[tokio::test]
    async fn drive_caps_attempts_and_reports_reason() {
        let policy = RetryPolicy { max_attempts: 3, backoff_factor: 0.001 };
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let result = drive(policy, &cancel, |_| {
            calls += 1;
            async move {
                Attempt { code: 503, reason: "Service Unavailable".into(), body: None, url: "u".into(), retriable: true }
            }
        })
        .await;
        assert_eq!(calls, 3);
        assert_eq!(result.reason, "maximum retries reached");
        assert_eq!(result.code, 503);
    }
}
