//! Outbound tracking protocol.
//!
//! A [`Hit`] is one tracking request: a flat parameter set plus metadata the
//! sender needs. [`HitSender`] routes each hit to a target, issues the HTTP
//! GET, and records the outcome in the router's per-target metrics.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::target::TargetRouter;

/// Per-hit request timeout. Timeouts count as ordinary failures; there
/// are no retries (at-most-once delivery).
const HIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum SendError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected http status {0}")]
    Status(u16),
}

/// What a hit represents, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitKind {
    Pageview,
    SiteSearch,
    Outlink,
    Download,
    Event,
    Ecommerce,
    Ping,
}

/// One planned tracking request. Target-specific parameters (`idsite`,
/// `token_auth`) are appended at send time by [`HitSender`].
#[derive(Debug, Clone)]
pub struct Hit {
    pub kind: HitKind,
    pub params: Vec<(String, String)>,
    /// Realtime pacing sleep applied after this hit, in seconds.
    pub pause_after_secs: f64,
}

impl Hit {
    pub fn new(kind: HitKind) -> Self {
        Self {
            kind,
            params: Vec::new(),
            pause_after_secs: 0.0,
        }
    }

    pub fn push(&mut self, key: &str, value: impl Into<String>) {
        self.params.push((key.to_string(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The UTC send timestamp carried in `cdt`.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.get("cdt").and_then(|s| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|n| n.and_utc())
        })
    }
}

/// Format a timestamp the way the tracking API expects `cdt`.
pub fn format_cdt(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Sends hits to routed targets and keeps the target metrics current.
pub struct HitSender {
    client: reqwest::Client,
    router: Arc<TargetRouter>,
}

impl HitSender {
    pub fn new(router: Arc<TargetRouter>) -> Result<Self, SendError> {
        let client = reqwest::Client::builder()
            .timeout(HIT_TIMEOUT)
            .build()
            .map_err(|e| SendError::Network(e.to_string()))?;
        Ok(Self { client, router })
    }

    pub fn router(&self) -> &TargetRouter {
        &self.router
    }

    /// Send one hit to the next routed target.
    ///
    /// Every hit carries a `cdt` timestamp override, so the target's auth
    /// token is attached whenever one is configured (the tracking API only
    /// honors timestamp and IP overrides with `token_auth`).
    pub async fn send(&self, hit: &Hit, user_agent: &str) -> Result<(), SendError> {
        let target = self.router.next_target();
        let metrics = self
            .router
            .metrics_for(&target.name)
            .expect("router metrics exist for every target");

        let mut query: Vec<(String, String)> = Vec::with_capacity(hit.params.len() + 4);
        query.push(("idsite".to_string(), target.site_id.to_string()));
        query.push(("rec".to_string(), "1".to_string()));
        query.extend(hit.params.iter().cloned());
        query.push(("send_image".to_string(), "0".to_string()));
        if let Some(token) = &target.token_auth {
            query.push(("token_auth".to_string(), token.clone()));
        }

        let start = Instant::now();
        let result = self
            .client
            .get(&target.url)
            .query(&query)
            .header(reqwest::header::USER_AGENT, user_agent)
            .send()
            .await;

        match result {
            Ok(resp) => {
                let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                let status = resp.status();
                if status.is_success() {
                    metrics.record_success(latency_ms);
                    Ok(())
                } else {
                    let reason = format!("http {}", status.as_u16());
                    metrics.record_failure(&reason);
                    Err(SendError::Status(status.as_u16()))
                }
            }
            Err(e) => {
                let err = if e.is_timeout() {
                    SendError::Timeout(HIT_TIMEOUT)
                } else {
                    SendError::Network(e.to_string())
                };
                metrics.record_failure(&err.to_string());
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_hit_param_accessors() {
        let mut hit = Hit::new(HitKind::Pageview);
        hit.push("url", "https://example.com/");
        hit.push("cdt", "2024-10-01 12:30:00");
        assert_eq!(hit.get("url"), Some("https://example.com/"));
        assert_eq!(
            hit.timestamp().unwrap(),
            chrono::NaiveDate::from_ymd_opt(2024, 10, 1)
                .unwrap()
                .and_hms_opt(12, 30, 0)
                .unwrap()
                .and_utc()
        );
    }

    #[test]
    fn test_format_cdt() {
        let ts = chrono::NaiveDate::from_ymd_opt(2024, 1, 5)
            .unwrap()
            .and_hms_opt(9, 7, 3)
            .unwrap()
            .and_utc();
        assert_eq!(format_cdt(ts), "2024-01-05 09:07:03");
    }

    #[tokio::test]
    async fn test_send_failure_is_recorded() {
        // Unroutable address; the request fails and the failure lands in
        // the target metrics rather than panicking anything.
        let cfg = Config {
            matomo_url: "http://127.0.0.1:1/matomo.php".to_string(),
            ..Default::default()
        };
        let router = Arc::new(TargetRouter::from_config(&cfg).unwrap());
        let sender = HitSender::new(router.clone()).unwrap();

        let mut hit = Hit::new(HitKind::Pageview);
        hit.push("url", "https://example.com/");
        hit.push("_id", "a".repeat(16));

        assert!(sender.send(&hit, "test-agent").await.is_err());
        let report = router.report();
        assert_eq!(report.total_failures, 1);
        assert_eq!(report.total_successes, 0);
    }

    #[test]
    fn test_router_strategy_available_to_sender() {
        let cfg = Config::default();
        let router = Arc::new(TargetRouter::from_config(&cfg).unwrap());
        let sender = HitSender::new(router).unwrap();
        assert_eq!(sender.router().report().strategy, "round-robin");
    }
}
