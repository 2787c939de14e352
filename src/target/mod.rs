//! Multi-target routing for tracking requests.
//!
//! Holds the set of tracking destinations and spreads hits across them
//! using round-robin, weighted, or random distribution. Per-target metrics
//! feed the health report.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("at least one target must be enabled")]
    NoEnabledTargets,
    #[error("enabled target '{0}' has weight {1}; weighted distribution requires weight >= 1")]
    BadWeight(String, u32),
    #[error("unknown distribution strategy: {0}")]
    UnknownStrategy(String),
    #[error("failed to parse MULTI_TARGET_CONFIG: {0}")]
    BadTargetConfig(#[from] serde_json::Error),
}

/// A single tracking destination. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub url: String,
    pub site_id: u32,
    #[serde(default)]
    pub token_auth: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_weight() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

/// Distribution strategy across enabled targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    Weighted,
    Random,
}

impl std::str::FromStr for Strategy {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(Self::RoundRobin),
            "weighted" => Ok(Self::Weighted),
            "random" => Ok(Self::Random),
            other => Err(RouterError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Derived health status from the success rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failed,
    Unknown,
}

/// Mutable per-target counters, updated once per hit outcome.
#[derive(Debug, Default)]
struct MetricsInner {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    total_latency_ms: f64,
    last_error: Option<String>,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
}

impl MetricsInner {
    fn success_rate(&self) -> f64 {
        if self.total_requests > 0 {
            self.successful_requests as f64 / self.total_requests as f64
        } else {
            0.0
        }
    }

    fn avg_latency_ms(&self) -> Option<f64> {
        if self.successful_requests > 0 {
            Some(self.total_latency_ms / self.successful_requests as f64)
        } else {
            None
        }
    }

    fn status(&self) -> HealthStatus {
        if self.total_requests == 0 {
            HealthStatus::Unknown
        } else if self.success_rate() >= 0.95 {
            HealthStatus::Healthy
        } else if self.success_rate() >= 0.70 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Failed
        }
    }
}

/// Runtime metrics for a single target. Safe for concurrent workers.
#[derive(Debug, Default)]
pub struct TargetMetrics {
    inner: Mutex<MetricsInner>,
}

impl TargetMetrics {
    pub fn record_success(&self, latency_ms: f64) {
        let mut m = self.inner.lock().unwrap();
        m.total_requests += 1;
        m.successful_requests += 1;
        m.total_latency_ms += latency_ms;
        m.last_success = Some(Utc::now());
    }

    pub fn record_failure(&self, error: &str) {
        let mut m = self.inner.lock().unwrap();
        m.total_requests += 1;
        m.failed_requests += 1;
        m.last_error = Some(error.to_string());
        m.last_failure = Some(Utc::now());
    }

    pub fn status(&self) -> HealthStatus {
        self.inner.lock().unwrap().status()
    }

    pub fn success_rate(&self) -> f64 {
        self.inner.lock().unwrap().success_rate()
    }

    pub fn snapshot(&self) -> TargetReport {
        let m = self.inner.lock().unwrap();
        TargetReport {
            requests: m.total_requests,
            successes: m.successful_requests,
            failures: m.failed_requests,
            success_rate: m.success_rate(),
            avg_latency_ms: m.avg_latency_ms(),
            status: m.status(),
            last_error: m.last_error.clone(),
        }
    }
}

/// Per-target slice of the aggregate report.
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub avg_latency_ms: Option<f64>,
    pub status: HealthStatus,
    pub last_error: Option<String>,
}

/// Aggregate router report for operators.
#[derive(Debug, Serialize)]
pub struct RouterReport {
    pub strategy: String,
    pub total_targets: usize,
    pub enabled_targets: usize,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub overall_success_rate: f64,
    pub per_target: Vec<(String, TargetReport)>,
}

/// Routes tracking requests across enabled targets. Selection is pure:
/// no I/O happens here, and metrics updates are the sender's job.
pub struct TargetRouter {
    targets: Vec<Target>,
    enabled: Vec<usize>,
    metrics: Vec<TargetMetrics>,
    strategy: Strategy,
    rr_index: AtomicUsize,
}

impl TargetRouter {
    pub fn new(targets: Vec<Target>, strategy: Strategy) -> Result<Self, RouterError> {
        let enabled: Vec<usize> = targets
            .iter()
            .enumerate()
            .filter(|(_, t)| t.enabled)
            .map(|(i, _)| i)
            .collect();

        if enabled.is_empty() {
            return Err(RouterError::NoEnabledTargets);
        }

        // Disabled targets' weights are irrelevant; only enabled ones are checked.
        if strategy == Strategy::Weighted {
            for &i in &enabled {
                if targets[i].weight < 1 {
                    return Err(RouterError::BadWeight(
                        targets[i].name.clone(),
                        targets[i].weight,
                    ));
                }
            }
        }

        let metrics = targets.iter().map(|_| TargetMetrics::default()).collect();

        Ok(Self {
            targets,
            enabled,
            metrics,
            strategy,
            rr_index: AtomicUsize::new(0),
        })
    }

    /// Build the router from the multi-target JSON blob, or fall back
    /// to a single implicit target from the base configuration.
    pub fn from_config(cfg: &Config) -> Result<Self, RouterError> {
        if let Some(blob) = &cfg.multi_target_config {
            #[derive(Deserialize)]
            struct MultiTargetConfig {
                targets: Vec<Target>,
                #[serde(default)]
                distribution_strategy: Option<String>,
            }

            let parsed: MultiTargetConfig = serde_json::from_str(blob)?;
            if !parsed.targets.is_empty() {
                let strategy = parsed
                    .distribution_strategy
                    .as_deref()
                    .unwrap_or("round-robin")
                    .parse()?;
                let targets = parsed
                    .targets
                    .into_iter()
                    .map(|mut t| {
                        t.url = t.url.trim_end_matches('/').to_string();
                        t
                    })
                    .collect();
                return Self::new(targets, strategy);
            }
        }

        Self::new(
            vec![Target {
                name: "default".to_string(),
                url: cfg.matomo_url.clone(),
                site_id: cfg.site_id,
                token_auth: cfg.token_auth.clone(),
                weight: 1,
                enabled: true,
            }],
            Strategy::RoundRobin,
        )
    }

    /// Select the next target according to the configured strategy.
    pub fn next_target(&self) -> &Target {
        let idx = match self.strategy {
            Strategy::RoundRobin => {
                let i = self.rr_index.fetch_add(1, Ordering::Relaxed);
                self.enabled[i % self.enabled.len()]
            }
            Strategy::Weighted => {
                let total: u64 = self.enabled.iter().map(|&i| self.targets[i].weight as u64).sum();
                let mut pick = rand::thread_rng().gen_range(0..total);
                let mut chosen = self.enabled[0];
                for &i in &self.enabled {
                    let w = self.targets[i].weight as u64;
                    if pick < w {
                        chosen = i;
                        break;
                    }
                    pick -= w;
                }
                chosen
            }
            Strategy::Random => {
                self.enabled[rand::thread_rng().gen_range(0..self.enabled.len())]
            }
        };
        &self.targets[idx]
    }

    /// Metrics handle for a target, looked up by name.
    pub fn metrics_for(&self, name: &str) -> Option<&TargetMetrics> {
        self.targets
            .iter()
            .position(|t| t.name == name)
            .map(|i| &self.metrics[i])
    }

    pub fn report(&self) -> RouterReport {
        let per_target: Vec<(String, TargetReport)> = self
            .targets
            .iter()
            .zip(self.metrics.iter())
            .map(|(t, m)| (t.name.clone(), m.snapshot()))
            .collect();

        let total_requests: u64 = per_target.iter().map(|(_, r)| r.requests).sum();
        let total_successes: u64 = per_target.iter().map(|(_, r)| r.successes).sum();
        let total_failures: u64 = per_target.iter().map(|(_, r)| r.failures).sum();

        RouterReport {
            strategy: match self.strategy {
                Strategy::RoundRobin => "round-robin",
                Strategy::Weighted => "weighted",
                Strategy::Random => "random",
            }
            .to_string(),
            total_targets: self.targets.len(),
            enabled_targets: self.enabled.len(),
            total_requests,
            total_successes,
            total_failures,
            overall_success_rate: if total_requests > 0 {
                total_successes as f64 / total_requests as f64
            } else {
                0.0
            },
            per_target,
        }
    }
}
