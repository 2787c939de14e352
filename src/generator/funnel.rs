//! Funnel definitions and the step-sequenced funnel engine.
//!
//! Funnels override random visit composition when selected: a predefined
//! ordered step list with per-step timing windows and typed payloads.
//! Definitions are loaded from a JSON file into an owned, reloadable
//! registry; malformed entries are skipped with a warning so one bad
//! funnel never takes down the rest of the file.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;

use crate::config::Config;
use crate::generator::{self, VisitContext};
use crate::generator::visit::VisitPlan;
use crate::tracker::{format_cdt, Hit, HitKind};

#[derive(Error, Debug)]
pub enum FunnelError {
    #[error("failed to read funnels file {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error("funnels file {0} is not a JSON array: {1}")]
    NotAnArray(String, #[source] serde_json::Error),
    #[error("funnel '{0}' has no steps")]
    EmptySteps(String),
    #[error("funnel '{0}': first step must be a pageview")]
    FirstStepNotPageview(String),
    #[error("funnel '{0}' step {1}: delay window invalid (min {2}, max {3})")]
    BadDelay(String, usize, f64, f64),
    #[error("funnel '{0}': probability {1} outside 0.0..=1.0")]
    BadProbability(String, f64),
}

/// Typed payload of one funnel step.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    Pageview {
        url: String,
    },
    Event {
        #[serde(default)]
        url: Option<String>,
        event_category: String,
        event_action: String,
        event_name: String,
        #[serde(default)]
        event_value: Option<f64>,
    },
    SiteSearch {
        #[serde(default)]
        url: Option<String>,
        keyword: String,
        #[serde(default)]
        category: Option<String>,
        #[serde(default)]
        results: Option<u32>,
    },
    Outlink {
        url: String,
    },
    Download {
        url: String,
    },
    Ecommerce {
        #[serde(default)]
        revenue: Option<f64>,
        #[serde(default)]
        subtotal: Option<f64>,
        #[serde(default)]
        tax: Option<f64>,
        #[serde(default)]
        shipping: Option<f64>,
        #[serde(default)]
        currency: Option<String>,
    },
}

/// One step of a funnel: a typed action plus the delay window applied
/// after the step.
#[derive(Debug, Clone, Deserialize)]
pub struct FunnelStep {
    #[serde(flatten)]
    pub action: StepAction,
    #[serde(default)]
    pub delay_seconds_min: f64,
    #[serde(default)]
    pub delay_seconds_max: f64,
}

fn default_probability() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

/// A predefined ordered visit, selected ahead of random composition.
#[derive(Debug, Clone, Deserialize)]
pub struct Funnel {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_probability")]
    pub probability: f64,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub exit_after_completion: bool,
    pub steps: Vec<FunnelStep>,
}

impl Funnel {
    pub fn validate(&self) -> Result<(), FunnelError> {
        if self.steps.is_empty() {
            return Err(FunnelError::EmptySteps(self.name.clone()));
        }
        if !matches!(self.steps[0].action, StepAction::Pageview { .. }) {
            return Err(FunnelError::FirstStepNotPageview(self.name.clone()));
        }
        if !(0.0..=1.0).contains(&self.probability) {
            return Err(FunnelError::BadProbability(self.name.clone(), self.probability));
        }
        for (i, step) in self.steps.iter().enumerate() {
            if step.delay_seconds_min < 0.0 || step.delay_seconds_max < step.delay_seconds_min {
                return Err(FunnelError::BadDelay(
                    self.name.clone(),
                    i,
                    step.delay_seconds_min,
                    step.delay_seconds_max,
                ));
            }
        }
        Ok(())
    }
}

/// Owned, reloadable store of active funnels, kept sorted by ascending
/// priority. Collaborators (e.g. a control surface) call [`reload`].
///
/// [`reload`]: FunnelRegistry::reload
pub struct FunnelRegistry {
    path: Option<PathBuf>,
    funnels: RwLock<Vec<Funnel>>,
}

impl FunnelRegistry {
    /// A registry with no funnels; selection always falls through to
    /// random visit composition.
    pub fn empty() -> Self {
        Self {
            path: None,
            funnels: RwLock::new(Vec::new()),
        }
    }

    /// Load funnel definitions from a JSON array file. Individual
    /// malformed entries are skipped with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FunnelError> {
        let registry = Self {
            path: Some(path.as_ref().to_path_buf()),
            funnels: RwLock::new(Vec::new()),
        };
        registry.reload()?;
        Ok(registry)
    }

    /// Re-read the definition file. Returns how many funnels are active.
    pub fn reload(&self) -> Result<usize, FunnelError> {
        let Some(path) = &self.path else {
            return Ok(0);
        };

        let text = std::fs::read_to_string(path)
            .map_err(|e| FunnelError::Io(path.display().to_string(), e))?;
        let entries: Vec<serde_json::Value> = serde_json::from_str(&text)
            .map_err(|e| FunnelError::NotAnArray(path.display().to_string(), e))?;

        let mut loaded = Vec::new();
        for (i, entry) in entries.into_iter().enumerate() {
            let funnel: Funnel = match serde_json::from_value(entry) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!("skipping malformed funnel entry {i}: {e}");
                    continue;
                }
            };
            if !funnel.enabled {
                tracing::debug!("funnel '{}' is disabled", funnel.name);
                continue;
            }
            if let Err(e) = funnel.validate() {
                tracing::warn!("skipping invalid funnel entry {i}: {e}");
                continue;
            }
            loaded.push(funnel);
        }
        loaded.sort_by_key(|f| f.priority);

        let count = loaded.len();
        *self.funnels.write().unwrap() = loaded;
        tracing::info!("loaded {count} active funnels");
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.funnels.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Select a funnel for the next visit, or None for random browsing.
    ///
    /// Funnels are tried in ascending priority order with an independent
    /// Bernoulli trial each; the first success wins. This is intentionally
    /// not a normalized weighted draw: a lower-priority funnel only runs
    /// when every higher-priority funnel failed its own trial.
    pub fn select(&self, rng: &mut impl Rng) -> Option<Funnel> {
        let funnels = self.funnels.read().unwrap();
        for funnel in funnels.iter() {
            if rng.gen::<f64>() < funnel.probability {
                return Some(funnel.clone());
            }
        }
        None
    }
}

/// A planned funnel execution plus what the caller needs to continue
/// the same visitor's session when the funnel does not end the visit.
pub struct FunnelRun {
    pub plan: VisitPlan,
    pub exit_after: bool,
    pub ctx: VisitContext,
    /// Effective URL of the last step, for referrer chaining.
    pub last_url: Option<String>,
}

/// Executes funnels: turns a definition into a planned hit sequence.
pub struct FunnelEngine {
    cfg: Config,
}

impl FunnelEngine {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    /// Plan a funnel run. When `exit_after` is false the caller follows
    /// up with ordinary browsing for the same visitor, using the returned
    /// context and last URL.
    pub fn plan(
        &self,
        funnel: &Funnel,
        rng: &mut impl Rng,
        window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> FunnelRun {
        let cfg = &self.cfg;
        let ctx = VisitContext::new(cfg, rng);
        let n = funnel.steps.len();

        // Sample every delay up front; the sequence spans the sum of all
        // but the last step's delay.
        let mut delays: Vec<f64> = funnel
            .steps
            .iter()
            .map(|s| {
                if s.delay_seconds_max > s.delay_seconds_min {
                    rng.gen_range(s.delay_seconds_min..=s.delay_seconds_max)
                } else {
                    s.delay_seconds_min
                }
            })
            .collect();
        let mut span: f64 = delays.iter().take(n.saturating_sub(1)).sum();

        let realtime = window.is_none();
        let base = match window {
            Some((start, end)) => {
                let window_secs = (end - start).num_seconds().max(1) as f64;
                if span >= window_secs {
                    let scale = window_secs * 0.9 / span;
                    for d in &mut delays {
                        *d *= scale;
                    }
                    span = window_secs * 0.9;
                }
                let slack = (window_secs - span).max(0.0);
                start + ChronoDuration::milliseconds((rng.gen_range(0.0..=slack) * 1000.0) as i64)
            }
            None => Utc::now() - ChronoDuration::milliseconds((span * 1000.0) as i64),
        };

        let mut hits = Vec::with_capacity(n);
        let mut ts = base;
        let mut last_url: Option<String> = ctx.referrer.clone();
        let mut first = true;

        for (i, step) in funnel.steps.iter().enumerate() {
            let mut hit = Hit::new(HitKind::Pageview);
            hit.push("_id", ctx.visitor_id.clone());
            hit.push("rand", generator::rand_nonce(rng).to_string());
            hit.push("cdt", format_cdt(ts));

            if first {
                hit.push("new_visit", "1");
            }
            if let Some(referrer) = &last_url {
                hit.push("urlref", referrer.clone());
            }

            let effective_url = self.apply_step(&mut hit, step, rng, last_url.as_deref());

            if let Some((_, ip)) = &ctx.geo {
                hit.push("cip", ip.to_string());
            }
            if realtime && i < n - 1 {
                hit.pause_after_secs = delays[i];
            }

            last_url = Some(effective_url);
            ts += ChronoDuration::milliseconds((delays[i] * 1000.0) as i64);
            first = false;
            hits.push(hit);
        }

        FunnelRun {
            plan: VisitPlan {
                user_agent: ctx.user_agent,
                hits,
            },
            exit_after: funnel.exit_after_completion,
            ctx,
            last_url,
        }
    }

    /// Fill in the type-specific payload. Returns the step's effective
    /// URL for referrer chaining.
    fn apply_step(
        &self,
        hit: &mut Hit,
        step: &FunnelStep,
        rng: &mut impl Rng,
        previous_url: Option<&str>,
    ) -> String {
        let fallback = || previous_url.unwrap_or("https://example.com/").to_string();

        match &step.action {
            StepAction::Pageview { url } => {
                hit.push("url", url.clone());
                hit.push("pv_id", generator::rand_hex(rng, 6));
                hit.push("action_name", page_title(url));
                url.clone()
            }
            StepAction::Event {
                url,
                event_category,
                event_action,
                event_name,
                event_value,
            } => {
                hit.kind = HitKind::Event;
                let page = url.clone().unwrap_or_else(fallback);
                hit.push("url", page.clone());
                hit.push("e_c", event_category.clone());
                hit.push("e_a", event_action.clone());
                hit.push("e_n", event_name.clone());
                if let Some(v) = event_value {
                    hit.push("e_v", v.to_string());
                }
                hit.push("action_name", format!("Event: {event_category} / {event_name}"));
                page
            }
            StepAction::SiteSearch {
                url,
                keyword,
                category,
                results,
            } => {
                hit.kind = HitKind::SiteSearch;
                let page = url.clone().unwrap_or_else(fallback);
                hit.push("url", page.clone());
                hit.push("search", keyword.clone());
                if let Some(cat) = category {
                    hit.push("search_cat", cat.clone());
                }
                let count = results.unwrap_or_else(|| rng.gen_range(0..=25));
                hit.push("search_count", count.to_string());
                hit.push("action_name", format!("Search: {keyword}"));
                page
            }
            StepAction::Outlink { url } => {
                hit.kind = HitKind::Outlink;
                hit.push("url", url.clone());
                hit.push("link", url.clone());
                hit.push("action_name", format!("Outlink: {url}"));
                // the containing page stays the effective URL
                fallback()
            }
            StepAction::Download { url } => {
                hit.kind = HitKind::Download;
                hit.push("url", url.clone());
                hit.push("download", url.clone());
                let file_name = url.rsplit('/').next().unwrap_or(url);
                hit.push("action_name", format!("Download: {file_name}"));
                fallback()
            }
            StepAction::Ecommerce {
                revenue,
                subtotal,
                tax,
                shipping,
                currency,
            } => {
                hit.kind = HitKind::Ecommerce;
                let page = fallback();
                hit.push("url", page.clone());

                let mut order = generator::generate_order(&self.cfg, rng);
                if let Some(v) = subtotal {
                    order.subtotal = *v;
                }
                if let Some(v) = tax {
                    order.tax = *v;
                }
                if let Some(v) = shipping {
                    order.shipping = *v;
                }
                if let Some(v) = revenue {
                    order.revenue = *v;
                } else if subtotal.is_some() || tax.is_some() || shipping.is_some() {
                    order.revenue =
                        ((order.subtotal + order.shipping + order.tax) * 100.0).round() / 100.0;
                }
                if let Some(c) = currency {
                    order.currency = c.clone();
                }

                hit.push("idgoal", "0");
                hit.push("ec_id", order.order_id.clone());
                hit.push("ec_items", order.items_json());
                hit.push("revenue", format!("{:.2}", order.revenue));
                hit.push("ec_st", format!("{:.2}", order.subtotal));
                hit.push("ec_tx", format!("{:.2}", order.tax));
                hit.push("ec_sh", format!("{:.2}", order.shipping));
                hit.push("ec_currency", order.currency.clone());
                hit.push("action_name", format!("Order: {}", order.order_id));
                page
            }
        }
    }
}

/// Derive a readable action name from a page URL path.
fn page_title(url: &str) -> String {
    let path = url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    // a bare host (or scheme remnant) means the site root
    if path.is_empty() || path.contains('.') || path.contains(':') {
        "Home".to_string()
    } else {
        let mut title: Vec<char> = path.replace(['-', '_'], " ").chars().collect();
        if let Some(c) = title.first_mut() {
            *c = c.to_ascii_uppercase();
        }
        title.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::io::Write;

    fn sample_definitions() -> &'static str {
        r#"[
            {
                "name": "Signup Funnel",
                "description": "Landing to signup",
                "probability": 1.0,
                "priority": 1,
                "enabled": true,
                "exit_after_completion": true,
                "steps": [
                    {"type": "pageview", "url": "https://example.com/landing", "delay_seconds_min": 0, "delay_seconds_max": 1.5},
                    {"type": "event", "url": "https://example.com/landing", "event_category": "CTA", "event_action": "Click", "event_name": "Hero Button"},
                    {"type": "pageview", "url": "https://example.com/signup", "delay_seconds_min": 1, "delay_seconds_max": 3}
                ]
            },
            {
                "name": "Disabled Funnel",
                "enabled": false,
                "steps": [{"type": "pageview", "url": "https://example.com"}]
            },
            {
                "name": "Invalid Starting Step",
                "enabled": true,
                "steps": [{"type": "event", "event_category": "x", "event_action": "y", "event_name": "z"}]
            },
            {"name": "Garbage", "steps": "not-an-array"}
        ]"#
    }

    fn write_definitions(json: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(json.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_load_skips_disabled_and_malformed_entries() {
        let f = write_definitions(sample_definitions());
        let registry = FunnelRegistry::load(f.path()).unwrap();
        assert_eq!(registry.len(), 1);

        let mut rng = StdRng::seed_from_u64(1);
        let funnel = registry.select(&mut rng).unwrap();
        assert_eq!(funnel.name, "Signup Funnel");
        assert_eq!(funnel.priority, 1);
        assert_eq!(funnel.steps.len(), 3);
        assert!((funnel.steps[0].delay_seconds_max - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_reload_picks_up_changes() {
        let f = write_definitions(sample_definitions());
        let registry = FunnelRegistry::load(f.path()).unwrap();
        assert_eq!(registry.len(), 1);

        std::fs::write(f.path(), "[]").unwrap();
        registry.reload().unwrap();
        assert_eq!(registry.len(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_selection_probability_extremes() {
        let f = write_definitions(sample_definitions());
        let registry = FunnelRegistry::load(f.path()).unwrap();

        // probability 1.0: always selected
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            assert!(registry.select(&mut rng).is_some());
        }

        // probability 0.0: never selected
        let zero = write_definitions(
            r#"[{"name": "Never", "probability": 0.0,
                 "steps": [{"type": "pageview", "url": "https://example.com"}]}]"#,
        );
        let registry = FunnelRegistry::load(zero.path()).unwrap();
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            assert!(registry.select(&mut rng).is_none());
        }
    }

    #[test]
    fn test_selection_tries_priorities_in_order() {
        let f = write_definitions(
            r#"[
                {"name": "Second", "probability": 1.0, "priority": 5,
                 "steps": [{"type": "pageview", "url": "https://example.com/b"}]},
                {"name": "First", "probability": 1.0, "priority": 1,
                 "steps": [{"type": "pageview", "url": "https://example.com/a"}]}
            ]"#,
        );
        let registry = FunnelRegistry::load(f.path()).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        // both always succeed their trial; lower priority value wins
        assert_eq!(registry.select(&mut rng).unwrap().name, "First");
    }

    #[test]
    fn test_validate_rejects_bad_delay_window() {
        let funnel = Funnel {
            name: "Bad".to_string(),
            description: String::new(),
            probability: 0.5,
            priority: 0,
            enabled: true,
            exit_after_completion: true,
            steps: vec![FunnelStep {
                action: StepAction::Pageview {
                    url: "https://example.com".to_string(),
                },
                delay_seconds_min: 5.0,
                delay_seconds_max: 1.0,
            }],
        };
        assert!(matches!(funnel.validate(), Err(FunnelError::BadDelay(..))));
    }

    #[test]
    fn test_empty_registry_never_selects() {
        let registry = FunnelRegistry::empty();
        let mut rng = StdRng::seed_from_u64(3);
        assert!(registry.select(&mut rng).is_none());
    }

    fn engine_and_funnel() -> (FunnelEngine, Funnel) {
        let f = write_definitions(sample_definitions());
        let registry = FunnelRegistry::load(f.path()).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        let funnel = registry.select(&mut rng).unwrap();
        (FunnelEngine::new(Config::default()), funnel)
    }

    #[test]
    fn test_plan_produces_one_hit_per_step() {
        let (engine, funnel) = engine_and_funnel();
        let mut rng = StdRng::seed_from_u64(5);
        let run = engine.plan(&funnel, &mut rng, None);
        let plan = &run.plan;

        assert!(run.exit_after);
        assert_eq!(plan.hits.len(), funnel.steps.len());
        assert_eq!(plan.hits[0].get("new_visit"), Some("1"));

        // second step is the CTA event on the landing page
        let event = &plan.hits[1];
        assert_eq!(event.get("e_c"), Some("CTA"));
        assert_eq!(event.get("e_a"), Some("Click"));
        assert_eq!(event.get("e_n"), Some("Hero Button"));
        assert_eq!(event.get("urlref"), plan.hits[0].get("url"));
    }

    #[test]
    fn test_plan_timestamps_accumulate_delays() {
        let (engine, funnel) = engine_and_funnel();
        let mut rng = StdRng::seed_from_u64(6);
        let run = engine.plan(&funnel, &mut rng, None);

        let stamps: Vec<_> = run.plan.hits.iter().filter_map(|h| h.timestamp()).collect();
        for pair in stamps.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn test_plan_fits_inside_backfill_window() {
        let (engine, funnel) = engine_and_funnel();
        let mut rng = StdRng::seed_from_u64(7);
        let start = chrono::NaiveDate::from_ymd_opt(2024, 10, 2)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        let end = start + ChronoDuration::days(1);

        for _ in 0..20 {
            let run = engine.plan(&funnel, &mut rng, Some((start, end)));
            for hit in &run.plan.hits {
                let ts = hit.timestamp().unwrap();
                assert!(ts >= start && ts <= end);
            }
            assert!(run.plan.hits.iter().all(|h| h.pause_after_secs == 0.0));
        }
    }

    #[test]
    fn test_ecommerce_step_applies_overrides() {
        let funnel: Funnel = serde_json::from_str(
            r#"{
                "name": "Purchase",
                "steps": [
                    {"type": "pageview", "url": "https://example.com/checkout"},
                    {"type": "ecommerce", "revenue": 42.5, "currency": "EUR"}
                ]
            }"#,
        )
        .unwrap();
        funnel.validate().unwrap();

        let engine = FunnelEngine::new(Config::default());
        let mut rng = StdRng::seed_from_u64(8);
        let run = engine.plan(&funnel, &mut rng, None);

        assert!(run.exit_after); // default
        let purchase = &run.plan.hits[1];
        assert_eq!(purchase.get("idgoal"), Some("0"));
        assert_eq!(purchase.get("revenue"), Some("42.50"));
        assert_eq!(purchase.get("ec_currency"), Some("EUR"));
        // effective url chains from the checkout page
        assert_eq!(purchase.get("url"), Some("https://example.com/checkout"));
    }

    #[test]
    fn test_non_exit_funnel_hands_off_session_for_browsing() {
        let funnel: Funnel = serde_json::from_str(
            r#"{
                "name": "Teaser",
                "exit_after_completion": false,
                "steps": [
                    {"type": "pageview", "url": "https://example.com/landing"},
                    {"type": "pageview", "url": "https://example.com/features"}
                ]
            }"#,
        )
        .unwrap();
        funnel.validate().unwrap();

        let cfg = Config::default();
        let engine = FunnelEngine::new(cfg.clone());
        let mut rng = StdRng::seed_from_u64(9);
        let run = engine.plan(&funnel, &mut rng, None);
        assert!(!run.exit_after);
        assert_eq!(run.last_url.as_deref(), Some("https://example.com/features"));

        // the follow-up browsing continues the same visit
        let composer = crate::generator::visit::VisitComposer::new(cfg);
        let urls = vec!["https://example.com/pricing".to_string()];
        let follow_up =
            composer.plan_continuation(&mut rng, &urls, None, &run.ctx, run.last_url.clone());

        let first = &follow_up.hits[0];
        assert_eq!(first.get("_id"), run.plan.hits[0].get("_id"));
        assert!(first.get("new_visit").is_none());
        assert_eq!(first.get("urlref"), Some("https://example.com/features"));
        assert_eq!(follow_up.user_agent, run.plan.user_agent);
    }

    #[test]
    fn test_page_title_from_url() {
        assert_eq!(page_title("https://example.com/pricing"), "Pricing");
        assert_eq!(page_title("https://example.com/docs/getting-started"), "Getting started");
        // site roots title as Home, with or without a trailing slash
        assert_eq!(page_title("https://example.com/"), "Home");
        assert_eq!(page_title("https://example.com"), "Home");
    }
}
