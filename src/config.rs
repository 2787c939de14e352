//! Configuration module for the load generator.
//!
//! Loads configuration from environment variables with sensible defaults,
//! then validates ranges and min/max pairs before anything starts.

use std::env;

use chrono_tz::Tz;
use thiserror::Error;

/// Configuration error types. All of these abort startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
    #[error("{0} ({1}) cannot be greater than {2} ({3})")]
    MinOverMax(&'static str, f64, &'static str, f64),
    #[error("{0} must be between 0.0 and 1.0, got {1}")]
    Probability(&'static str, f64),
    #[error("unknown timezone: {0}")]
    Timezone(String),
    #[error("MATOMO_URL must start with http:// or https://, got {0}")]
    TrackerUrl(String),
}

/// Load generator configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Matomo tracking endpoint (single-target fallback).
    pub matomo_url: String,
    pub site_id: u32,
    pub token_auth: Option<String>,
    pub urls_file: String,
    pub funnels_file: Option<String>,

    // Pacing
    pub target_visits_per_day: f64,
    pub concurrency: usize,
    pub pageviews_min: u32,
    pub pageviews_max: u32,
    pub pause_between_pvs_min: f64,
    pub pause_between_pvs_max: f64,
    pub visit_duration_min: f64,
    pub visit_duration_max: f64,

    // Admission control and auto-stop
    pub auto_stop_after_hours: f64,
    pub max_visits_per_day: u64,
    pub max_total_visits: u64,

    // Action probabilities
    pub sitesearch_probability: f64,
    pub outlinks_probability: f64,
    pub downloads_probability: f64,
    pub click_events_probability: f64,
    pub random_events_probability: f64,
    pub direct_traffic_probability: f64,
    pub ecommerce_probability: f64,

    // Geolocation
    pub randomize_visitor_countries: bool,
    pub timezone: Tz,

    // Ecommerce
    pub ecommerce_order_value_min: f64,
    pub ecommerce_order_value_max: f64,
    pub ecommerce_items_min: u32,
    pub ecommerce_items_max: u32,
    pub ecommerce_tax_rate: f64,
    pub ecommerce_shipping_rates: Vec<f64>,
    pub ecommerce_currency: String,

    // Backfill
    pub backfill_enabled: bool,
    pub backfill_start_date: Option<String>,
    pub backfill_end_date: Option<String>,
    pub backfill_days_back: Option<u32>,
    pub backfill_duration_days: Option<u32>,
    pub backfill_max_visits_per_day: u64,
    pub backfill_max_visits_total: u64,
    pub backfill_rps_limit: Option<f64>,
    pub backfill_seed: Option<u64>,

    /// Raw multi-target JSON blob, parsed by the target module.
    pub multi_target_config: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            matomo_url: "https://matomo.example.com/matomo.php".to_string(),
            site_id: 1,
            token_auth: None,
            urls_file: "/config/urls.txt".to_string(),
            funnels_file: None,
            target_visits_per_day: 20000.0,
            concurrency: 50,
            pageviews_min: 3,
            pageviews_max: 6,
            pause_between_pvs_min: 0.5,
            pause_between_pvs_max: 2.0,
            visit_duration_min: 1.0,
            visit_duration_max: 8.0,
            auto_stop_after_hours: 0.0,
            max_visits_per_day: 0,
            max_total_visits: 0,
            sitesearch_probability: 0.15,
            outlinks_probability: 0.10,
            downloads_probability: 0.08,
            click_events_probability: 0.25,
            random_events_probability: 0.12,
            direct_traffic_probability: 0.30,
            ecommerce_probability: 0.05,
            randomize_visitor_countries: true,
            timezone: chrono_tz::UTC,
            ecommerce_order_value_min: 15.99,
            ecommerce_order_value_max: 299.99,
            ecommerce_items_min: 1,
            ecommerce_items_max: 3,
            ecommerce_tax_rate: 0.08,
            ecommerce_shipping_rates: vec![0.0, 4.99, 9.99],
            ecommerce_currency: "USD".to_string(),
            backfill_enabled: false,
            backfill_start_date: None,
            backfill_end_date: None,
            backfill_days_back: None,
            backfill_duration_days: None,
            backfill_max_visits_per_day: 1000,
            backfill_max_visits_total: 0,
            backfill_rps_limit: None,
            backfill_seed: None,
            multi_target_config: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(s) if !s.trim().is_empty() => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(key, s)),
        _ => Ok(None),
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl Config {
    /// Load configuration from environment variables and validate it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(url) = env_string("MATOMO_URL") {
            cfg.matomo_url = url.trim_end_matches('/').to_string();
        }
        if let Some(v) = env_parse("MATOMO_SITE_ID")? {
            cfg.site_id = v;
        }
        cfg.token_auth = env_string("MATOMO_TOKEN_AUTH");
        if let Some(v) = env_string("URLS_FILE") {
            cfg.urls_file = v;
        }
        cfg.funnels_file = env_string("FUNNELS_FILE");

        if let Some(v) = env_parse("TARGET_VISITS_PER_DAY")? {
            cfg.target_visits_per_day = v;
        }
        if let Some(v) = env_parse("CONCURRENCY")? {
            cfg.concurrency = v;
        }
        if let Some(v) = env_parse("PAGEVIEWS_MIN")? {
            cfg.pageviews_min = v;
        }
        if let Some(v) = env_parse("PAGEVIEWS_MAX")? {
            cfg.pageviews_max = v;
        }
        if let Some(v) = env_parse("PAUSE_BETWEEN_PVS_MIN")? {
            cfg.pause_between_pvs_min = v;
        }
        if let Some(v) = env_parse("PAUSE_BETWEEN_PVS_MAX")? {
            cfg.pause_between_pvs_max = v;
        }
        if let Some(v) = env_parse("VISIT_DURATION_MIN")? {
            cfg.visit_duration_min = v;
        }
        if let Some(v) = env_parse("VISIT_DURATION_MAX")? {
            cfg.visit_duration_max = v;
        }

        if let Some(v) = env_parse("AUTO_STOP_AFTER_HOURS")? {
            cfg.auto_stop_after_hours = v;
        }
        if let Some(v) = env_parse("MAX_VISITS_PER_DAY")? {
            cfg.max_visits_per_day = v;
        }
        if let Some(v) = env_parse("MAX_TOTAL_VISITS")? {
            cfg.max_total_visits = v;
        }

        if let Some(v) = env_parse("SITESEARCH_PROBABILITY")? {
            cfg.sitesearch_probability = v;
        }
        if let Some(v) = env_parse("OUTLINKS_PROBABILITY")? {
            cfg.outlinks_probability = v;
        }
        if let Some(v) = env_parse("DOWNLOADS_PROBABILITY")? {
            cfg.downloads_probability = v;
        }
        if let Some(v) = env_parse("CLICK_EVENTS_PROBABILITY")? {
            cfg.click_events_probability = v;
        }
        if let Some(v) = env_parse("RANDOM_EVENTS_PROBABILITY")? {
            cfg.random_events_probability = v;
        }
        if let Some(v) = env_parse("DIRECT_TRAFFIC_PROBABILITY")? {
            cfg.direct_traffic_probability = v;
        }
        if let Some(v) = env_parse("ECOMMERCE_PROBABILITY")? {
            cfg.ecommerce_probability = v;
        }

        if let Some(v) = env_string("RANDOMIZE_VISITOR_COUNTRIES") {
            cfg.randomize_visitor_countries = v.to_lowercase() == "true";
        }
        if let Some(v) = env_string("TIMEZONE") {
            cfg.timezone = v.parse().map_err(|_| ConfigError::Timezone(v))?;
        }

        if let Some(v) = env_parse("ECOMMERCE_ORDER_VALUE_MIN")? {
            cfg.ecommerce_order_value_min = v;
        }
        if let Some(v) = env_parse("ECOMMERCE_ORDER_VALUE_MAX")? {
            cfg.ecommerce_order_value_max = v;
        }
        if let Some(v) = env_parse("ECOMMERCE_ITEMS_MIN")? {
            cfg.ecommerce_items_min = v;
        }
        if let Some(v) = env_parse("ECOMMERCE_ITEMS_MAX")? {
            cfg.ecommerce_items_max = v;
        }
        if let Some(v) = env_parse("ECOMMERCE_TAX_RATE")? {
            cfg.ecommerce_tax_rate = v;
        }
        if let Some(v) = env_string("ECOMMERCE_SHIPPING_RATES") {
            let mut rates = Vec::new();
            for part in v.split(',') {
                let rate: f64 = part
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::Invalid("ECOMMERCE_SHIPPING_RATES", v.clone()))?;
                if rate < 0.0 {
                    return Err(ConfigError::Invalid("ECOMMERCE_SHIPPING_RATES", v.clone()));
                }
                rates.push(rate);
            }
            if !rates.is_empty() {
                cfg.ecommerce_shipping_rates = rates;
            }
        }
        if let Some(v) = env_string("ECOMMERCE_CURRENCY") {
            cfg.ecommerce_currency = v;
        }

        if let Some(v) = env_string("BACKFILL_ENABLED") {
            cfg.backfill_enabled = v.to_lowercase() == "true";
        }
        cfg.backfill_start_date = env_string("BACKFILL_START_DATE");
        cfg.backfill_end_date = env_string("BACKFILL_END_DATE");
        cfg.backfill_days_back = env_parse("BACKFILL_DAYS_BACK")?;
        cfg.backfill_duration_days = env_parse("BACKFILL_DURATION_DAYS")?;
        if let Some(v) = env_parse("BACKFILL_MAX_VISITS_PER_DAY")? {
            cfg.backfill_max_visits_per_day = v;
        }
        if let Some(v) = env_parse("BACKFILL_MAX_VISITS_TOTAL")? {
            cfg.backfill_max_visits_total = v;
        }
        cfg.backfill_rps_limit = env_parse("BACKFILL_RPS_LIMIT")?;
        cfg.backfill_seed = env_parse("BACKFILL_SEED")?;

        cfg.multi_target_config = env_string("MULTI_TARGET_CONFIG");

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate range constraints and min/max pairs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.matomo_url.starts_with("http://") && !self.matomo_url.starts_with("https://") {
            return Err(ConfigError::TrackerUrl(self.matomo_url.clone()));
        }
        if self.site_id < 1 {
            return Err(ConfigError::Invalid("MATOMO_SITE_ID", self.site_id.to_string()));
        }
        if self.target_visits_per_day < 1.0 {
            return Err(ConfigError::Invalid(
                "TARGET_VISITS_PER_DAY",
                self.target_visits_per_day.to_string(),
            ));
        }
        if self.concurrency < 1 || self.concurrency > 500 {
            return Err(ConfigError::Invalid("CONCURRENCY", self.concurrency.to_string()));
        }
        if self.pageviews_min < 1 {
            return Err(ConfigError::Invalid("PAGEVIEWS_MIN", self.pageviews_min.to_string()));
        }
        if self.pageviews_min > self.pageviews_max {
            return Err(ConfigError::MinOverMax(
                "PAGEVIEWS_MIN",
                self.pageviews_min as f64,
                "PAGEVIEWS_MAX",
                self.pageviews_max as f64,
            ));
        }
        if self.pause_between_pvs_min > self.pause_between_pvs_max {
            return Err(ConfigError::MinOverMax(
                "PAUSE_BETWEEN_PVS_MIN",
                self.pause_between_pvs_min,
                "PAUSE_BETWEEN_PVS_MAX",
                self.pause_between_pvs_max,
            ));
        }
        if self.visit_duration_min > self.visit_duration_max {
            return Err(ConfigError::MinOverMax(
                "VISIT_DURATION_MIN",
                self.visit_duration_min,
                "VISIT_DURATION_MAX",
                self.visit_duration_max,
            ));
        }
        if self.ecommerce_order_value_min <= 0.0 {
            return Err(ConfigError::Invalid(
                "ECOMMERCE_ORDER_VALUE_MIN",
                self.ecommerce_order_value_min.to_string(),
            ));
        }
        if self.ecommerce_order_value_min > self.ecommerce_order_value_max {
            return Err(ConfigError::MinOverMax(
                "ECOMMERCE_ORDER_VALUE_MIN",
                self.ecommerce_order_value_min,
                "ECOMMERCE_ORDER_VALUE_MAX",
                self.ecommerce_order_value_max,
            ));
        }
        if self.ecommerce_items_min < 1 || self.ecommerce_items_min > self.ecommerce_items_max {
            return Err(ConfigError::MinOverMax(
                "ECOMMERCE_ITEMS_MIN",
                self.ecommerce_items_min as f64,
                "ECOMMERCE_ITEMS_MAX",
                self.ecommerce_items_max as f64,
            ));
        }
        if !(0.0..=1.0).contains(&self.ecommerce_tax_rate) {
            return Err(ConfigError::Invalid(
                "ECOMMERCE_TAX_RATE",
                self.ecommerce_tax_rate.to_string(),
            ));
        }
        if self.ecommerce_currency.len() != 3
            || !self.ecommerce_currency.chars().all(|c| c.is_ascii_uppercase())
        {
            return Err(ConfigError::Invalid(
                "ECOMMERCE_CURRENCY",
                self.ecommerce_currency.clone(),
            ));
        }

        for (name, p) in [
            ("SITESEARCH_PROBABILITY", self.sitesearch_probability),
            ("OUTLINKS_PROBABILITY", self.outlinks_probability),
            ("DOWNLOADS_PROBABILITY", self.downloads_probability),
            ("CLICK_EVENTS_PROBABILITY", self.click_events_probability),
            ("RANDOM_EVENTS_PROBABILITY", self.random_events_probability),
            ("DIRECT_TRAFFIC_PROBABILITY", self.direct_traffic_probability),
            ("ECOMMERCE_PROBABILITY", self.ecommerce_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::Probability(name, p));
            }
        }

        if let Some(rps) = self.backfill_rps_limit {
            if rps <= 0.0 {
                return Err(ConfigError::Invalid("BACKFILL_RPS_LIMIT", rps.to_string()));
            }
        }
        if self.backfill_max_visits_per_day < 1 {
            return Err(ConfigError::Invalid(
                "BACKFILL_MAX_VISITS_PER_DAY",
                self.backfill_max_visits_per_day.to_string(),
            ));
        }

        Ok(())
    }

    /// Target rate in visits per second.
    pub fn visits_per_sec(&self) -> f64 {
        self.target_visits_per_day / 86400.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.site_id, 1);
        assert_eq!(cfg.concurrency, 50);
        assert!((cfg.visits_per_sec() - 20000.0 / 86400.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_swapped_pageview_bounds() {
        let cfg = Config {
            pageviews_min: 6,
            pageviews_max: 3,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::MinOverMax(..))));
    }

    #[test]
    fn test_rejects_out_of_range_probability() {
        let cfg = Config {
            sitesearch_probability: 1.5,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Probability(..))));
    }

    #[test]
    fn test_rejects_bad_tracker_url() {
        let cfg = Config {
            matomo_url: "ftp://example.com/matomo.php".to_string(),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::TrackerUrl(_))));
    }

    #[test]
    fn test_rejects_swapped_visit_duration() {
        let cfg = Config {
            visit_duration_min: 9.0,
            visit_duration_max: 2.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_currency_must_be_three_uppercase_letters() {
        let cfg = Config {
            ecommerce_currency: "usd".to_string(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
