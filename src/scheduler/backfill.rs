//! Historical backfill: replays traffic day by day with timestamp
//! overrides, oldest day first.
//!
//! Each day gets its own deterministically seeded RNG, so a re-run with
//! the same seed regenerates the same visits. Planning is done up front
//! per day and the resulting visits are sent concurrently, optionally
//! throttled by a visits-per-second limit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tokio::sync::{broadcast, Semaphore};

use crate::config::Config;
use crate::generator::funnel::{FunnelEngine, FunnelRegistry};
use crate::generator::visit::{VisitComposer, VisitPlan};
use crate::tracker::HitSender;

/// Hard ceiling on the backfill span, to keep a misconfigured range from
/// replaying years of history.
const MAX_BACKFILL_DAYS: i64 = 180;

#[derive(Error, Debug)]
pub enum BackfillError {
    #[error("backfill window not configured: set BACKFILL_START_DATE/BACKFILL_END_DATE or BACKFILL_DAYS_BACK/BACKFILL_DURATION_DAYS")]
    MissingWindow,
    #[error("absolute and relative backfill windows are mutually exclusive")]
    ConflictingWindow,
    #[error("invalid backfill date {0}: expected YYYY-MM-DD")]
    BadDate(String),
    #[error("backfill start {0} is after end {1}")]
    StartAfterEnd(NaiveDate, NaiveDate),
    #[error("backfill end {0} is in the future (today is {1})")]
    EndInFuture(NaiveDate, NaiveDate),
    #[error("backfill span of {0} days exceeds the {MAX_BACKFILL_DAYS}-day limit")]
    TooLong(i64),
}

/// Today's date in the configured reporting timezone.
pub fn today_in_tz(tz: Tz) -> NaiveDate {
    Utc::now().with_timezone(&tz).date_naive()
}

/// Resolve the inclusive backfill date range from config.
///
/// Exactly one form must be configured: absolute start/end dates, or a
/// relative (days back, duration) pair. The range may end on `today`
/// but not after it, and spans at most [`MAX_BACKFILL_DAYS`].
pub fn compute_backfill_window(
    cfg: &Config,
    today: NaiveDate,
) -> Result<(NaiveDate, NaiveDate), BackfillError> {
    let absolute = cfg.backfill_start_date.is_some() || cfg.backfill_end_date.is_some();
    let relative = cfg.backfill_days_back.is_some() || cfg.backfill_duration_days.is_some();

    let (start, end) = match (absolute, relative) {
        (true, true) => return Err(BackfillError::ConflictingWindow),
        (false, false) => return Err(BackfillError::MissingWindow),
        (true, false) => {
            let start = parse_date(cfg.backfill_start_date.as_deref())?;
            let end = parse_date(cfg.backfill_end_date.as_deref())?;
            (start, end)
        }
        (false, true) => {
            let days_back = cfg.backfill_days_back.ok_or(BackfillError::MissingWindow)?;
            let duration = cfg
                .backfill_duration_days
                .ok_or(BackfillError::MissingWindow)?
                .max(1);
            let start = today - Days::new(days_back as u64);
            let end = start + Days::new(duration as u64 - 1);
            (start, end)
        }
    };

    if start > end {
        return Err(BackfillError::StartAfterEnd(start, end));
    }
    if end > today {
        return Err(BackfillError::EndInFuture(end, today));
    }
    let span = (end - start).num_days() + 1;
    if span > MAX_BACKFILL_DAYS {
        return Err(BackfillError::TooLong(span));
    }
    Ok((start, end))
}

fn parse_date(s: Option<&str>) -> Result<NaiveDate, BackfillError> {
    let s = s.ok_or(BackfillError::MissingWindow)?;
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| BackfillError::BadDate(s.to_string()))
}

/// Planned visit quota for one day of the range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayPlan {
    pub date: NaiveDate,
    pub target: u64,
}

/// Apportion the per-day and total caps across the inclusive range.
///
/// Each day gets `per_day` visits until the total cap (zero means
/// unlimited) runs out; later days get the remainder, then zero.
pub fn plan_days(start: NaiveDate, end: NaiveDate, per_day: u64, total_cap: u64) -> Vec<DayPlan> {
    let mut days = Vec::new();
    let mut remaining = if total_cap == 0 { u64::MAX } else { total_cap };
    let mut date = start;
    while date <= end {
        let target = per_day.min(remaining);
        remaining -= target;
        days.push(DayPlan { date, target });
        date = date + Days::new(1);
    }
    days
}

/// One calendar day's UTC send window: local midnight to the next.
pub fn utc_window_for_day(date: NaiveDate, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let to_utc = |d: NaiveDate| {
        let local = d.and_hms_opt(0, 0, 0).expect("midnight is always valid");
        match tz.from_local_datetime(&local).earliest() {
            Some(zoned) => zoned.with_timezone(&Utc),
            // midnight skipped by a DST transition; fall back to naive UTC
            None => local.and_utc(),
        }
    };
    (to_utc(date), to_utc(date + Days::new(1)))
}

/// Outcome of one replayed day.
#[derive(Debug, Clone)]
pub struct DaySummary {
    pub date: NaiveDate,
    pub target: u64,
    pub sent: u64,
    pub skipped: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BackfillSummary {
    pub days: Vec<DaySummary>,
    pub total_sent: u64,
}

/// Replays historical traffic over the configured window.
pub struct BackfillRunner {
    cfg: Config,
    composer: Arc<VisitComposer>,
    engine: Arc<FunnelEngine>,
    funnels: Arc<FunnelRegistry>,
    sender: Arc<HitSender>,
    urls: Arc<Vec<String>>,
}

impl BackfillRunner {
    pub fn new(
        cfg: Config,
        funnels: Arc<FunnelRegistry>,
        sender: Arc<HitSender>,
        urls: Vec<String>,
    ) -> Self {
        Self {
            composer: Arc::new(VisitComposer::new(cfg.clone())),
            engine: Arc::new(FunnelEngine::new(cfg.clone())),
            cfg,
            funnels,
            sender,
            urls: Arc::new(urls),
        }
    }

    /// Run the whole backfill, oldest day first. An external shutdown
    /// stops between visits; the summary reports what was actually sent.
    pub async fn run(
        &self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<BackfillSummary, BackfillError> {
        let tz = self.cfg.timezone;
        let (start, end) = compute_backfill_window(&self.cfg, today_in_tz(tz))?;
        let days = plan_days(
            start,
            end,
            self.cfg.backfill_max_visits_per_day,
            self.cfg.backfill_max_visits_total,
        );
        let base_seed = self.cfg.backfill_seed.unwrap_or_else(rand::random);

        tracing::info!(
            start = %start,
            end = %end,
            days = days.len(),
            per_day = self.cfg.backfill_max_visits_per_day,
            seed = base_seed,
            "starting backfill"
        );

        let mut summary = BackfillSummary::default();
        'days: for (index, day) in days.iter().enumerate() {
            if shutdown.try_recv().is_ok() {
                tracing::info!("shutdown signal received, stopping backfill");
                break;
            }
            if day.target == 0 {
                tracing::info!(date = %day.date, "skipping day, total cap exhausted");
                summary.days.push(DaySummary {
                    date: day.date,
                    target: 0,
                    sent: 0,
                    skipped: true,
                });
                continue;
            }

            let mut rng = StdRng::seed_from_u64(base_seed.wrapping_add(index as u64));
            let window = utc_window_for_day(day.date, tz);
            let plans = self.plan_day(&mut rng, day.target, window);

            tracing::info!(date = %day.date, target = day.target, "replaying day");
            let sent = self.send_day(plans, &mut shutdown).await;
            summary.total_sent += sent;
            summary.days.push(DaySummary {
                date: day.date,
                target: day.target,
                sent,
                skipped: false,
            });
            tracing::info!(date = %day.date, sent, "day complete");

            if sent < day.target {
                // interrupted mid-day; don't start the next one
                break 'days;
            }
        }

        tracing::info!(
            total_sent = summary.total_sent,
            days = summary.days.len(),
            "backfill finished"
        );
        Ok(summary)
    }

    /// Plan every visit for one day from the day's seeded RNG. All
    /// randomness is drawn here, so delivery order cannot perturb the
    /// generated traffic.
    fn plan_day(
        &self,
        rng: &mut StdRng,
        target: u64,
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> Vec<VisitPlan> {
        let mut plans = Vec::with_capacity(target as usize);
        for _ in 0..target {
            if let Some(funnel) = self.funnels.select(rng) {
                let run = self.engine.plan(&funnel, rng, Some(window));
                let follow_up = (!run.exit_after).then(|| {
                    self.composer.plan_continuation(
                        rng,
                        &self.urls,
                        Some(window),
                        &run.ctx,
                        run.last_url.clone(),
                    )
                });
                plans.push(run.plan);
                plans.extend(follow_up);
            } else {
                plans.push(self.composer.plan(rng, &self.urls, Some(window)));
            }
        }
        plans
    }

    /// Send one day's plans with bounded concurrency and the optional
    /// visits-per-second throttle. Returns how many plans were dispatched.
    async fn send_day(
        &self,
        plans: Vec<VisitPlan>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> u64 {
        let semaphore = Arc::new(Semaphore::new(self.cfg.concurrency));
        // No explicit throttle falls back to the realtime target rate.
        let rate = self
            .cfg
            .backfill_rps_limit
            .unwrap_or_else(|| self.cfg.visits_per_sec())
            .max(f64::MIN_POSITIVE);
        let dispatch_gap = Duration::from_secs_f64(1.0 / rate);
        let sent = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::with_capacity(plans.len());

        for plan in plans {
            if shutdown.try_recv().is_ok() {
                break;
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };

            let composer = self.composer.clone();
            let sender = self.sender.clone();
            let sent = sent.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                composer.send(&sender, &plan).await;
                sent.fetch_add(1, Ordering::Relaxed);
            }));

            tokio::time::sleep(dispatch_gap).await;
        }

        for handle in handles {
            let _ = handle.await;
        }
        sent.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 11, 15).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_window_absolute_dates() {
        let cfg = Config {
            backfill_start_date: Some("2024-10-01".to_string()),
            backfill_end_date: Some("2024-10-07".to_string()),
            ..Default::default()
        };
        let (start, end) = compute_backfill_window(&cfg, today()).unwrap();
        assert_eq!(start, date(2024, 10, 1));
        assert_eq!(end, date(2024, 10, 7));
    }

    #[test]
    fn test_window_relative_days_back() {
        let cfg = Config {
            backfill_days_back: Some(10),
            backfill_duration_days: Some(3),
            ..Default::default()
        };
        let (start, end) = compute_backfill_window(&cfg, today()).unwrap();
        assert_eq!(start, date(2024, 11, 5));
        assert_eq!(end, date(2024, 11, 7));
    }

    #[test]
    fn test_window_forms_are_mutually_exclusive() {
        let cfg = Config {
            backfill_start_date: Some("2024-10-01".to_string()),
            backfill_days_back: Some(10),
            ..Default::default()
        };
        assert!(matches!(
            compute_backfill_window(&cfg, today()),
            Err(BackfillError::ConflictingWindow)
        ));
    }

    #[test]
    fn test_window_unconfigured_is_an_error() {
        let cfg = Config::default();
        assert!(matches!(
            compute_backfill_window(&cfg, today()),
            Err(BackfillError::MissingWindow)
        ));
    }

    #[test]
    fn test_window_may_end_today_but_not_later() {
        // ending on today itself is fine
        let cfg = Config {
            backfill_start_date: Some("2024-11-10".to_string()),
            backfill_end_date: Some("2024-11-15".to_string()),
            ..Default::default()
        };
        let (_, end) = compute_backfill_window(&cfg, today()).unwrap();
        assert_eq!(end, today());

        // tomorrow is not
        let cfg = Config {
            backfill_start_date: Some("2024-11-10".to_string()),
            backfill_end_date: Some("2024-11-16".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            compute_backfill_window(&cfg, today()),
            Err(BackfillError::EndInFuture(..))
        ));
    }

    #[test]
    fn test_window_rejects_reversed_dates() {
        let cfg = Config {
            backfill_start_date: Some("2024-10-07".to_string()),
            backfill_end_date: Some("2024-10-01".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            compute_backfill_window(&cfg, today()),
            Err(BackfillError::StartAfterEnd(..))
        ));
    }

    #[test]
    fn test_window_rejects_oversized_span() {
        let cfg = Config {
            backfill_start_date: Some("2024-01-01".to_string()),
            backfill_end_date: Some("2024-11-01".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            compute_backfill_window(&cfg, today()),
            Err(BackfillError::TooLong(_))
        ));
    }

    #[test]
    fn test_window_rejects_malformed_date() {
        let cfg = Config {
            backfill_start_date: Some("10/01/2024".to_string()),
            backfill_end_date: Some("2024-10-07".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            compute_backfill_window(&cfg, today()),
            Err(BackfillError::BadDate(_))
        ));
    }

    #[test]
    fn test_plan_days_total_cap_spills_across_days() {
        let days = plan_days(date(2024, 10, 1), date(2024, 10, 3), 100, 150);
        assert_eq!(
            days,
            vec![
                DayPlan { date: date(2024, 10, 1), target: 100 },
                DayPlan { date: date(2024, 10, 2), target: 50 },
                DayPlan { date: date(2024, 10, 3), target: 0 },
            ]
        );
    }

    #[test]
    fn test_plan_days_zero_total_cap_is_unlimited() {
        let days = plan_days(date(2024, 10, 1), date(2024, 10, 5), 1000, 0);
        assert_eq!(days.len(), 5);
        assert!(days.iter().all(|d| d.target == 1000));
    }

    #[test]
    fn test_utc_window_in_utc_is_midnight_to_midnight() {
        let (start, end) = utc_window_for_day(date(2024, 10, 2), chrono_tz::UTC);
        assert_eq!(start, date(2024, 10, 2).and_hms_opt(0, 0, 0).unwrap().and_utc());
        assert_eq!(end, date(2024, 10, 3).and_hms_opt(0, 0, 0).unwrap().and_utc());
    }

    #[test]
    fn test_utc_window_shifts_with_timezone() {
        // Berlin midnight is 22:00 UTC the previous day (CEST)
        let (start, _) = utc_window_for_day(date(2024, 7, 1), chrono_tz::Europe::Berlin);
        assert_eq!(start, date(2024, 6, 30).and_hms_opt(22, 0, 0).unwrap().and_utc());
    }

    #[test]
    fn test_day_plans_are_deterministic_for_a_seed() {
        let cfg = Config::default();
        let runner = |seed: u64| {
            let router = Arc::new(crate::target::TargetRouter::from_config(&cfg).unwrap());
            let sender = Arc::new(HitSender::new(router).unwrap());
            let runner = BackfillRunner::new(
                cfg.clone(),
                Arc::new(FunnelRegistry::empty()),
                sender,
                vec![
                    "https://example.com/".to_string(),
                    "https://example.com/pricing".to_string(),
                ],
            );
            let mut rng = StdRng::seed_from_u64(seed);
            let window = utc_window_for_day(date(2024, 10, 2), chrono_tz::UTC);
            runner.plan_day(&mut rng, 5, window)
        };

        let a = runner(42);
        let b = runner(42);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.hits.len(), y.hits.len());
            for (hx, hy) in x.hits.iter().zip(y.hits.iter()) {
                assert_eq!(hx.params, hy.params);
            }
        }
    }
}
