//! Realtime scheduler: paces visit starts at the configured daily rate
//! and fans the work out to a bounded pool of visit workers.
//!
//! The producer runs a token bucket topped up every 250ms; each whole
//! token admits one visit into a bounded queue. Workers pull jobs, pick
//! a funnel or a random visit, and send it with realtime pacing. A
//! `Stop` sentinel per worker drains the pool on shutdown.

pub mod backfill;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::config::Config;
use crate::generator::funnel::{FunnelEngine, FunnelRegistry};
use crate::generator::visit::VisitComposer;
use crate::tracker::HitSender;

/// Producer tick; tokens accrue in quarter-second slices.
const TICK: Duration = Duration::from_millis(250);

/// Interval between progress log lines.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// One unit of work for a visit worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Visit,
    Stop,
}

/// Final accounting for a realtime run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub total_visits: u64,
    pub elapsed_seconds: f64,
    /// What the achieved pace extrapolates to over 24 hours.
    pub implied_daily_rate: f64,
}

/// Accrue tokens for `dt` at `rate` visits/sec, capped at `cap`.
///
/// The cap bounds burst size after a stall: a long pause never admits
/// more than one queue's worth of visits at once.
fn accrue_tokens(tokens: f64, rate: f64, dt: f64, cap: f64) -> f64 {
    (tokens + rate * dt).min(cap)
}

/// Rolling 24-hour admission window for the daily visit cap.
#[derive(Debug, Clone)]
pub struct DailyWindow {
    window_start: DateTime<Utc>,
    sent: u64,
}

impl DailyWindow {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            window_start: now,
            sent: 0,
        }
    }

    /// True when the cap is exhausted for the current window. A zero cap
    /// means unlimited. The window rolls forward once 24 hours elapse.
    pub fn cap_reached(&mut self, now: DateTime<Utc>, cap: u64) -> bool {
        if cap == 0 {
            return false;
        }
        if now - self.window_start >= chrono::Duration::hours(24) {
            self.window_start = now;
            self.sent = 0;
        }
        self.sent >= cap
    }

    pub fn record(&mut self) {
        self.sent += 1;
    }
}

/// Drives the realtime load: one producer, `concurrency` workers.
pub struct Scheduler {
    cfg: Config,
    composer: Arc<VisitComposer>,
    engine: Arc<FunnelEngine>,
    funnels: Arc<FunnelRegistry>,
    sender: Arc<HitSender>,
    urls: Arc<Vec<String>>,
}

impl Scheduler {
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

    /// Run until a stop condition fires: external shutdown, the auto-stop
    /// deadline, or the total visit cap.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> RunSummary {
        let concurrency = self.cfg.concurrency;
        let rate = self.cfg.visits_per_sec();
        let (tx, rx) = mpsc::channel::<Job>(concurrency * 2);
        let rx = Arc::new(Mutex::new(rx));
        let completed = Arc::new(AtomicU64::new(0));

        tracing::info!(
            rate_per_sec = format!("{rate:.4}"),
            concurrency,
            "starting realtime scheduler"
        );

        let mut workers = Vec::with_capacity(concurrency);
        for id in 0..concurrency {
            workers.push(tokio::spawn(run_worker(
                id,
                rx.clone(),
                self.composer.clone(),
                self.engine.clone(),
                self.funnels.clone(),
                self.sender.clone(),
                self.urls.clone(),
                completed.clone(),
            )));
        }

        let started = Instant::now();
        let deadline = (self.cfg.auto_stop_after_hours > 0.0)
            .then(|| started + Duration::from_secs_f64(self.cfg.auto_stop_after_hours * 3600.0));
        let max_total = self.cfg.max_total_visits;

        let mut tokens = 0.0f64;
        let mut scheduled: u64 = 0;
        let mut daily = DailyWindow::new(Utc::now());
        let mut last_tick = Instant::now();
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut stats = tokio::time::interval_at(
            tokio::time::Instant::now() + STATS_INTERVAL,
            STATS_INTERVAL,
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("shutdown signal received, draining workers");
                    break;
                }
                _ = tick.tick() => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            tracing::info!(
                                hours = self.cfg.auto_stop_after_hours,
                                "auto-stop deadline reached"
                            );
                            break;
                        }
                    }
                    if max_total > 0 && scheduled >= max_total {
                        tracing::info!(max_total, "total visit cap reached");
                        break;
                    }

                    let now = Instant::now();
                    let dt = now.duration_since(last_tick).as_secs_f64();
                    last_tick = now;
                    tokens = accrue_tokens(tokens, rate, dt, concurrency as f64);

                    while tokens >= 1.0 {
                        if max_total > 0 && scheduled >= max_total {
                            break;
                        }
                        if daily.cap_reached(Utc::now(), self.cfg.max_visits_per_day) {
                            tracing::debug!("daily cap reached, holding admissions");
                            break;
                        }
                        match tx.try_send(Job::Visit) {
                            Ok(()) => {
                                tokens -= 1.0;
                                scheduled += 1;
                                daily.record();
                            }
                            // queue full: workers are saturated, keep the
                            // tokens and retry next tick
                            Err(_) => break,
                        }
                    }
                }
                _ = stats.tick() => {
                    let done = completed.load(Ordering::Relaxed);
                    let elapsed = started.elapsed().as_secs_f64();
                    let queue_depth = tx.max_capacity() - tx.capacity();
                    tracing::info!(
                        scheduled,
                        completed = done,
                        queue_depth,
                        implied_daily_rate = format!("{:.0}", done as f64 / elapsed * 86400.0),
                        "scheduler progress"
                    );
                }
            }
        }

        for _ in 0..concurrency {
            let _ = tx.send(Job::Stop).await;
        }
        drop(tx);
        for handle in workers {
            let _ = handle.await;
        }

        let total_visits = completed.load(Ordering::Relaxed);
        let elapsed_seconds = started.elapsed().as_secs_f64();
        let implied_daily_rate = if elapsed_seconds > 0.0 {
            total_visits as f64 / elapsed_seconds * 86400.0
        } else {
            0.0
        };
        tracing::info!(
            total_visits,
            elapsed_seconds = format!("{elapsed_seconds:.1}"),
            implied_daily_rate = format!("{implied_daily_rate:.0}"),
            "realtime run finished"
        );

        RunSummary {
            total_visits,
            elapsed_seconds,
            implied_daily_rate,
        }
    }
}

/// Pull jobs until a `Stop` sentinel or channel close. The completion
/// counter advances for every visit regardless of delivery outcome.
#[allow(clippy::too_many_arguments)]
async fn run_worker(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    composer: Arc<VisitComposer>,
    engine: Arc<FunnelEngine>,
    funnels: Arc<FunnelRegistry>,
    sender: Arc<HitSender>,
    urls: Arc<Vec<String>>,
    completed: Arc<AtomicU64>,
) {
    let mut rng = StdRng::from_entropy();

    loop {
        let job = { rx.lock().await.recv().await };
        match job {
            Some(Job::Visit) => {
                if let Some(funnel) = funnels.select(&mut rng) {
                    tracing::debug!(worker = id, funnel = %funnel.name, "running funnel visit");
                    let run = engine.plan(&funnel, &mut rng, None);
                    composer.send(&sender, &run.plan).await;
                    if !run.exit_after {
                        let plan = composer.plan_continuation(
                            &mut rng,
                            &urls,
                            None,
                            &run.ctx,
                            run.last_url.clone(),
                        );
                        composer.send(&sender, &plan).await;
                    }
                } else {
                    let plan = composer.plan(&mut rng, &urls, None);
                    composer.send(&sender, &plan).await;
                }
                completed.fetch_add(1, Ordering::Relaxed);
            }
            Some(Job::Stop) | None => break,
        }
    }
    tracing::debug!(worker = id, "worker exited");
}
