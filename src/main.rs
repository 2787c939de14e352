//! Matomo load generator.
//!
//! Synthesizes realistic visitor traffic against one or more Matomo
//! tracking endpoints: realtime paced load, or a seeded historical
//! backfill with timestamp overrides.

mod config;
mod generator;
mod scheduler;
mod target;
mod tracker;

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use generator::funnel::FunnelRegistry;
use scheduler::backfill::BackfillRunner;
use scheduler::Scheduler;
use target::TargetRouter;
use tracker::HitSender;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("matomo_loadgen=info".parse()?))
        .init();

    let cfg = Config::from_env()?;
    tracing::info!(
        site_id = cfg.site_id,
        target_visits_per_day = cfg.target_visits_per_day,
        concurrency = cfg.concurrency,
        "configuration loaded"
    );

    let urls = generator::load_urls(&cfg.urls_file)?;
    tracing::info!(count = urls.len(), file = %cfg.urls_file, "loaded page URLs");

    let router = Arc::new(TargetRouter::from_config(&cfg)?);
    let routing = router.report();
    tracing::info!(
        targets = routing.enabled_targets,
        strategy = %routing.strategy,
        "target routing ready"
    );
    let sender = Arc::new(HitSender::new(router.clone())?);

    let funnels = match &cfg.funnels_file {
        Some(path) => Arc::new(FunnelRegistry::load(path)?),
        None => Arc::new(FunnelRegistry::empty()),
    };

    // Ctrl-C fans out to the active run through a broadcast channel.
    let (stop_tx, stop_rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            let _ = stop_tx.send(());
        }
    });

    if cfg.backfill_enabled {
        let runner = BackfillRunner::new(cfg, funnels, sender.clone(), urls);
        let summary = runner.run(stop_rx).await?;
        tracing::info!(
            total_sent = summary.total_sent,
            days = summary.days.len(),
            "backfill summary"
        );
    } else {
        let scheduler = Scheduler::new(cfg, funnels, sender.clone(), urls);
        let summary = scheduler.run(stop_rx).await;
        tracing::info!(
            total_visits = summary.total_visits,
            implied_daily_rate = format!("{:.0}", summary.implied_daily_rate),
            "run summary"
        );
    }

    let report = sender.router().report();
    for (name, t) in &report.per_target {
        tracing::info!(
            target = %name,
            status = ?t.status,
            successes = t.successes,
            failures = t.failures,
            avg_latency_ms = t.avg_latency_ms.map(|l| format!("{l:.1}")).unwrap_or_default(),
            "target health"
        );
    }

    Ok(())
}
