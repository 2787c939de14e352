//! The visit composer: builds the ordered hit sequence for one simulated
//! visitor session.
//!
//! Planning is pure with respect to the supplied RNG so backfill runs can
//! be seeded deterministically; sending performs the network I/O and the
//! realtime pacing sleeps.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use url::Url;

use crate::config::Config;
use crate::generator::{self, data, EcommerceOrder, VisitContext};
use crate::tracker::{format_cdt, Hit, HitKind, HitSender};

/// Pageview indices (1-based) chosen for each optional action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionPages {
    pub search: Option<u32>,
    pub outlink: Option<u32>,
    pub download: Option<u32>,
    pub click_event: Option<u32>,
    pub random_event: Option<u32>,
}

/// Choose pageview indices for the optional actions.
///
/// Guarantees: with `num_pvs <= 1` every action is disabled; otherwise any
/// chosen index is in the inclusive range `[2, num_pvs]` so an action never
/// lands on the first pageview.
pub fn choose_action_pages(
    rng: &mut impl Rng,
    num_pvs: u32,
    want_search: bool,
    want_outlink: bool,
    want_download: bool,
    want_click_event: bool,
    want_random_event: bool,
) -> ActionPages {
    if num_pvs <= 1 {
        return ActionPages::default();
    }

    let mut pick = |want: bool| want.then(|| rng.gen_range(2..=num_pvs));

    ActionPages {
        search: pick(want_search),
        outlink: pick(want_outlink),
        download: pick(want_download),
        click_event: pick(want_click_event),
        random_event: pick(want_random_event),
    }
}

/// A fully planned visit, ready to send.
#[derive(Debug, Clone)]
pub struct VisitPlan {
    pub user_agent: &'static str,
    pub hits: Vec<Hit>,
}

/// Composes and sends simulated visitor sessions.
pub struct VisitComposer {
    cfg: Config,
}

impl VisitComposer {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    /// Plan one visit. When `window` is given (backfill), every timestamp
    /// is placed inside it; otherwise the sequence ends "now" and pacing
    /// pauses are attached for realtime sending.
    pub fn plan(
        &self,
        rng: &mut impl Rng,
        urls: &[String],
        window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> VisitPlan {
        let ctx = VisitContext::new(&self.cfg, rng);
        let entry_referrer = ctx.referrer.clone();
        self.plan_session(rng, urls, window, &ctx, entry_referrer, true)
    }

    /// Continue an existing visitor's session with ordinary browsing:
    /// same visitor id, no new-visit marker, referrer chained from the
    /// page the visitor was last on.
    pub fn plan_continuation(
        &self,
        rng: &mut impl Rng,
        urls: &[String],
        window: Option<(DateTime<Utc>, DateTime<Utc>)>,
        ctx: &VisitContext,
        entry_referrer: Option<String>,
    ) -> VisitPlan {
        self.plan_session(rng, urls, window, ctx, entry_referrer, false)
    }

    fn plan_session(
        &self,
        rng: &mut impl Rng,
        urls: &[String],
        window: Option<(DateTime<Utc>, DateTime<Utc>)>,
        ctx: &VisitContext,
        entry_referrer: Option<String>,
        new_visit: bool,
    ) -> VisitPlan {
        let cfg = &self.cfg;
        let num_pvs = rng.gen_range(cfg.pageviews_min..=cfg.pageviews_max);

        let want_search = rng.gen::<f64>() < cfg.sitesearch_probability;
        let want_outlink = rng.gen::<f64>() < cfg.outlinks_probability;
        let want_download = rng.gen::<f64>() < cfg.downloads_probability;
        let want_click = rng.gen::<f64>() < cfg.click_events_probability;
        let want_random = rng.gen::<f64>() < cfg.random_events_probability;
        let pages = choose_action_pages(
            rng,
            num_pvs,
            want_search,
            want_outlink,
            want_download,
            want_click,
            want_random,
        );
        let order = generator::maybe_order(cfg, rng);

        // Dwell time is apportioned across pageviews by random weights so
        // the full sequence spans the drawn visit duration.
        let mut duration_secs =
            rng.gen_range(cfg.visit_duration_min * 60.0..=cfg.visit_duration_max * 60.0);
        let weights: Vec<f64> = (0..num_pvs).map(|_| rng.gen_range(0.5..1.5)).collect();
        let weight_sum: f64 = weights.iter().sum();

        let realtime = window.is_none();
        let base = match window {
            Some((start, end)) => {
                let window_secs = (end - start).num_seconds().max(1) as f64;
                if duration_secs >= window_secs {
                    duration_secs = window_secs * 0.9;
                }
                let slack = (window_secs - duration_secs).max(0.0);
                start + ChronoDuration::milliseconds((rng.gen_range(0.0..=slack) * 1000.0) as i64)
            }
            None => Utc::now() - ChronoDuration::milliseconds((duration_secs * 1000.0) as i64),
        };
        let page_dwell: Vec<f64> = weights
            .iter()
            .map(|w| duration_secs * w / weight_sum)
            .collect();

        let mut hits = Vec::with_capacity(num_pvs as usize + 1);
        let mut ts = base;
        let mut last_page_url: Option<String> = None;
        let mut last_pv_id = generator::rand_hex(rng, 6);
        let mut paused_total = 0.0;

        for i in 0..num_pvs {
            let pv = i + 1;
            let page_url = urls
                .choose(rng)
                .cloned()
                .unwrap_or_else(|| "https://example.com/".to_string());
            let pv_id = generator::rand_hex(rng, 6);
            last_pv_id = pv_id.clone();

            let mut hit = Hit::new(HitKind::Pageview);
            hit.push("_id", ctx.visitor_id.clone());
            hit.push("rand", generator::rand_nonce(rng).to_string());
            hit.push("cdt", format_cdt(ts));
            hit.push("url", page_url.clone());
            hit.push("pv_id", pv_id);
            hit.push("action_name", format!("LoadTest PV {pv}/{num_pvs}"));

            if i == 0 {
                if new_visit {
                    hit.push("new_visit", "1");
                }
                if let Some(referrer) = &entry_referrer {
                    hit.push("urlref", referrer.clone());
                }
            } else if let Some(prev) = &last_page_url {
                hit.push("urlref", prev.clone());
            }

            // One action per pageview; collisions resolved by fixed
            // precedence: search > outlink > download > click > random.
            if pages.search == Some(pv) {
                apply_site_search(&mut hit, rng);
            } else if pages.outlink == Some(pv) {
                apply_outlink(&mut hit, rng, &page_url);
            } else if pages.download == Some(pv) {
                apply_download(&mut hit, rng, &page_url);
            } else if pages.click_event == Some(pv) {
                apply_event(&mut hit, rng, data::CLICK_EVENTS);
            } else if pages.random_event == Some(pv) {
                apply_event(&mut hit, rng, data::RANDOM_EVENTS);
            }

            if pv == num_pvs {
                if let Some(order) = &order {
                    apply_ecommerce(&mut hit, order);
                }
            }

            if let Some((_, ip)) = &ctx.geo {
                hit.push("cip", ip.to_string());
            }

            if realtime {
                if pv < num_pvs {
                    let pause =
                        rng.gen_range(cfg.pause_between_pvs_min..=cfg.pause_between_pvs_max);
                    hit.pause_after_secs = pause;
                    paused_total += pause;
                } else {
                    // Simulate the visitor lingering on the last page
                    // before the ping goes out.
                    hit.pause_after_secs = (duration_secs - paused_total).max(0.0);
                }
            }

            // Outlink/download hits point at the clicked href, but the
            // tracked "last page" stays on the containing page.
            last_page_url = Some(page_url);
            ts += ChronoDuration::milliseconds((page_dwell[i as usize] * 1000.0) as i64);
            hits.push(hit);
        }

        // Final ping extends the last page's dwell time; its timestamp is
        // the last pageview time plus that page's dwell share.
        let mut ping = Hit::new(HitKind::Ping);
        ping.push("_id", ctx.visitor_id.clone());
        ping.push("rand", generator::rand_nonce(rng).to_string());
        ping.push("cdt", format_cdt(ts));
        if let Some(page) = &last_page_url {
            ping.push("url", page.clone());
        }
        ping.push("pv_id", last_pv_id);
        ping.push("ping", "1");
        if let Some((_, ip)) = &ctx.geo {
            ping.push("cip", ip.to_string());
        }
        hits.push(ping);

        VisitPlan {
            user_agent: ctx.user_agent,
            hits,
        }
    }

    /// Send a planned visit, best-effort: per-hit failures are already
    /// counted in the target metrics and are not propagated.
    pub async fn send(&self, sender: &HitSender, plan: &VisitPlan) {
        for hit in &plan.hits {
            match hit.kind {
                HitKind::Outlink => tracing::info!(
                    link = hit.get("link").unwrap_or(""),
                    referrer = hit.get("urlref").unwrap_or(""),
                    "sending outlink hit"
                ),
                HitKind::Download => tracing::info!(
                    file = hit.get("download").unwrap_or(""),
                    referrer = hit.get("urlref").unwrap_or(""),
                    "sending download hit"
                ),
                _ => tracing::debug!(
                    action = hit.get("action_name").unwrap_or("ping"),
                    "sending hit"
                ),
            }

            if let Err(e) = sender.send(hit, plan.user_agent).await {
                tracing::debug!("hit delivery failed: {e}");
            }

            if hit.pause_after_secs > 0.0 {
                tokio::time::sleep(std::time::Duration::from_secs_f64(hit.pause_after_secs)).await;
            }
        }
    }

    /// Plan and send one visit.
    pub async fn compose_and_send(
        &self,
        sender: &HitSender,
        rng: &mut (impl Rng + Send),
        urls: &[String],
        window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) {
        let plan = self.plan(rng, urls, window);
        self.send(sender, &plan).await;
    }
}

fn apply_site_search(hit: &mut Hit, rng: &mut impl Rng) {
    hit.kind = HitKind::SiteSearch;
    let keyword = data::SEARCH_TERMS.choose(rng).copied().unwrap_or("search");
    hit.push("search", keyword);
    if rng.gen::<f64>() < 0.3 {
        if let Some(cat) = data::SEARCH_CATEGORIES.choose(rng) {
            hit.push("search_cat", *cat);
        }
    }
    hit.push("search_count", rng.gen_range(0..=25u32).to_string());
    set_action_name(hit, format!("Search: {keyword}"));
}

fn apply_outlink(hit: &mut Hit, rng: &mut impl Rng, page_url: &str) {
    hit.kind = HitKind::Outlink;
    let link = data::OUTLINKS.choose(rng).copied().unwrap_or(data::OUTLINKS[0]);
    // The tracked url carries the clicked href; urlref points at the page
    // that contained the link.
    set_param(hit, "url", link.to_string());
    set_param(hit, "urlref", page_url.to_string());
    hit.push("link", link);
    set_action_name(hit, format!("Outlink: {link}"));
}

fn apply_download(hit: &mut Hit, rng: &mut impl Rng, page_url: &str) {
    hit.kind = HitKind::Download;
    let file = data::DOWNLOADS.choose(rng).copied().unwrap_or(data::DOWNLOADS[0]);
    let download_url = resolve_download_url(page_url, file);
    set_param(hit, "url", download_url.clone());
    set_param(hit, "urlref", page_url.to_string());
    hit.push("download", download_url.clone());
    let file_name = download_url.rsplit('/').next().unwrap_or(&download_url);
    set_action_name(hit, format!("Download: {file_name}"));
}

/// Resolve a relative download path against the page that carried the link.
fn resolve_download_url(page_url: &str, file: &str) -> String {
    if file.starts_with("http://") || file.starts_with("https://") {
        return file.to_string();
    }
    match Url::parse(page_url).and_then(|base| base.join(file)) {
        Ok(joined) => joined.to_string(),
        Err(_) => file.to_string(),
    }
}

fn apply_event(hit: &mut Hit, rng: &mut impl Rng, table: &[data::EventDef]) {
    hit.kind = HitKind::Event;
    let Some(event) = table.choose(rng) else {
        return;
    };
    hit.push("e_c", event.category);
    hit.push("e_a", event.action);
    hit.push("e_n", event.name);
    if let Some(value) = event.value {
        hit.push("e_v", value.to_string());
    }
    set_action_name(hit, format!("Event: {} / {}", event.category, event.name));
}

fn apply_ecommerce(hit: &mut Hit, order: &EcommerceOrder) {
    hit.kind = HitKind::Ecommerce;
    hit.push("idgoal", "0");
    hit.push("ec_id", order.order_id.clone());
    hit.push("ec_items", order.items_json());
    hit.push("revenue", format!("{:.2}", order.revenue));
    hit.push("ec_st", format!("{:.2}", order.subtotal));
    hit.push("ec_tx", format!("{:.2}", order.tax));
    hit.push("ec_sh", format!("{:.2}", order.shipping));
    hit.push("ec_currency", order.currency.clone());
}

fn set_param(hit: &mut Hit, key: &str, value: String) {
    if let Some(entry) = hit.params.iter_mut().find(|(k, _)| k == key) {
        entry.1 = value;
    } else {
        hit.push(key, value);
    }
}

fn set_action_name(hit: &mut Hit, value: String) {
    set_param(hit, "action_name", value);
}
