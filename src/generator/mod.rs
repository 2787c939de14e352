//! Visit content generation.
//!
//! Shared pieces for both generators: the per-visit context, geolocation
//! and referrer selection, ecommerce order synthesis, and the URL list
//! loader. The visit composer and funnel engine live in submodules.

pub mod data;
pub mod funnel;
pub mod visit;

use std::net::Ipv4Addr;
use std::path::Path;

use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

use crate::config::Config;

#[derive(Error, Debug)]
pub enum UrlsError {
    #[error("failed to read urls file {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error("no URLs found in {0}")]
    Empty(String),
}

/// Load the line-oriented URL list: one URL per line, optional
/// tab-separated title, `#` comments and blank lines skipped.
pub fn load_urls(path: impl AsRef<Path>) -> Result<Vec<String>, UrlsError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| UrlsError::Io(path.display().to_string(), e))?;

    let urls: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_whitespace().next())
        .map(str::to_string)
        .collect();

    if urls.is_empty() {
        return Err(UrlsError::Empty(path.display().to_string()));
    }
    Ok(urls)
}

/// Random lowercase hex string of length `n`.
pub fn rand_hex(rng: &mut impl Rng, n: usize) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    (0..n).map(|_| HEX[rng.gen_range(0..16)] as char).collect()
}

/// Nonce for the `rand` tracking parameter.
pub fn rand_nonce(rng: &mut impl Rng) -> u32 {
    rng.gen_range(0..i32::MAX as u32)
}

/// Ephemeral state for one simulated visitor. Never shared across visits.
#[derive(Debug, Clone)]
pub struct VisitContext {
    /// 16 lowercase hex digits.
    pub visitor_id: String,
    pub user_agent: &'static str,
    /// None means direct traffic: the first hit omits `urlref` entirely.
    pub referrer: Option<String>,
    /// Country and spoofed visitor IP, when geo randomization is enabled.
    pub geo: Option<(String, Ipv4Addr)>,
}

impl VisitContext {
    pub fn new(cfg: &Config, rng: &mut impl Rng) -> Self {
        let referrer = if rng.gen::<f64>() < cfg.direct_traffic_probability {
            None
        } else {
            data::REFERRERS.choose(rng).map(|r| r.to_string())
        };

        let geo = if cfg.randomize_visitor_countries {
            choose_country_and_ip(rng)
        } else {
            None
        };

        Self {
            visitor_id: rand_hex(rng, 16),
            user_agent: data::USER_AGENTS.choose(rng).copied().unwrap_or(data::USER_AGENTS[0]),
            referrer,
            geo,
        }
    }
}

/// Pick a country from the weighted table and a random address inside one
/// of its CIDR ranges. Falls back to the first entry when the cumulative
/// probabilities leave a remainder.
pub fn choose_country_and_ip(rng: &mut impl Rng) -> Option<(String, Ipv4Addr)> {
    let draw: f64 = rng.gen();
    let mut cumulative = 0.0;

    for entry in data::COUNTRY_IP_RANGES {
        cumulative += entry.probability;
        if draw < cumulative {
            let cidr = entry.cidrs.choose(rng)?;
            let ip = random_ip_in_cidr(rng, cidr)?;
            return Some((entry.country.to_string(), ip));
        }
    }

    let fallback = data::COUNTRY_IP_RANGES.first()?;
    let cidr = fallback.cidrs.choose(rng)?;
    let ip = random_ip_in_cidr(rng, cidr)?;
    Some((fallback.country.to_string(), ip))
}

/// Random host address inside `a.b.c.d/len`, excluding the network and
/// broadcast addresses.
fn random_ip_in_cidr(rng: &mut impl Rng, cidr: &str) -> Option<Ipv4Addr> {
    let (base, len) = cidr.split_once('/')?;
    let base: Ipv4Addr = base.parse().ok()?;
    let len: u32 = len.parse().ok()?;
    if len > 32 {
        return None;
    }

    let host_bits = 32 - len;
    let network = u32::from(base) & (u32::MAX.checked_shl(host_bits).unwrap_or(0));
    let size: u64 = 1u64 << host_bits;
    if size <= 2 {
        return Some(Ipv4Addr::from(network));
    }

    let offset = rng.gen_range(1..size - 1) as u32;
    Some(Ipv4Addr::from(network + offset))
}

/// One line item of a synthesized order.
#[derive(Debug, Clone)]
pub struct OrderItem {
    pub sku: String,
    pub name: String,
    pub category: String,
    pub price: f64,
    pub quantity: u32,
}

/// A synthesized ecommerce purchase. Always satisfies
/// `revenue == round2(subtotal + shipping + tax)`.
#[derive(Debug, Clone)]
pub struct EcommerceOrder {
    /// 8 lowercase hex digits.
    pub order_id: String,
    pub items: Vec<OrderItem>,
    pub subtotal: f64,
    pub tax: f64,
    pub shipping: f64,
    pub revenue: f64,
    pub currency: String,
}

impl EcommerceOrder {
    /// Serialize items as the `ec_items` JSON array of
    /// `[sku, name, category, price, quantity]` tuples.
    pub fn items_json(&self) -> String {
        let items: Vec<serde_json::Value> = self
            .items
            .iter()
            .map(|i| {
                serde_json::json!([i.sku, i.name, i.category, i.price, i.quantity])
            })
            .collect();
        serde_json::Value::Array(items).to_string()
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Sample the ecommerce probability and synthesize an order on success.
pub fn maybe_order(cfg: &Config, rng: &mut impl Rng) -> Option<EcommerceOrder> {
    if rng.gen::<f64>() >= cfg.ecommerce_probability {
        return None;
    }
    Some(generate_order(cfg, rng))
}

/// Build an order whose revenue lands inside the configured value bounds.
///
/// A target total is drawn first, then item prices are sized so that
/// subtotal + shipping + tax reproduces it. The first item always has
/// quantity 1 and absorbs cent-rounding drift.
pub fn generate_order(cfg: &Config, rng: &mut impl Rng) -> EcommerceOrder {
    let order_id = rand_hex(rng, 8);
    let (min, max) = (cfg.ecommerce_order_value_min, cfg.ecommerce_order_value_max);
    let rate = cfg.ecommerce_tax_rate;
    let target = if max > min { rng.gen_range(min..=max) } else { min };

    let mut shipping = *cfg
        .ecommerce_shipping_rates
        .as_slice()
        .choose(rng)
        .unwrap_or(&0.0);
    let mut needed_subtotal = target / (1.0 + rate) - shipping;
    if needed_subtotal < 0.01 {
        shipping = 0.0;
        needed_subtotal = target / (1.0 + rate);
    }

    let n_items = rng.gen_range(cfg.ecommerce_items_min..=cfg.ecommerce_items_max) as usize;
    let weights: Vec<f64> = (0..n_items).map(|_| rng.gen_range(0.5..1.5)).collect();
    let weight_sum: f64 = weights.iter().sum();

    let mut items: Vec<OrderItem> = Vec::with_capacity(n_items);
    let mut allocated = 0.0;
    for weight in weights.iter().skip(1) {
        let product = data::ECOMMERCE_PRODUCTS
            .choose(rng)
            .expect("product catalog is non-empty");
        let quantity = rng.gen_range(1..=3u32);
        let share = needed_subtotal * weight / weight_sum;
        let price = round2((share / quantity as f64).max(0.01));
        allocated += price * quantity as f64;
        items.push(OrderItem {
            sku: product.sku.to_string(),
            name: product.name.to_string(),
            category: product.category.to_string(),
            price,
            quantity,
        });
    }

    let first = data::ECOMMERCE_PRODUCTS
        .choose(rng)
        .expect("product catalog is non-empty");
    items.insert(
        0,
        OrderItem {
            sku: first.sku.to_string(),
            name: first.name.to_string(),
            category: first.category.to_string(),
            price: round2((needed_subtotal - allocated).max(0.01)),
            quantity: 1,
        },
    );

    let (mut subtotal, mut tax, mut revenue) = order_totals(&items, shipping, rate);

    // Cent rounding can push revenue just past a bound; nudge the first
    // item (quantity 1) back toward the interior and recompute once.
    if revenue > max || revenue < min {
        let desired = if revenue > max {
            (max - 0.02).max(min)
        } else {
            (min + 0.02).min(max)
        };
        let desired_subtotal = (desired / (1.0 + rate) - shipping).max(0.01);
        let delta = desired_subtotal - subtotal;
        items[0].price = round2((items[0].price + delta).max(0.01));
        let recomputed = order_totals(&items, shipping, rate);
        subtotal = recomputed.0;
        tax = recomputed.1;
        revenue = recomputed.2;
    }

    EcommerceOrder {
        order_id,
        items,
        subtotal,
        tax,
        shipping,
        revenue,
        currency: cfg.ecommerce_currency.clone(),
    }
}

fn order_totals(items: &[OrderItem], shipping: f64, tax_rate: f64) -> (f64, f64, f64) {
    let subtotal = round2(items.iter().map(|i| i.price * i.quantity as f64).sum());
    let tax = round2((subtotal + shipping) * tax_rate);
    let revenue = round2(subtotal + shipping + tax);
    (subtotal, tax, revenue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::io::Write;

    #[test]
    fn test_load_urls_skips_comments_and_titles() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# comment").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "https://example.com/\tHome Page").unwrap();
        writeln!(f, "https://example.com/pricing").unwrap();
        let urls = load_urls(f.path()).unwrap();
        assert_eq!(urls, vec!["https://example.com/", "https://example.com/pricing"]);
    }

    #[test]
    fn test_load_urls_empty_file_is_an_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# only a comment").unwrap();
        assert!(matches!(load_urls(f.path()), Err(UrlsError::Empty(_))));
    }

    #[test]
    fn test_rand_hex_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        let id = rand_hex(&mut rng, 16);
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_visit_context_direct_traffic_has_no_referrer() {
        let cfg = Config {
            direct_traffic_probability: 1.0,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let ctx = VisitContext::new(&cfg, &mut rng);
        assert!(ctx.referrer.is_none());
        assert_eq!(ctx.visitor_id.len(), 16);
    }

    #[test]
    fn test_visit_context_geo_disabled() {
        let cfg = Config {
            randomize_visitor_countries: false,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(2);
        let ctx = VisitContext::new(&cfg, &mut rng);
        assert!(ctx.geo.is_none());
    }

    #[test]
    fn test_random_ip_stays_inside_cidr() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let ip = random_ip_in_cidr(&mut rng, "194.47.0.0/16").unwrap();
            let v = u32::from(ip);
            let base = u32::from("194.47.0.0".parse::<Ipv4Addr>().unwrap());
            assert!(v > base && v < base + 65535, "ip out of range: {ip}");
        }
    }

    #[test]
    fn test_choose_country_always_yields_some() {
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..100 {
            assert!(choose_country_and_ip(&mut rng).is_some());
        }
    }

    #[test]
    fn test_order_probability_zero_never_generates() {
        let cfg = Config {
            ecommerce_probability: 0.0,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..50 {
            assert!(maybe_order(&cfg, &mut rng).is_none());
        }
    }

    #[test]
    fn test_order_arithmetic_and_bounds() {
        let cfg = Config {
            ecommerce_probability: 1.0,
            ecommerce_order_value_min: 50.0,
            ecommerce_order_value_max: 150.0,
            ecommerce_items_min: 1,
            ecommerce_items_max: 2,
            ecommerce_shipping_rates: vec![0.0],
            ecommerce_tax_rate: 0.05,
            ..Default::default()
        };

        let mut rng = StdRng::seed_from_u64(12345);
        for _ in 0..100 {
            let order = maybe_order(&cfg, &mut rng).expect("probability forced to 1");

            assert_eq!(order.order_id.len(), 8);
            assert!(!order.items.is_empty());
            for item in &order.items {
                assert!(!item.sku.is_empty());
                assert!(item.price > 0.0);
                assert!(item.quantity >= 1);
            }

            let subtotal: f64 = order.items.iter().map(|i| i.price * i.quantity as f64).sum();
            assert!((subtotal - order.subtotal).abs() < 0.01);
            let expected_tax = ((order.subtotal + order.shipping) * 0.05 * 100.0).round() / 100.0;
            assert!((expected_tax - order.tax).abs() < 0.01);
            let expected_revenue = order.subtotal + order.shipping + order.tax;
            assert!((expected_revenue - order.revenue).abs() < 0.01);

            assert!(
                order.revenue >= 49.99 && order.revenue <= 150.01,
                "revenue out of bounds: {}",
                order.revenue
            );
        }
    }

    #[test]
    fn test_order_items_json_shape() {
        let cfg = Config {
            ecommerce_probability: 1.0,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(9);
        let order = generate_order(&cfg, &mut rng);
        let parsed: serde_json::Value = serde_json::from_str(&order.items_json()).unwrap();
        let arr = parsed.as_array().unwrap();
        assert_eq!(arr.len(), order.items.len());
        for entry in arr {
            let tuple = entry.as_array().unwrap();
            assert_eq!(tuple.len(), 5);
            assert!(tuple[0].is_string()); // sku
            assert!(tuple[3].is_number()); // price
            assert!(tuple[4].is_number()); // quantity
        }
    }
}
