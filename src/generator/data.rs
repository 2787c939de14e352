//! Static content tables the generators draw from.

/// Browser user agents assigned one per visit.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/116.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:117.0) Gecko/20100101 Firefox/117.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 14_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.0 Mobile/15E148 Safari/604.1",
];

/// External referrers for non-direct traffic.
pub const REFERRERS: &[&str] = &[
    "https://www.google.com/search?q=analytics",
    "https://www.google.com/search?q=product+demo",
    "https://www.bing.com/search?q=web+analytics",
    "https://duckduckgo.com/?q=tracking+tools",
    "https://twitter.com/",
    "https://www.linkedin.com/feed/",
    "https://www.facebook.com/",
    "https://news.ycombinator.com/",
    "https://www.reddit.com/r/webdev/",
];

/// Keywords used for site search hits.
pub const SEARCH_TERMS: &[&str] = &[
    "product", "service", "contact", "about", "help", "support", "pricing", "features",
    "login", "register", "download", "documentation", "tutorial", "guide", "faq",
    "news", "blog", "updates", "announcement", "release", "version", "security",
    "privacy", "terms", "policy", "legal", "careers", "jobs", "team", "company",
    "analytics", "tracking", "dashboard", "report", "statistics", "metrics", "data",
];

pub const SEARCH_CATEGORIES: &[&str] = &["Products", "Support", "Documentation"];

/// External links for outlink tracking.
pub const OUTLINKS: &[&str] = &[
    "https://github.com", "https://stackoverflow.com", "https://developer.mozilla.org",
    "https://www.w3.org", "https://nodejs.org", "https://reactjs.org", "https://vuejs.org",
    "https://angular.io", "https://jquery.com", "https://bootstrap.getbootstrap.com",
    "https://tailwindcss.com", "https://fontawesome.com", "https://unsplash.com",
    "https://fonts.google.com", "https://codepen.io", "https://jsfiddle.net",
    "https://wikipedia.org", "https://youtube.com", "https://twitter.com",
    "https://linkedin.com", "https://facebook.com", "https://instagram.com",
    "https://reddit.com", "https://medium.com", "https://dev.to",
];

/// File paths for download tracking. Relative paths are resolved against
/// the page that carried the link.
pub const DOWNLOADS: &[&str] = &[
    "/downloads/user-manual.pdf", "/downloads/getting-started-guide.pdf",
    "/downloads/api-documentation.pdf", "/downloads/whitepaper.pdf",
    "/downloads/case-study.pdf", "/downloads/technical-specs.pdf",
    "/files/product-brochure.pdf", "/files/pricing-sheet.pdf",
    "/assets/company-presentation.pptx", "/assets/logo-pack.zip",
    "/downloads/software-v2.1.0.zip", "/downloads/mobile-app.apk",
    "/files/dataset.csv", "/files/report-2024.xlsx",
    "/downloads/template.docx", "/downloads/configuration.json",
    "/files/backup.tar.gz", "/downloads/installer.exe",
    "/assets/images.zip", "/downloads/source-code.zip",
];

/// A custom event definition.
#[derive(Debug, Clone, Copy)]
pub struct EventDef {
    pub category: &'static str,
    pub action: &'static str,
    pub name: &'static str,
    pub value: Option<f64>,
}

/// UI interaction events attached to pageviews.
pub const CLICK_EVENTS: &[EventDef] = &[
    EventDef { category: "Navigation", action: "Click", name: "Main Menu", value: None },
    EventDef { category: "Navigation", action: "Click", name: "Footer Link", value: None },
    EventDef { category: "CTA", action: "Click", name: "Sign Up Button", value: None },
    EventDef { category: "CTA", action: "Click", name: "Request Demo", value: None },
    EventDef { category: "CTA", action: "Click", name: "Start Free Trial", value: None },
    EventDef { category: "Content", action: "Click", name: "Read More", value: None },
    EventDef { category: "Content", action: "Expand", name: "FAQ Item", value: None },
    EventDef { category: "Social", action: "Share", name: "Twitter", value: None },
    EventDef { category: "Social", action: "Share", name: "LinkedIn", value: None },
];

/// Background events not tied to a click.
pub const RANDOM_EVENTS: &[EventDef] = &[
    EventDef { category: "Media", action: "Play", name: "Product Video", value: None },
    EventDef { category: "Media", action: "Pause", name: "Product Video", value: None },
    EventDef { category: "Scroll", action: "Depth", name: "75 Percent", value: Some(75.0) },
    EventDef { category: "Scroll", action: "Depth", name: "100 Percent", value: Some(100.0) },
    EventDef { category: "Form", action: "Focus", name: "Newsletter Email", value: None },
    EventDef { category: "Form", action: "Submit", name: "Contact Form", value: None },
    EventDef { category: "Engagement", action: "Copy", name: "Code Snippet", value: None },
];

/// A purchasable product for ecommerce order synthesis.
#[derive(Debug, Clone, Copy)]
pub struct ProductDef {
    pub sku: &'static str,
    pub name: &'static str,
    pub category: &'static str,
    pub price: f64,
}

pub const ECOMMERCE_PRODUCTS: &[ProductDef] = &[
    ProductDef { sku: "SW-PRO-001", name: "Analytics Pro License", category: "Software", price: 149.99 },
    ProductDef { sku: "SW-STD-002", name: "Analytics Standard License", category: "Software", price: 79.99 },
    ProductDef { sku: "SW-ENT-003", name: "Enterprise Add-on Pack", category: "Software", price: 249.99 },
    ProductDef { sku: "SUP-PRI-010", name: "Priority Support (1 year)", category: "Support", price: 99.00 },
    ProductDef { sku: "SUP-STD-011", name: "Standard Support (1 year)", category: "Support", price: 49.00 },
    ProductDef { sku: "TRN-ONL-020", name: "Online Training Seat", category: "Training", price: 39.50 },
    ProductDef { sku: "TRN-WRK-021", name: "Workshop Ticket", category: "Training", price: 119.00 },
    ProductDef { sku: "HW-USB-030", name: "Branded USB Drive", category: "Merchandise", price: 12.99 },
    ProductDef { sku: "HW-TSH-031", name: "Conference T-Shirt", category: "Merchandise", price: 19.99 },
    ProductDef { sku: "HW-MUG-032", name: "Coffee Mug", category: "Merchandise", price: 9.99 },
];

/// A country with its traffic share and representative IPv4 ranges.
#[derive(Debug, Clone, Copy)]
pub struct CountryRanges {
    pub country: &'static str,
    pub probability: f64,
    pub cidrs: &'static [&'static str],
}

/// Weighted country table for visitor geolocation. Probabilities are
/// cumulative-sampled in order; any remainder falls back to the first entry.
pub const COUNTRY_IP_RANGES: &[CountryRanges] = &[
    CountryRanges {
        country: "United States",
        probability: 0.35,
        cidrs: &[
            "173.252.0.0/16", "74.125.0.0/16", "208.67.0.0/16", "192.30.252.0/22",
            "199.232.0.0/16", "23.0.0.0/8", "104.16.0.0/12", "142.250.0.0/15",
        ],
    },
    CountryRanges {
        country: "Germany",
        probability: 0.10,
        cidrs: &[
            "78.46.0.0/15", "5.9.0.0/16", "136.243.0.0/16", "88.198.0.0/16",
            "46.4.0.0/16", "80.156.0.0/16",
        ],
    },
    CountryRanges {
        country: "United Kingdom",
        probability: 0.09,
        cidrs: &["51.140.0.0/14", "185.40.0.0/16", "86.0.0.0/12", "109.144.0.0/14"],
    },
    CountryRanges {
        country: "Canada",
        probability: 0.07,
        cidrs: &["206.47.0.0/16", "24.0.0.0/13", "99.224.0.0/11"],
    },
    CountryRanges {
        country: "France",
        probability: 0.07,
        cidrs: &["163.172.0.0/16", "51.15.0.0/16", "212.129.0.0/16"],
    },
    CountryRanges {
        country: "Australia",
        probability: 0.06,
        cidrs: &["144.132.0.0/16", "101.160.0.0/11", "180.150.0.0/15"],
    },
    CountryRanges {
        country: "Netherlands",
        probability: 0.06,
        cidrs: &["185.3.0.0/16", "146.185.0.0/16", "31.220.0.0/16", "213.154.0.0/16"],
    },
    CountryRanges {
        country: "Japan",
        probability: 0.05,
        cidrs: &["103.4.0.0/14", "133.0.0.0/8"],
    },
    CountryRanges {
        country: "Sweden",
        probability: 0.03,
        cidrs: &["194.47.0.0/16", "81.230.0.0/16", "78.72.0.0/15"],
    },
    CountryRanges {
        country: "Brazil",
        probability: 0.03,
        cidrs: &["177.0.0.0/8", "191.0.0.0/8"],
    },
];
