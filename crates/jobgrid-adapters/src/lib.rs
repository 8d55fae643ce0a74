//! Source adapter contracts + per-site listing-page parsers.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use jobgrid_core::{LocationDefaults, RawListing};
use jobgrid_store::{FetchError, FetchedPage, HttpFetcher, HttpStatusCode};
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "jobgrid-adapters";

/// Upper bound on listings a single adapter emits per run, to bound
/// downstream resolver and insert load.
pub const DEFAULT_MAX_LISTINGS: usize = 50;

/// Per-site component that fetches one listings page and parses it into raw
/// listings. Fetch failures are soft: the coordinator folds them into the
/// run report and the adapter contributes an empty sequence.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn listing_url(&self) -> &str;

    /// City applied when a listing carries no location text.
    fn home_city(&self) -> &str;

    /// State/country for a location row first created for `city`.
    fn location_defaults(&self, city: &str) -> LocationDefaults;

    async fn fetch(&self, http: &HttpFetcher) -> Result<FetchedPage, FetchError>;

    /// Pure function of the document. Degrades to an empty vec on
    /// unrecognized markup; a single bad container never aborts the rest.
    fn parse(&self, html: &str) -> Vec<RawListing>;
}

/// One way of pulling a field out of a listing container: a CSS selector
/// plus an optional attribute to read instead of the text content.
#[derive(Debug, Clone, Copy)]
pub struct ExtractRule {
    pub selector: &'static str,
    pub attr: Option<&'static str>,
}

const fn text(selector: &'static str) -> ExtractRule {
    ExtractRule { selector, attr: None }
}

const fn attr(selector: &'static str, attr: &'static str) -> ExtractRule {
    ExtractRule { selector, attr: Some(attr) }
}

/// Static description of one target site: where to fetch, how to locate
/// listing containers, and the ordered fallback rules for every field.
/// Rule order matters: the first rule that yields non-empty text wins.
#[derive(Debug)]
pub struct SiteProfile {
    pub source_id: &'static str,
    pub base_url: &'static str,
    pub default_listing_url: &'static str,
    pub home_city: &'static str,
    /// `None` means the state is derived as "<city> Region".
    pub home_state: Option<&'static str>,
    pub home_country: &'static str,
    pub container_selectors: &'static [&'static str],
    pub title_rules: &'static [ExtractRule],
    pub link_rules: &'static [ExtractRule],
    pub company_rules: &'static [ExtractRule],
    pub location_rules: &'static [ExtractRule],
    pub category_rules: &'static [ExtractRule],
    pub description_rules: &'static [ExtractRule],
    pub employment_rules: &'static [ExtractRule],
    pub salary_rules: &'static [ExtractRule],
    pub posted_rules: &'static [ExtractRule],
}

pub static JOBSTREET: SiteProfile = SiteProfile {
    source_id: "jobstreet",
    base_url: "https://sg.jobstreet.com",
    default_listing_url: "https://sg.jobstreet.com/jobs",
    home_city: "Singapore",
    home_state: Some("Singapore"),
    home_country: "Singapore",
    container_selectors: &[
        "article[data-job-id]",
        "article[data-automation='job-card']",
        "div.job-card",
        "article.job-listing",
    ],
    title_rules: &[
        text("a[data-automation='job-title']"),
        text("h3 a"),
        text("h2 a"),
        text(".job-title"),
    ],
    link_rules: &[
        attr("a[data-automation='job-title']", "href"),
        attr("h3 a", "href"),
        attr("h2 a", "href"),
        attr("a", "href"),
    ],
    company_rules: &[
        text("[data-automation='job-company']"),
        text(".company-name"),
        text(".company"),
    ],
    location_rules: &[
        text("[data-automation='job-location']"),
        text(".job-location"),
        text(".location"),
    ],
    category_rules: &[
        text("[data-automation='job-classification']"),
        text(".job-category"),
        text(".category"),
    ],
    description_rules: &[
        text("[data-automation='job-snippet']"),
        text(".job-snippet"),
        text(".job-description"),
        text("p"),
    ],
    employment_rules: &[text(".employment-type"), text(".job-type")],
    salary_rules: &[
        text("[data-automation='job-salary']"),
        text(".salary-range"),
        text(".salary"),
    ],
    posted_rules: &[
        attr("time", "datetime"),
        text(".posted-date"),
        text(".listed-date"),
    ],
};

pub static JOIMYANMAR: SiteProfile = SiteProfile {
    source_id: "joimyanmar",
    base_url: "https://www.joimyanmar.com",
    default_listing_url: "https://www.joimyanmar.com/jobs-in-myanmar",
    home_city: "Yangon",
    home_state: None,
    home_country: "Myanmar",
    container_selectors: &["div.job-item", "li.job-result", "div.listing-card"],
    title_rules: &[text("h2.job-title a"), text("h2 a"), text("h3 a"), text(".title a")],
    link_rules: &[
        attr("h2.job-title a", "href"),
        attr("h2 a", "href"),
        attr("a.job-link", "href"),
        attr("a", "href"),
    ],
    company_rules: &[text(".company-name"), text(".employer-name"), text(".company")],
    location_rules: &[text(".job-location"), text(".location"), text(".region")],
    category_rules: &[text(".job-category"), text(".category"), text(".industry")],
    description_rules: &[text(".job-summary"), text(".description"), text("p.summary")],
    employment_rules: &[text(".job-type"), text(".employment")],
    salary_rules: &[text(".salary"), text(".job-salary")],
    posted_rules: &[attr("time", "datetime"), text(".posted-on"), text(".date")],
};

/// HTML listing adapter driven by a [`SiteProfile`].
#[derive(Debug)]
pub struct HtmlListingAdapter {
    profile: &'static SiteProfile,
    listing_url: String,
    max_listings: usize,
}

impl HtmlListingAdapter {
    pub fn new(profile: &'static SiteProfile) -> Self {
        Self {
            profile,
            listing_url: profile.default_listing_url.to_string(),
            max_listings: DEFAULT_MAX_LISTINGS,
        }
    }

    pub fn with_listing_url(mut self, url: impl Into<String>) -> Self {
        self.listing_url = url.into();
        self
    }

    pub fn with_max_listings(mut self, max: usize) -> Self {
        self.max_listings = max.max(1);
        self
    }

    fn listing_from(&self, container: ElementRef<'_>) -> Option<RawListing> {
        let profile = self.profile;
        let title = first_rule_value(container, profile.title_rules).unwrap_or_default();
        let company = first_rule_value(container, profile.company_rules).unwrap_or_default();
        if title.is_empty() && company.is_empty() {
            // Not a listing we can ever ingest; dropped without ceremony.
            return None;
        }

        let href = first_rule_value(container, profile.link_rules)?;
        let source_url = absolutize(profile.base_url, &href)?;

        let location_name = first_rule_value(container, profile.location_rules)
            .unwrap_or_else(|| profile.home_city.to_string());
        let category_name = first_rule_value(container, profile.category_rules).unwrap_or_default();
        let description = first_rule_value(container, profile.description_rules).unwrap_or_default();
        let employment_type = first_rule_value(container, profile.employment_rules);
        let (salary_min, salary_max) = first_rule_value(container, profile.salary_rules)
            .map(|s| parse_salary_range(&s))
            .unwrap_or((None, None));
        let posted_at =
            first_rule_value(container, profile.posted_rules).and_then(|s| parse_posted_date(&s));

        Some(RawListing {
            title,
            description,
            company_name: company,
            location_name,
            category_name,
            source_url,
            source_site: profile.source_id.to_string(),
            employment_type,
            salary_min,
            salary_max,
            posted_at,
        })
    }
}

#[async_trait]
impl SourceAdapter for HtmlListingAdapter {
    fn source_id(&self) -> &str {
        self.profile.source_id
    }

    fn listing_url(&self) -> &str {
        &self.listing_url
    }

    fn home_city(&self) -> &str {
        self.profile.home_city
    }

    fn location_defaults(&self, city: &str) -> LocationDefaults {
        let state = match self.profile.home_state {
            Some(state) => state.to_string(),
            None => format!("{} Region", city.trim()),
        };
        LocationDefaults {
            state,
            country: self.profile.home_country.to_string(),
        }
    }

    async fn fetch(&self, http: &HttpFetcher) -> Result<FetchedPage, FetchError> {
        http.fetch_page(self.source_id(), &self.listing_url).await
    }

    fn parse(&self, html: &str) -> Vec<RawListing> {
        let document = Html::parse_document(html);
        let containers = first_matching_containers(&document, self.profile.container_selectors);
        if containers.is_empty() {
            debug!(source_id = self.source_id(), "no listing containers matched");
            return Vec::new();
        }

        let mut listings = Vec::new();
        for container in containers {
            if listings.len() >= self.max_listings {
                debug!(
                    source_id = self.source_id(),
                    cap = self.max_listings,
                    "listing cap reached"
                );
                break;
            }
            if let Some(listing) = self.listing_from(container) {
                listings.push(listing);
            }
        }
        listings
    }
}

/// Try each container selector in order; the first one that matches anything
/// wins for the whole page. Unparseable selectors are skipped.
fn first_matching_containers<'a>(
    document: &'a Html,
    selectors: &[&str],
) -> Vec<ElementRef<'a>> {
    for raw in selectors {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        let matched: Vec<_> = document.select(&selector).collect();
        if !matched.is_empty() {
            return matched;
        }
    }
    Vec::new()
}

/// First rule that yields non-empty trimmed text (or attribute value) wins.
fn first_rule_value(container: ElementRef<'_>, rules: &[ExtractRule]) -> Option<String> {
    for rule in rules {
        let Ok(selector) = Selector::parse(rule.selector) else {
            continue;
        };
        let Some(element) = container.select(&selector).next() else {
            continue;
        };
        let value = match rule.attr {
            Some(name) => element.value().attr(name).map(ToString::to_string),
            None => Some(element.text().collect::<String>()),
        };
        if let Some(value) = value.as_deref().and_then(collapse_ws) {
            return Some(value);
        }
    }
    None
}

fn collapse_ws(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn absolutize(base: &str, href: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    base.join(href.trim()).ok().map(|u| u.to_string())
}

fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        // Thousands grouping inside a number ("4,000").
        if ch == ',' && !current.is_empty() {
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.parse::<f64>() {
                out.push(v);
            }
            current.clear();
            seen_dot = false;
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.parse::<f64>() {
            out.push(v);
        }
    }
    out
}

/// Lenient salary parsing: values that do not parse become `None`; an
/// inverted range is swapped rather than rejected.
pub fn parse_salary_range(text: &str) -> (Option<f64>, Option<f64>) {
    let nums = extract_numbers(text);
    let min = nums.first().copied();
    let max = nums.get(1).copied().or(min);
    match (min, max) {
        (Some(lo), Some(hi)) if lo > hi => (Some(hi), Some(lo)),
        pair => pair,
    }
}

/// Accepts RFC 3339 timestamps plus the bare date shapes the target sites
/// actually use. Anything else becomes `None`, never an error.
pub fn parse_posted_date(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d", "%d %b %Y", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }
    None
}

pub fn jobstreet_adapter() -> HtmlListingAdapter {
    HtmlListingAdapter::new(&JOBSTREET)
}

pub fn joimyanmar_adapter() -> HtmlListingAdapter {
    HtmlListingAdapter::new(&JOIMYANMAR)
}

pub fn adapter_for_source(
    source_id: &str,
    listing_url: Option<&str>,
    max_listings: Option<usize>,
) -> Option<HtmlListingAdapter> {
    let adapter = match source_id {
        "jobstreet" => jobstreet_adapter(),
        "joimyanmar" => joimyanmar_adapter(),
        _ => return None,
    };
    let adapter = match listing_url {
        Some(url) => adapter.with_listing_url(url),
        None => adapter,
    };
    Some(match max_listings {
        Some(max) => adapter.with_max_listings(max),
        None => adapter,
    })
}

/// Fixed-output adapter for tests: fetch succeeds (or fails on demand)
/// without touching the network, parse returns the configured listings.
#[derive(Debug, Clone)]
pub struct StaticAdapter {
    source_id: String,
    home_city: String,
    defaults: LocationDefaults,
    listings: Vec<RawListing>,
    fail_fetch: bool,
}

impl StaticAdapter {
    pub fn new(source_id: impl Into<String>, listings: Vec<RawListing>) -> Self {
        Self {
            source_id: source_id.into(),
            home_city: "Singapore".to_string(),
            defaults: LocationDefaults {
                state: "Singapore".to_string(),
                country: "Singapore".to_string(),
            },
            listings,
            fail_fetch: false,
        }
    }

    pub fn with_home(mut self, city: impl Into<String>, defaults: LocationDefaults) -> Self {
        self.home_city = city.into();
        self.defaults = defaults;
        self
    }

    pub fn with_fetch_failure(mut self) -> Self {
        self.fail_fetch = true;
        self
    }
}

#[async_trait]
impl SourceAdapter for StaticAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn listing_url(&self) -> &str {
        "static://listings"
    }

    fn home_city(&self) -> &str {
        &self.home_city
    }

    fn location_defaults(&self, _city: &str) -> LocationDefaults {
        self.defaults.clone()
    }

    async fn fetch(&self, _http: &HttpFetcher) -> Result<FetchedPage, FetchError> {
        if self.fail_fetch {
            return Err(FetchError::HttpStatus {
                status: 503,
                url: self.listing_url().to_string(),
            });
        }
        Ok(FetchedPage {
            status: HttpStatusCode::OK,
            final_url: self.listing_url().to_string(),
            body: String::new(),
            fetched_at: Utc::now(),
        })
    }

    fn parse(&self, _html: &str) -> Vec<RawListing> {
        self.listings.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOBSTREET_PAGE: &str = include_str!("../fixtures/jobstreet_listing.html");
    const JOBSTREET_FALLBACK_PAGE: &str = include_str!("../fixtures/jobstreet_fallback.html");
    const JOIMYANMAR_PAGE: &str = include_str!("../fixtures/joimyanmar_listing.html");

    #[test]
    fn jobstreet_fixture_parses_expected_listings() {
        let listings = jobstreet_adapter().parse(JOBSTREET_PAGE);
        // The fixture has three containers; one is missing both title and
        // company and must be dropped silently.
        assert_eq!(listings.len(), 2);

        let first = &listings[0];
        assert_eq!(first.title, "Software Engineer");
        assert_eq!(first.company_name, "Tech Solutions Pte Ltd");
        assert_eq!(first.location_name, "Singapore");
        assert_eq!(first.category_name, "Technology");
        assert_eq!(
            first.source_url,
            "https://sg.jobstreet.com/job/software-engineer-123"
        );
        assert_eq!(first.source_site, "jobstreet");
        assert_eq!(first.employment_type.as_deref(), Some("Full-time"));
        assert_eq!(first.salary_min, Some(4000.0));
        assert_eq!(first.salary_max, Some(6000.0));
        assert!(first.posted_at.is_some());
    }

    #[test]
    fn relative_links_are_rewritten_to_absolute() {
        let listings = jobstreet_adapter().parse(JOBSTREET_PAGE);
        let second = &listings[1];
        assert_eq!(
            second.source_url,
            "https://sg.jobstreet.com/job/data-analyst-789"
        );
    }

    #[test]
    fn missing_location_defaults_to_home_city() {
        let listings = jobstreet_adapter().parse(JOBSTREET_PAGE);
        assert_eq!(listings[1].location_name, "Singapore");
    }

    #[test]
    fn fallback_container_selectors_still_find_listings() {
        let listings = jobstreet_adapter().parse(JOBSTREET_FALLBACK_PAGE);
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].title, "Backend Developer");
        assert_eq!(listings[0].company_name, "Legacy Markup Pte Ltd");
    }

    #[test]
    fn joimyanmar_fixture_parses_and_derives_region_state() {
        let adapter = joimyanmar_adapter();
        let listings = adapter.parse(JOIMYANMAR_PAGE);
        assert_eq!(listings.len(), 2);

        let first = &listings[0];
        assert_eq!(first.title, "Marketing Manager");
        assert_eq!(first.company_name, "Myanmar Marketing Co");
        assert_eq!(first.location_name, "Yangon");
        assert_eq!(
            first.source_url,
            "https://www.joimyanmar.com/job/marketing-manager-456"
        );

        let defaults = adapter.location_defaults("Mandalay");
        assert_eq!(defaults.state, "Mandalay Region");
        assert_eq!(defaults.country, "Myanmar");
    }

    #[test]
    fn unrecognized_markup_degrades_to_zero_listings() {
        let listings = jobstreet_adapter().parse("<html><body><p>nothing here</p></body></html>");
        assert!(listings.is_empty());
    }

    #[test]
    fn listing_cap_bounds_output() {
        let mut page = String::from("<html><body>");
        for i in 0..10 {
            page.push_str(&format!(
                "<article data-job-id=\"{i}\"><h3><a href=\"/job/{i}\">Job {i}</a></h3>\
                 <span class=\"company-name\">Co {i}</span></article>"
            ));
        }
        page.push_str("</body></html>");

        let listings = jobstreet_adapter().with_max_listings(3).parse(&page);
        assert_eq!(listings.len(), 3);
    }

    #[test]
    fn salary_parsing_is_lenient() {
        assert_eq!(parse_salary_range("SGD 4,000 - 6,000"), (Some(4000.0), Some(6000.0)));
        assert_eq!(parse_salary_range("up to 1200"), (Some(1200.0), Some(1200.0)));
        assert_eq!(parse_salary_range("negotiable"), (None, None));
        // Inverted bounds are swapped, not rejected.
        assert_eq!(parse_salary_range("6000 - 4000"), (Some(4000.0), Some(6000.0)));
    }

    #[test]
    fn posted_date_parsing_accepts_site_formats() {
        assert!(parse_posted_date("2026-08-01T08:30:00+08:00").is_some());
        assert!(parse_posted_date("2026-08-01").is_some());
        assert!(parse_posted_date("01 Aug 2026").is_some());
        assert!(parse_posted_date("yesterday").is_none());
    }

    #[tokio::test]
    async fn static_adapter_fetch_failure_is_soft() {
        use jobgrid_store::HttpClientConfig;

        let http = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let adapter = StaticAdapter::new("static", vec![]).with_fetch_failure();
        let err = adapter.fetch(&http).await.expect_err("fetch should fail");
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
    }

    #[test]
    fn adapter_registry_knows_both_sites() {
        assert!(adapter_for_source("jobstreet", None, None).is_some());
        assert!(adapter_for_source("joimyanmar", Some("https://www.joimyanmar.com/jobs?page=2"), None).is_some());
        assert!(adapter_for_source("craigslist", None, None).is_none());
    }
}
