// src/ingest/fetcher.rs
//! Paginated listing retrieval on top of a `PageTransport`.
//!
//! `Fetcher::pages` returns a lazy cursor: nothing is requested until
//! `next_page` is awaited, and once the cursor stops it stays stopped.

use metrics::counter;
use once_cell::sync::Lazy;
use rand::Rng;
use scraper::{Html, Selector};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::config::FetcherConfig;
use crate::error::FetchError;
use crate::ingest::types::{FetchedPage, PageTransport, RawUnit, SourceConfig};

/// Listing containers, most specific first. First selector with any match wins.
static UNIT_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| {
    [
        r#"div[data-marker="item"]"#,
        r#"div[class*="iva-item"]"#,
        "[data-item-id]",
    ]
    .iter()
    .map(|s| Selector::parse(s).expect("unit selector"))
    .collect()
});

/// Challenge widgets that only appear on anti-bot interstitials.
static CHALLENGE_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| {
    [
        "#captcha",
        r#"form[action*="captcha"]"#,
        r#"input[name="captcha"]"#,
        r#"[class*="firewall"]"#,
    ]
    .iter()
    .map(|s| Selector::parse(s).expect("challenge selector"))
    .collect()
});

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub max_consecutive_failures: u32,
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
    /// Lowercased anti-bot page markers.
    pub captcha_markers: Vec<String>,
}

impl FetchSettings {
    pub fn from_config(cfg: &FetcherConfig) -> Self {
        Self {
            max_consecutive_failures: cfg.max_consecutive_failures.max(1),
            delay_min_ms: cfg.delay_min_ms,
            delay_max_ms: cfg.delay_max_ms.max(cfg.delay_min_ms),
            captcha_markers: cfg
                .captcha_markers
                .iter()
                .map(|m| m.trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self::from_config(&FetcherConfig::default())
    }
}

/// Why a cursor stopped producing pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxPages,
    EmptyPage,
    Captcha,
    RepeatedFailures,
    InvalidUrl,
}

pub struct Fetcher {
    transport: Arc<dyn PageTransport>,
    settings: FetchSettings,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn PageTransport>, settings: FetchSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub fn pages<'a>(&'a self, source: &'a SourceConfig, max_pages: u32) -> PageCursor<'a> {
        PageCursor {
            fetcher: self,
            source,
            max_pages: max_pages.max(1),
            next: 1,
            consecutive_failures: 0,
            stopped: None,
        }
    }
}

pub struct PageCursor<'a> {
    fetcher: &'a Fetcher,
    source: &'a SourceConfig,
    max_pages: u32,
    next: u32,
    consecutive_failures: u32,
    stopped: Option<StopReason>,
}

impl PageCursor<'_> {
    /// Next page of listing units.
    ///
    /// `Some(Err(_))` for a failed page: network/status failures may be followed
    /// by further pages, a captcha is always the last item.
    pub async fn next_page(&mut self) -> Option<Result<Vec<RawUnit>, FetchError>> {
        if self.stopped.is_some() {
            return None;
        }
        if self.next > self.max_pages {
            self.stopped = Some(StopReason::MaxPages);
            return None;
        }

        let page = self.next;
        self.next += 1;

        if page > 1 {
            let s = &self.fetcher.settings;
            let ms = jitter_ms(s.delay_min_ms, s.delay_max_ms);
            if ms > 0 {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
        }

        let url = match page_url(&self.source.url, page) {
            Ok(u) => u,
            Err(e) => {
                self.stopped = Some(StopReason::InvalidUrl);
                return Some(Err(e));
            }
        };

        let transport = self.fetcher.transport.name();
        tracing::debug!(target: "fetch", %url, page, transport, "fetching page");

        match self.fetcher.transport.get_page(&url).await {
            Ok(fetched) => {
                self.consecutive_failures = 0;
                counter!("fetch_pages_total", "transport" => transport).increment(1);

                if challenge_url(&fetched.final_url) {
                    return Some(Err(self.captcha(url)));
                }
                let units = split_units(&fetched.body, &fetched.final_url);
                if units.is_empty() {
                    if is_challenge_page(&fetched, &self.fetcher.settings.captcha_markers) {
                        return Some(Err(self.captcha(url)));
                    }
                    tracing::debug!(target: "fetch", %url, page, "empty page, pagination done");
                    self.stopped = Some(StopReason::EmptyPage);
                    return None;
                }
                Some(Ok(units))
            }
            Err(e) if e.is_captcha() => {
                self.stopped = Some(StopReason::Captcha);
                counter!("fetch_captcha_total").increment(1);
                Some(Err(e))
            }
            Err(e) => {
                self.consecutive_failures += 1;
                counter!("fetch_errors_total", "transport" => transport).increment(1);
                if self.consecutive_failures >= self.fetcher.settings.max_consecutive_failures {
                    self.stopped = Some(StopReason::RepeatedFailures);
                }
                Some(Err(e))
            }
        }
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stopped
    }

    fn captcha(&mut self, url: String) -> FetchError {
        self.stopped = Some(StopReason::Captcha);
        counter!("fetch_captcha_total").increment(1);
        FetchError::CaptchaDetected { url }
    }
}

/// `{page}` placeholder if present, else page 1 = URL as is, page N = `?p=N`.
pub fn page_url(template: &str, page: u32) -> Result<String, FetchError> {
    let raw = template.replace("{page}", &page.to_string());
    let mut url = Url::parse(&raw).map_err(|e| FetchError::InvalidUrl {
        url: raw.clone(),
        message: e.to_string(),
    })?;
    if page > 1 && !template.contains("{page}") {
        url.query_pairs_mut().append_pair("p", &page.to_string());
    }
    Ok(url.to_string())
}

/// Cut a listing page into per-ad HTML units.
pub fn split_units(body: &str, page_url: &str) -> Vec<RawUnit> {
    let doc = Html::parse_document(body);
    for sel in UNIT_SELECTORS.iter() {
        let units: Vec<RawUnit> = doc
            .select(sel)
            .map(|el| RawUnit {
                html: el.html(),
                page_url: page_url.to_string(),
            })
            .collect();
        if !units.is_empty() {
            return units;
        }
    }
    Vec::new()
}

fn challenge_url(final_url: &str) -> bool {
    let u = final_url.to_ascii_lowercase();
    u.contains("captcha") || u.contains("/blocked")
}

/// Firewall text in the visible page, or a challenge form. Script tags are
/// ignored so an embedded reCAPTCHA widget does not count.
fn is_challenge_page(page: &FetchedPage, markers: &[String]) -> bool {
    let doc = Html::parse_document(&page.body);
    if CHALLENGE_SELECTORS.iter().any(|sel| doc.select(sel).next().is_some()) {
        return true;
    }
    let text = doc
        .root_element()
        .descendants()
        .filter_map(|n| {
            let parent = n.parent().and_then(|p| p.value().as_element().map(|e| e.name()));
            match parent {
                Some("script") | Some("style") | Some("noscript") => None,
                _ => n.value().as_text().map(|t| t.to_lowercase()),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    markers.iter().any(|m| text.contains(m.as_str()))
}

fn jitter_ms(min: u64, max: u64) -> u64 {
    if max <= min {
        return min;
    }
    rand::rng().random_range(min..=max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_url_appends_query_after_first_page() {
        assert_eq!(
            page_url("https://board.example/moskva/avto", 1).unwrap(),
            "https://board.example/moskva/avto"
        );
        assert_eq!(
            page_url("https://board.example/moskva/avto?s=104", 3).unwrap(),
            "https://board.example/moskva/avto?s=104&p=3"
        );
        assert_eq!(
            page_url("https://board.example/list/{page}", 2).unwrap(),
            "https://board.example/list/2"
        );
        assert!(page_url("not a url", 1).is_err());
    }

    #[test]
    fn units_fall_back_to_secondary_selector() {
        let body = r#"<html><body>
            <div class="iva-item-root-abc" data-item-id="1"><h3>A</h3></div>
            <div class="iva-item-root-abc" data-item-id="2"><h3>B</h3></div>
        </body></html>"#;
        let units = split_units(body, "https://board.example/x");
        assert_eq!(units.len(), 2);
        assert!(units[0].html.contains(r#"data-item-id="1""#));
    }

    fn page(body: &str) -> FetchedPage {
        FetchedPage {
            body: body.to_string(),
            final_url: "https://board.example/moskva/avto?p=4".into(),
        }
    }

    #[test]
    fn recaptcha_script_on_a_last_page_is_not_a_challenge() {
        let markers = FetchSettings::default().captcha_markers;
        let last = page(
            r#"<html><head><script src="https://www.google.com/recaptcha/api.js"></script>
            <script>var captcha = "доступ ограничен";</script></head>
            <body><div class="g-recaptcha"></div><p>Ничего не найдено</p></body></html>"#,
        );
        assert!(!is_challenge_page(&last, &markers));
    }

    #[test]
    fn firewall_text_or_form_is_a_challenge() {
        let markers = FetchSettings::default().captcha_markers;
        assert!(is_challenge_page(
            &page("<html><body><h2>Доступ ограничен: проблема с IP</h2></body></html>"),
            &markers
        ));
        assert!(is_challenge_page(
            &page(r#"<html><body><form action="/captcha/check"><button>OK</button></form></body></html>"#),
            &[]
        ));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        for _ in 0..50 {
            let v = jitter_ms(10, 20);
            assert!((10..=20).contains(&v));
        }
        assert_eq!(jitter_ms(5, 5), 5);
        assert_eq!(jitter_ms(0, 0), 0);
    }
}
