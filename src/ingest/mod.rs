// src/ingest/mod.rs
pub mod extract;
pub mod fetcher;
pub mod providers;
pub mod types;

use crate::ingest::extract::Extractor;
use crate::ingest::fetcher::{Fetcher, StopReason};
use crate::ingest::types::{RawListing, SourceConfig};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use serde::Serialize;
use std::time::Instant;

/// Upper bound for any single text field taken from a page.
const MAX_TEXT_CHARS: usize = 4000;

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("fetch_pages_total", "Listing pages retrieved successfully.");
        describe_counter!("fetch_errors_total", "Failed page requests.");
        describe_counter!("fetch_captcha_total", "Anti-bot challenge pages hit.");
        describe_counter!(
            "fetch_proxy_fallback_total",
            "Proxy failures retried over a direct connection."
        );
        describe_counter!("extract_records_total", "Units turned into candidate records.");
        describe_counter!("extract_dropped_total", "Units without id or title.");
        describe_histogram!("ingest_source_ms", "Per-source ingest time in milliseconds.");
    });
}

static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("ws regex"));

/// Normalize text taken from markup: decode entities, drop tags,
/// collapse whitespace, trim, cap length. Punctuation is kept.
pub fn normalize_text(s: &str) -> String {
    let decoded = html_escape::decode_html_entities(s);
    let stripped = RE_TAGS.replace_all(&decoded, " ");
    let collapsed = RE_WS.replace_all(&stripped, " ");
    let out = collapsed.trim();
    if out.chars().count() > MAX_TEXT_CHARS {
        out.chars().take(MAX_TEXT_CHARS).collect()
    } else {
        out.to_string()
    }
}

/// Outcome of one source in one cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceReport {
    pub category: String,
    pub pages: u32,
    pub failed_pages: u32,
    pub units: usize,
    pub extracted: usize,
    pub dropped: usize,
    pub captcha: bool,
    pub stop_reason: Option<StopReason>,
}

/// Walk every page of one source and extract candidate records.
///
/// Never fails: page errors are logged and counted, a captcha ends the source.
pub async fn ingest_source(
    fetcher: &Fetcher,
    extractor: &Extractor,
    source: &SourceConfig,
    max_pages: u32,
) -> (Vec<RawListing>, SourceReport) {
    ensure_metrics_described();
    let started = Instant::now();

    let mut report = SourceReport {
        category: source.category.clone(),
        ..SourceReport::default()
    };
    let mut listings = Vec::new();
    let mut cursor = fetcher.pages(source, max_pages);

    while let Some(page) = cursor.next_page().await {
        match page {
            Ok(units) => {
                report.pages += 1;
                report.units += units.len();
                let (mut recs, dropped) = extractor.extract_page(&units, &source.category);
                report.dropped += dropped;
                listings.append(&mut recs);
            }
            Err(e) if e.is_captcha() => {
                report.captcha = true;
                tracing::warn!(target: "fetch", category = %source.category, error = %e, "captcha, source stopped");
            }
            Err(e) => {
                report.failed_pages += 1;
                tracing::warn!(target: "fetch", category = %source.category, error = %e, "page failed");
            }
        }
    }

    report.extracted = listings.len();
    report.stop_reason = cursor.stop_reason();

    counter!("extract_records_total", "category" => source.category.clone())
        .increment(report.extracted as u64);
    counter!("extract_dropped_total").increment(report.dropped as u64);
    histogram!("ingest_source_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

    tracing::info!(
        target: "extract",
        category = %source.category,
        pages = report.pages,
        extracted = report.extracted,
        dropped = report.dropped,
        "source done"
    );

    (listings, report)
}
