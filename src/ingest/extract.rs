// src/ingest/extract.rs
//! Listing extraction: one raw unit (HTML of a single ad card) -> `RawListing`.
//!
//! Every field has an ordered chain of lookups (CSS selector + attribute,
//! CSS selector + text, regex over the raw HTML). The first lookup that yields
//! a non-empty value wins. Only a missing id or title drops the record.

use anyhow::{anyhow, Result};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::ExtractionFailure;
use crate::ingest::normalize_text;
use crate::ingest::types::{AuthorType, RawListing, RawUnit};

/// Post-processing applied to an attribute value.
type Refine = fn(&str) -> Option<String>;

enum Lookup {
    Attr {
        sel: Selector,
        attr: &'static str,
        refine: Option<Refine>,
    },
    Text {
        sel: Selector,
    },
    Pattern {
        re: Regex,
    },
}

impl Lookup {
    fn attr(css: &str, attr: &'static str) -> Result<Self> {
        Ok(Self::Attr {
            sel: parse_selector(css)?,
            attr,
            refine: None,
        })
    }

    fn attr_refined(css: &str, attr: &'static str, refine: Refine) -> Result<Self> {
        Ok(Self::Attr {
            sel: parse_selector(css)?,
            attr,
            refine: Some(refine),
        })
    }

    fn text(css: &str) -> Result<Self> {
        Ok(Self::Text {
            sel: parse_selector(css)?,
        })
    }

    fn pattern(re: &str) -> Result<Self> {
        let re = Regex::new(re).map_err(|e| anyhow!("lookup regex `{re}`: {e}"))?;
        Ok(Self::Pattern { re })
    }

    fn resolve(&self, doc: &Html, raw: &str) -> Option<String> {
        let value = match self {
            Self::Attr { sel, attr, refine } => doc.select(sel).find_map(|el| {
                let v = el.value().attr(attr)?.trim();
                let refined = match refine {
                    Some(f) => f(v),
                    None => Some(v.to_string()),
                };
                refined.filter(|v| !v.is_empty())
            }),
            Self::Text { sel } => doc
                .select(sel)
                .map(element_text)
                .find(|t| !t.is_empty()),
            Self::Pattern { re } => re
                .captures(raw)
                .and_then(|c| c.get(1))
                .map(|m| normalize_text(m.as_str())),
        };
        value.filter(|v| !v.trim().is_empty())
    }
}

fn parse_selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("selector `{css}`: {e:?}"))
}

fn element_text(el: ElementRef<'_>) -> String {
    normalize_text(&el.text().collect::<Vec<_>>().join(" "))
}

fn first_of(chain: &[Lookup], doc: &Html, raw: &str) -> Option<String> {
    chain.iter().find_map(|l| l.resolve(doc, raw))
}

/// `item-12345` -> `12345`; non-numeric suffixes are rejected.
fn numeric_suffix(v: &str) -> Option<String> {
    let tail = v.rsplit('-').next().unwrap_or(v);
    let tail = tail.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) {
        Some(tail.to_string())
    } else {
        None
    }
}

/// Strip every non-digit; empty -> `None`; overflow -> `None`.
pub fn parse_price(text: &str) -> Option<u64> {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Compiled lookup chains for all listing fields.
pub struct Extractor {
    id: Vec<Lookup>,
    title: Vec<Lookup>,
    url: Vec<Lookup>,
    price: Vec<Lookup>,
    description: Vec<Lookup>,
    location: Vec<Lookup>,
    images: Selector,
    business_markers: Vec<Regex>,
}

impl Extractor {
    /// Build the default lookup chains.
    pub fn new() -> Result<Self> {
        let id = vec![
            Lookup::attr("[data-item-id]", "data-item-id")?,
            Lookup::attr_refined("[id]", "id", numeric_suffix)?,
            Lookup::pattern(r#"data-item-id="(\d+)""#)?,
        ];
        let title = vec![
            Lookup::text(r#"[data-marker="item-title"]"#)?,
            Lookup::text(r#"[itemprop="name"]"#)?,
            Lookup::text("h3")?,
            Lookup::attr(r#"a[itemprop="url"]"#, "title")?,
        ];
        let url = vec![
            Lookup::attr(r#"[data-marker="item-title"]"#, "href")?,
            Lookup::attr(r#"a[itemprop="url"]"#, "href")?,
            Lookup::attr("a[href]", "href")?,
        ];
        let price = vec![
            Lookup::attr(r#"meta[itemprop="price"]"#, "content")?,
            Lookup::text(r#"[data-marker="item-price"]"#)?,
            Lookup::text(r#"[class*="price"]"#)?,
            Lookup::pattern(r"(?i)(\d[\d\s]*)\s*(?:₽|руб)")?,
        ];
        let description = vec![
            Lookup::text(r#"[data-marker="item-description"]"#)?,
            Lookup::text(r#"[class*="description"]"#)?,
            Lookup::attr(r#"[itemprop="description"]"#, "content")?,
        ];
        let location = vec![
            Lookup::text(r#"[data-marker="item-address"]"#)?,
            Lookup::text(r#"[class*="geo"]"#)?,
            Lookup::text(r#"[class*="location"]"#)?,
        ];
        let business_markers = [
            r#"(?i)data-marker="[^"]*(?:shop|company|seller|business|agency)[^"]*""#,
            r#"(?i)class="[^"]*(?:shop|company|seller|business|agency)[^"]*""#,
            r">\s*(?:Компания|Магазин|Агентство|Автосалон)\s*<",
        ]
        .iter()
        .map(|p| Regex::new(p).map_err(|e| anyhow!("business marker `{p}`: {e}")))
        .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id,
            title,
            url,
            price,
            description,
            location,
            images: parse_selector("img, source")?,
            business_markers,
        })
    }

    /// `None` when the unit has no resolvable id or title.
    pub fn extract(&self, unit: &RawUnit, category: &str) -> Option<RawListing> {
        self.try_extract(unit, category).ok()
    }

    pub fn try_extract(
        &self,
        unit: &RawUnit,
        category: &str,
    ) -> Result<RawListing, ExtractionFailure> {
        let doc = Html::parse_fragment(&unit.html);
        let raw = unit.html.as_str();

        let external_id =
            first_of(&self.id, &doc, raw).ok_or(ExtractionFailure::MissingExternalId)?;
        let title = first_of(&self.title, &doc, raw).ok_or(ExtractionFailure::MissingTitle)?;

        let base = Url::parse(&unit.page_url).ok();
        let url = first_of(&self.url, &doc, raw)
            .map(|href| resolve_url(base.as_ref(), &href))
            .unwrap_or_default();

        let price = first_of(&self.price, &doc, raw).and_then(|t| parse_price(&t));
        let description = first_of(&self.description, &doc, raw).unwrap_or_default();
        let location = first_of(&self.location, &doc, raw);
        let image_urls = self.image_urls(&doc, base.as_ref());
        let author_type = self.author_type(raw);

        Ok(RawListing {
            external_id,
            title,
            description,
            price,
            url,
            image_urls,
            location,
            author_type,
            category: category.to_string(),
        })
    }

    /// Extract a whole page. Failed units are logged and counted, never fatal.
    pub fn extract_page(&self, units: &[RawUnit], category: &str) -> (Vec<RawListing>, usize) {
        let mut out = Vec::with_capacity(units.len());
        let mut dropped = 0usize;
        for unit in units {
            match self.try_extract(unit, category) {
                Ok(listing) => out.push(listing),
                Err(reason) => {
                    dropped += 1;
                    tracing::debug!(target: "extract", %reason, category, "unit dropped");
                }
            }
        }
        (out, dropped)
    }

    fn author_type(&self, raw: &str) -> AuthorType {
        if self.business_markers.iter().any(|re| re.is_match(raw)) {
            AuthorType::Business
        } else {
            AuthorType::Private
        }
    }

    fn image_urls(&self, doc: &Html, base: Option<&Url>) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for el in doc.select(&self.images) {
            let v = el.value();
            let candidate = v
                .attr("src")
                .or_else(|| v.attr("data-src"))
                .map(str::to_string)
                .or_else(|| {
                    v.attr("srcset")
                        .and_then(|s| s.split(',').next())
                        .and_then(|s| s.split_whitespace().next())
                        .map(str::to_string)
                });
            let Some(src) = candidate.filter(|s| !s.is_empty() && !s.starts_with("data:")) else {
                continue;
            };
            let abs = resolve_url(base, &src);
            if !out.contains(&abs) {
                out.push(abs);
            }
        }
        out
    }
}

fn resolve_url(base: Option<&Url>, href: &str) -> String {
    match base.and_then(|b| b.join(href).ok()) {
        Some(u) => u.to_string(),
        None => href.to_string(),
    }
}
