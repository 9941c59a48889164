// src/filter.rs
//! Candidate classification: business listings, stop words, price floor and
//! description length, checked in that order. First matching rule wins.

use std::fmt;

use crate::ingest::types::{AuthorType, RawListing};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterConfig {
    pub stop_words: Vec<String>,
    /// Listings priced at or below this are rejected (as are listings without a price).
    pub min_price: u64,
    /// Minimum description length in characters.
    pub min_description_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RejectReason {
    Business,
    StopWord(String),
    Price,
    ShortDescription,
}

impl RejectReason {
    /// Label without the stop word, for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Business => "business",
            Self::StopWord(_) => "stopword",
            Self::Price => "price",
            Self::ShortDescription => "short-description",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StopWord(w) => write!(f, "stopword:{w}"),
            other => f.write_str(other.kind()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub external_id: String,
    pub reason: RejectReason,
}

/// Check a single candidate. `None` means accepted.
pub fn classify(c: &RawListing, cfg: &FilterConfig) -> Option<RejectReason> {
    if c.author_type == AuthorType::Business {
        return Some(RejectReason::Business);
    }

    let haystack = format!("{} {}", c.title, c.description).to_lowercase();
    if let Some(w) = cfg
        .stop_words
        .iter()
        .find(|w| !w.is_empty() && haystack.contains(&w.to_lowercase()))
    {
        return Some(RejectReason::StopWord(w.clone()));
    }

    match c.price {
        Some(p) if p > cfg.min_price => {}
        _ => return Some(RejectReason::Price),
    }

    if c.description.chars().count() < cfg.min_description_len {
        return Some(RejectReason::ShortDescription);
    }

    None
}

/// Split candidates into accepted (unchanged, in input order) and rejections.
pub fn filter(
    candidates: Vec<RawListing>,
    cfg: &FilterConfig,
) -> (Vec<RawListing>, Vec<Rejection>) {
    let mut accepted = Vec::with_capacity(candidates.len());
    let mut rejections = Vec::new();

    for c in candidates {
        match classify(&c, cfg) {
            None => accepted.push(c),
            Some(reason) => {
                tracing::debug!(
                    target: "filter",
                    id = %c.external_id,
                    %reason,
                    "candidate rejected"
                );
                rejections.push(Rejection {
                    external_id: c.external_id,
                    reason,
                });
            }
        }
    }

    (accepted, rejections)
}
