// src/ingest/types.rs
use serde::{Deserialize, Serialize};

use crate::error::FetchError;

/// One configured listing source (a category page on the classifieds site).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceConfig {
    pub category: String,
    /// Page URL; may contain `{page}`, otherwise `?p=N` is appended for N > 1.
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub signature: String,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AuthorType {
    Private,
    Business,
}

/// Outer HTML of a single listing element, with the page it was found on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawUnit {
    pub html: String,
    pub page_url: String,
}

/// Candidate record produced by the extractor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawListing {
    pub external_id: String,
    pub title: String,
    pub description: String,
    pub price: Option<u64>,
    pub url: String,
    pub image_urls: Vec<String>,
    pub location: Option<String>,
    pub author_type: AuthorType,
    pub category: String,
}

/// Body of a fetched page plus the URL it finally resolved to.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: String,
    pub body: String,
}

/// Strategy that turns a page URL into HTML (plain HTTP, rendered, fixtures in tests).
#[async_trait::async_trait]
pub trait PageTransport: Send + Sync {
    async fn get_page(&self, url: &str) -> Result<FetchedPage, FetchError>;
    fn name(&self) -> &'static str;
}
