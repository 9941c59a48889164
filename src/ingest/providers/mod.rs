// src/ingest/providers/mod.rs
pub mod http;
pub mod rendered;

use anyhow::{anyhow, Result};
use std::sync::Arc;

use crate::config::{FetchStrategy, FetcherConfig};
use crate::ingest::types::PageTransport;

/// Pick the page transport named by `fetcher.strategy`.
pub fn build_transport(cfg: &FetcherConfig) -> Result<Arc<dyn PageTransport>> {
    match cfg.strategy {
        FetchStrategy::Http => Ok(Arc::new(http::HttpTransport::from_config(cfg)?)),
        FetchStrategy::Rendered => {
            let r = cfg
                .rendered
                .as_ref()
                .ok_or_else(|| anyhow!("fetcher.strategy = \"rendered\" needs a [fetcher.rendered] section"))?;
            Ok(Arc::new(rendered::RenderedTransport::from_config(cfg, r)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_without_section_is_an_error() {
        let cfg = FetcherConfig {
            strategy: FetchStrategy::Rendered,
            ..FetcherConfig::default()
        };
        assert!(build_transport(&cfg).is_err());
    }

    #[test]
    fn http_is_default() {
        let t = build_transport(&FetcherConfig::default()).unwrap();
        assert_eq!(t.name(), "http");
    }
}
