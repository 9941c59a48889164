// src/ingest/providers/http.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::counter;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::Client;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::config::FetcherConfig;
use crate::error::FetchError;
use crate::ingest::types::{FetchedPage, PageTransport};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Plain HTTP page transport with a round-robin proxy pool.
///
/// A request that fails at the transport level through a proxy is repeated
/// once over a direct connection. The direct attempt is never retried.
pub struct HttpTransport {
    direct: Client,
    proxied: Vec<(String, Client)>,
    next_proxy: AtomicUsize,
}

impl HttpTransport {
    pub fn from_config(cfg: &FetcherConfig) -> Result<Self> {
        let timeout = Duration::from_secs(cfg.timeout_secs);
        let ua = cfg.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT);

        let direct = build_client(ua, timeout, None)?;
        let proxied = cfg
            .proxies
            .iter()
            .map(|p| Ok((p.clone(), build_client(ua, timeout, Some(p))?)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            direct,
            proxied,
            next_proxy: AtomicUsize::new(0),
        })
    }

    pub fn proxy_count(&self) -> usize {
        self.proxied.len()
    }

    fn next_proxied(&self) -> Option<&(String, Client)> {
        if self.proxied.is_empty() {
            return None;
        }
        let i = self.next_proxy.fetch_add(1, Ordering::Relaxed) % self.proxied.len();
        self.proxied.get(i)
    }

    async fn request(client: &Client, url: &str) -> Result<FetchedPage, FetchError> {
        let resp = client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::network(url, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let final_url = resp.url().to_string();
        let body = resp.text().await.map_err(|e| FetchError::network(url, e))?;
        Ok(FetchedPage { final_url, body })
    }
}

fn build_client(ua: &str, timeout: Duration, proxy: Option<&str>) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_static("ru-RU,ru;q=0.9,en-US;q=0.8,en;q=0.7"),
    );

    let builder = Client::builder()
        .timeout(timeout)
        .user_agent(ua)
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(5));

    let builder = match proxy {
        Some(p) => builder.proxy(reqwest::Proxy::all(p).with_context(|| format!("invalid proxy {p}"))?),
        // Direct means direct: ignore HTTP(S)_PROXY from the environment.
        None => builder.no_proxy(),
    };

    builder.build().context("building http client")
}

#[async_trait]
impl PageTransport for HttpTransport {
    async fn get_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let Some((proxy, client)) = self.next_proxied() else {
            return Self::request(&self.direct, url).await;
        };

        match Self::request(client, url).await {
            Ok(page) => Ok(page),
            Err(e @ FetchError::Network { .. }) | Err(e @ FetchError::Status { status: 407, .. }) => {
                tracing::warn!(target: "fetch", %proxy, error = %e, "proxy failed, falling back to direct");
                counter!("fetch_proxy_fallback_total").increment(1);
                Self::request(&self.direct, url).await
            }
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
