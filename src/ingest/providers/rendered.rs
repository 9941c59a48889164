// src/ingest/providers/rendered.rs
//! Browser-rendered page transport.
//!
//! Rendering is delegated to a headless-browser service:
//! `POST {endpoint}` with `{url, cookies, timeout_ms}` answers
//! `{html, url?, cookies?}`. The browser session (cookies) survives restarts
//! through a small JSON cookie file.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;

use crate::config::{FetcherConfig, RenderedConfig};
use crate::error::FetchError;
use crate::ingest::types::{FetchedPage, PageTransport};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Serialize)]
struct RenderRequest<'a> {
    url: &'a str,
    cookies: &'a [SessionCookie],
    timeout_ms: u64,
}

#[derive(Deserialize)]
struct RenderResponse {
    html: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    cookies: Vec<SessionCookie>,
}

pub struct RenderedTransport {
    client: Client,
    endpoint: String,
    token: Option<String>,
    timeout_ms: u64,
    cookie_path: PathBuf,
    /// `None` until the cookie file has been read once.
    jar: Mutex<Option<Vec<SessionCookie>>>,
}

impl RenderedTransport {
    pub fn from_config(fetcher: &FetcherConfig, rendered: &RenderedConfig) -> Result<Self> {
        // Rendering is slow: give the service its own budget on top of the page timeout.
        let timeout = Duration::from_secs(fetcher.timeout_secs.saturating_mul(2));
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building render service client")?;
        Ok(Self {
            client,
            endpoint: rendered.endpoint.clone(),
            token: rendered.token.clone(),
            timeout_ms: fetcher.timeout_secs.saturating_mul(1_000),
            cookie_path: PathBuf::from(&rendered.cookie_path),
            jar: Mutex::new(None),
        })
    }
}

#[async_trait]
impl PageTransport for RenderedTransport {
    async fn get_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        // One browser session: rendered fetches are serialized through the jar.
        let mut jar = self.jar.lock().await;
        if jar.is_none() {
            *jar = Some(read_cookies(&self.cookie_path).await);
        }
        let cookies = jar.clone().unwrap_or_default();

        let mut req = self.client.post(&self.endpoint).json(&RenderRequest {
            url,
            cookies: &cookies,
            timeout_ms: self.timeout_ms,
        });
        if let Some(tok) = &self.token {
            req = req.bearer_auth(tok);
        }

        let resp = req.send().await.map_err(|e| FetchError::network(url, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Render {
                url: url.to_string(),
                message: format!("render service returned {status}"),
            });
        }
        let rendered: RenderResponse = resp.json().await.map_err(|e| FetchError::Render {
            url: url.to_string(),
            message: format!("bad render response: {e}"),
        })?;

        if !rendered.cookies.is_empty() {
            let merged = merge_cookies(cookies, rendered.cookies);
            write_cookies(&self.cookie_path, &merged).await;
            *jar = Some(merged);
        }

        Ok(FetchedPage {
            final_url: rendered.url.unwrap_or_else(|| url.to_string()),
            body: rendered.html,
        })
    }

    fn name(&self) -> &'static str {
        "rendered"
    }
}

/// Newer cookies replace older ones with the same (name, domain, path).
pub fn merge_cookies(old: Vec<SessionCookie>, fresh: Vec<SessionCookie>) -> Vec<SessionCookie> {
    let mut out = old;
    for c in fresh {
        match out
            .iter_mut()
            .find(|o| o.name == c.name && o.domain == c.domain && o.path == c.path)
        {
            Some(slot) => *slot = c,
            None => out.push(c),
        }
    }
    out
}

async fn read_cookies(path: &Path) -> Vec<SessionCookie> {
    match fs::read_to_string(path).await {
        Ok(s) => serde_json::from_str(&s).unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

async fn write_cookies(path: &Path, cookies: &[SessionCookie]) {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if let Err(e) = fs::create_dir_all(dir).await {
            tracing::warn!(target: "fetch", "cookie dir: {e:#}");
        }
    }
    let body = serde_json::to_vec_pretty(cookies).unwrap_or_default();
    if let Err(e) = fs::write(path, body).await {
        tracing::warn!(target: "fetch", "write cookies: {e:#}");
    }
}
