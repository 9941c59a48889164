// src/publish/media.rs
use anyhow::{Context, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Duration;

use crate::error::PublishError;

/// Downloaded image, ready for a channel upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub file_name: String,
}

/// Size-capped image downloader shared by all channels.
#[derive(Clone)]
pub struct MediaFetcher {
    client: Client,
    max_bytes: usize,
}

impl MediaFetcher {
    pub fn new(timeout: Duration, max_bytes: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building media client")?;
        Ok(Self { client, max_bytes })
    }

    pub async fn download(&self, url: &str) -> Result<ImagePayload, PublishError> {
        let fail = |m: String| PublishError::MediaUpload(format!("{url}: {m}"));

        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(fail(format!("status {}", resp.status())));
        }
        if resp.content_length().is_some_and(|n| n as usize > self.max_bytes) {
            return Err(fail("image too large".into()));
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "image/jpeg".to_string());

        let mut bytes = Vec::new();
        while let Some(chunk) = resp.chunk().await.map_err(|e| fail(e.to_string()))? {
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(fail("image too large".into()));
            }
            bytes.extend_from_slice(&chunk);
        }
        if bytes.is_empty() {
            return Err(fail("empty body".into()));
        }

        Ok(ImagePayload {
            bytes,
            file_name: file_name_for(url, &content_type),
            content_type,
        })
    }
}

fn file_name_for(url: &str, content_type: &str) -> String {
    let last = url
        .split(['?', '#'])
        .next()
        .and_then(|p| p.rsplit('/').next())
        .unwrap_or("");
    if last.contains('.') {
        return last.to_string();
    }
    let ext = match content_type {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "jpg",
    };
    format!("photo.{ext}")
}
