// src/publish/mod.rs
//! Per-channel publishing of stored announcements.
//!
//! The router owns the cross-channel rules (eligibility, destinations,
//! media degradation, pacing, writing channel state back). A
//! `ChannelPublisher` only knows how to format and send for its channel.

pub mod media;
pub mod pacer;
pub mod telegram;
pub mod vk;

use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::error::PublishError;
use crate::store::{Announcement, AnnouncementStore};
use media::{ImagePayload, MediaFetcher};
use pacer::SendPacer;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("publish_total", "Publish outcomes per channel and result.");
        describe_counter!(
            "publish_media_degraded_total",
            "Posts sent text-only because media failed."
        );
    });
}

/// Media prepared for one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaRef {
    /// Channel-side reference of an already uploaded file (e.g. `photo-1_2`).
    Attachment(String),
    /// Raw bytes sent along with the post itself.
    Inline(ImagePayload),
}

#[async_trait]
pub trait ChannelPublisher: Send + Sync {
    fn channel_id(&self) -> &str;

    /// Channel destination for a category, `None` if unmapped.
    fn destination_for(&self, category: &str) -> Option<String>;

    fn format_post(&self, announcement: &Announcement, signature: &str) -> String;

    async fn upload_media(
        &self,
        destination: &str,
        image: ImagePayload,
    ) -> Result<MediaRef, PublishError>;

    /// Send a post, returning the channel's post id.
    async fn publish(
        &self,
        destination: &str,
        text: &str,
        media: Option<&MediaRef>,
    ) -> Result<String, PublishError>;
}

/// Outcome counters of one channel in one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelReport {
    pub channel: String,
    pub published: usize,
    pub failed: usize,
    pub skipped: usize,
    pub media_degraded: usize,
    pub state_errors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct ChannelSlot {
    publisher: Arc<dyn ChannelPublisher>,
    send_delay_ms: u64,
    send_jitter_ms: u64,
}

pub struct PublishRouter {
    store: Arc<dyn AnnouncementStore>,
    media: MediaFetcher,
    signatures: HashMap<String, String>,
    channels: Vec<ChannelSlot>,
}

impl PublishRouter {
    pub fn new(
        store: Arc<dyn AnnouncementStore>,
        media: MediaFetcher,
        signatures: HashMap<String, String>,
    ) -> Self {
        Self {
            store,
            media,
            signatures,
            channels: Vec::new(),
        }
    }

    pub fn with_channel(
        mut self,
        publisher: Arc<dyn ChannelPublisher>,
        send_delay_ms: u64,
        send_jitter_ms: u64,
    ) -> Self {
        self.channels.push(ChannelSlot {
            publisher,
            send_delay_ms,
            send_jitter_ms,
        });
        self
    }

    pub fn channel_ids(&self) -> Vec<String> {
        self.channels
            .iter()
            .map(|c| c.publisher.channel_id().to_string())
            .collect()
    }

    /// Publish pending announcements on every channel concurrently.
    pub async fn publish_all(&self) -> Vec<ChannelReport> {
        ensure_metrics_described();
        futures::future::join_all(self.channels.iter().map(|slot| self.publish_channel(slot))).await
    }

    async fn publish_channel(&self, slot: &ChannelSlot) -> ChannelReport {
        let p = slot.publisher.as_ref();
        let channel = p.channel_id().to_string();
        let mut report = ChannelReport {
            channel: channel.clone(),
            ..ChannelReport::default()
        };

        let pending = match self.store.pending_for_channel(&channel).await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(target: "publish", %channel, error = %e, "cannot read pending announcements");
                report.error = Some(e.to_string());
                return report;
            }
        };
        if pending.is_empty() {
            return report;
        }
        tracing::info!(target: "publish", %channel, pending = pending.len(), "publishing");

        let mut pacer = SendPacer::new(slot.send_delay_ms, slot.send_jitter_ms);
        for a in pending {
            let Some(dest) = p.destination_for(&a.category) else {
                report.skipped += 1;
                counter!("publish_total", "channel" => channel.clone(), "result" => "skipped")
                    .increment(1);
                tracing::debug!(target: "publish", %channel, id = %a.external_id, category = %a.category, "no destination");
                continue;
            };

            let signature = self
                .signatures
                .get(&a.category)
                .map(String::as_str)
                .unwrap_or("");
            let text = p.format_post(&a, signature);

            pacer.wait().await;
            let (media, mut degraded) = self.prepare_media(p, &dest, &a).await;
            let mut result = p.publish(&dest, &text, media.as_ref()).await;
            pacer.record_send(Instant::now());
            if media.is_some() && matches!(result, Err(PublishError::MediaRejected { .. })) {
                if let Err(e) = &result {
                    tracing::warn!(target: "publish", %channel, id = %a.external_id, error = %e, "media rejected, resending text-only");
                }
                degraded = true;
                // The rejected attempt was a send too.
                pacer.wait().await;
                result = p.publish(&dest, &text, None).await;
                pacer.record_send(Instant::now());
            }

            if degraded && result.is_ok() {
                report.media_degraded += 1;
                counter!("publish_media_degraded_total", "channel" => channel.clone()).increment(1);
            }

            match result {
                Ok(post_id) => {
                    report.published += 1;
                    counter!("publish_total", "channel" => channel.clone(), "result" => "published")
                        .increment(1);
                    tracing::info!(target: "publish", %channel, id = %a.external_id, %post_id, "published");
                    if let Err(e) = self
                        .store
                        .mark_published(&a.external_id, &channel, &post_id, Utc::now())
                        .await
                    {
                        report.state_errors += 1;
                        tracing::error!(target: "publish", %channel, id = %a.external_id, error = %e, "sent but channel state not saved");
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    counter!("publish_total", "channel" => channel.clone(), "result" => e.kind())
                        .increment(1);
                    tracing::warn!(target: "publish", %channel, id = %a.external_id, error = %e, "publish failed");
                }
            }
        }

        report
    }

    /// First image, downloaded and uploaded. Any failure degrades to text-only.
    async fn prepare_media(
        &self,
        p: &dyn ChannelPublisher,
        dest: &str,
        a: &Announcement,
    ) -> (Option<MediaRef>, bool) {
        let Some(url) = a.image_urls.first() else {
            return (None, false);
        };
        let uploaded = match self.media.download(url).await {
            Ok(img) => p.upload_media(dest, img).await,
            Err(e) => Err(e),
        };
        match uploaded {
            Ok(m) => (Some(m), false),
            Err(e) => {
                tracing::warn!(target: "publish", channel = p.channel_id(), id = %a.external_id, error = %e, "media failed, text-only");
                (None, true)
            }
        }
    }
}

/// `1200000` -> `1 200 000`.
pub fn format_price(price: u64) -> String {
    let digits = price.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(' ');
        }
        out.push(c);
    }
    out
}

/// Cut to `limit` chars, appending `...` when something was cut.
pub fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit).collect();
    out.push_str("...");
    out
}
