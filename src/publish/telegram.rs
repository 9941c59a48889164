// src/publish/telegram.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use html_escape::{encode_double_quoted_attribute, encode_text};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::media::ImagePayload;
use super::{format_price, truncate, ChannelPublisher, MediaRef};
use crate::config::TelegramConfig;
use crate::error::PublishError;
use crate::store::Announcement;

pub const CHANNEL_ID: &str = "telegram";

/// Bot API limit for photo captions.
pub const CAPTION_LIMIT: usize = 1024;

#[derive(Clone)]
pub struct TelegramPublisher {
    client: Client,
    base: String,
    channels: HashMap<String, String>,
    description_limit: usize,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
}

#[derive(Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    result: Option<SentMessage>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ReplyParameters>,
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Deserialize)]
struct ReplyParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

impl TelegramPublisher {
    pub fn new(cfg: &TelegramConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building telegram client")?;
        Ok(Self {
            client,
            base: format!("{}/bot{}", cfg.api_base.trim_end_matches('/'), cfg.bot_token),
            channels: cfg.channels.clone(),
            description_limit: cfg.description_limit,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.base, method)
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<String, PublishError> {
        let resp = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&SendMessage {
                chat_id,
                text,
                parse_mode: "HTML",
            })
            .send()
            .await
            .map_err(transport_error)?;
        read_reply(resp, false).await
    }

    async fn send_photo(
        &self,
        chat_id: &str,
        caption: &str,
        image: &ImagePayload,
    ) -> Result<String, PublishError> {
        if caption.chars().count() > CAPTION_LIMIT {
            return Err(PublishError::MediaRejected {
                channel: CHANNEL_ID.into(),
                message: format!("caption longer than {CAPTION_LIMIT} chars"),
            });
        }
        let part = Part::bytes(image.bytes.clone())
            .file_name(image.file_name.clone())
            .mime_str(&image.content_type)
            .map_err(|e| PublishError::MediaRejected {
                channel: CHANNEL_ID.into(),
                message: e.to_string(),
            })?;
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .text("parse_mode", "HTML")
            .part("photo", part);

        let resp = self
            .client
            .post(self.method_url("sendPhoto"))
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;
        read_reply(resp, true).await
    }
}

/// reqwest errors quote the request url, which embeds the bot token.
fn transport_error(e: reqwest::Error) -> PublishError {
    PublishError::transport(CHANNEL_ID, e.without_url())
}

/// Decode a Bot API reply into a message id or a typed error.
/// With `photo`, a plain 400 means the image was refused.
async fn read_reply(resp: reqwest::Response, photo: bool) -> Result<String, PublishError> {
    let status = resp.status();
    let reply: Option<ApiReply> = resp.json().await.ok();

    if status.is_success() {
        if let Some(ApiReply {
            ok: true,
            result: Some(msg),
            ..
        }) = reply
        {
            return Ok(msg.message_id.to_string());
        }
    }

    let (code, description, retry_after) = match reply {
        Some(r) => (
            r.error_code.unwrap_or(i64::from(status.as_u16())),
            r.description.unwrap_or_default(),
            r.parameters.and_then(|p| p.retry_after),
        ),
        None => (i64::from(status.as_u16()), format!("http {status}"), None),
    };

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PublishError::Auth {
            channel: CHANNEL_ID.into(),
            message: description,
        },
        StatusCode::TOO_MANY_REQUESTS => PublishError::RateLimited {
            channel: CHANNEL_ID.into(),
            retry_after,
        },
        StatusCode::BAD_REQUEST if photo => PublishError::MediaRejected {
            channel: CHANNEL_ID.into(),
            message: description,
        },
        _ => PublishError::Api {
            channel: CHANNEL_ID.into(),
            code,
            message: description,
        },
    })
}

#[async_trait]
impl ChannelPublisher for TelegramPublisher {
    fn channel_id(&self) -> &str {
        CHANNEL_ID
    }

    fn destination_for(&self, category: &str) -> Option<String> {
        self.channels
            .get(category)
            .filter(|c| !c.trim().is_empty())
            .cloned()
    }

    fn format_post(&self, a: &Announcement, signature: &str) -> String {
        let mut out = format!("<b>{}</b>", encode_text(&a.title));
        if let Some(p) = a.price.filter(|p| *p > 0) {
            out.push_str(&format!("\n💰 <b>Цена: {} ₽</b>", format_price(p)));
        }
        if !a.description.is_empty() {
            out.push_str("\n\n");
            out.push_str(&encode_text(&truncate(&a.description, self.description_limit)));
        }
        if !a.url.is_empty() {
            out.push_str(&format!(
                "\n\n🔗 <a href=\"{}\">Смотреть объявление</a>",
                encode_double_quoted_attribute(&a.url)
            ));
        }
        if !signature.is_empty() {
            out.push_str("\n\n");
            out.push_str(&encode_text(signature));
        }
        out
    }

    async fn upload_media(
        &self,
        _destination: &str,
        image: ImagePayload,
    ) -> Result<MediaRef, PublishError> {
        // Bytes travel with sendPhoto itself.
        Ok(MediaRef::Inline(image))
    }

    async fn publish(
        &self,
        destination: &str,
        text: &str,
        media: Option<&MediaRef>,
    ) -> Result<String, PublishError> {
        match media {
            Some(MediaRef::Inline(img)) => self.send_photo(destination, text, img).await,
            _ => self.send_message(destination, text).await,
        }
    }
}
