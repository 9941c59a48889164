// src/publish/vk.rs
//! VK community wall publisher.
//!
//! Photo flow: `photos.getWallUploadServer` -> multipart upload ->
//! `photos.saveWallPhoto` -> attachment `photo{owner}_{id}` on `wall.post`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use super::media::ImagePayload;
use super::{format_price, truncate, ChannelPublisher, MediaRef};
use crate::config::VkConfig;
use crate::error::PublishError;
use crate::store::Announcement;

pub const CHANNEL_ID: &str = "vk";

#[derive(Clone)]
pub struct VkPublisher {
    client: Client,
    token: String,
    groups: HashMap<String, i64>,
    api_base: String,
    api_version: String,
    description_limit: usize,
}

#[derive(Deserialize)]
struct UploadServer {
    upload_url: String,
}

#[derive(Deserialize)]
struct UploadedPhoto {
    server: i64,
    photo: String,
    hash: String,
}

#[derive(Deserialize)]
struct SavedPhoto {
    id: i64,
    owner_id: i64,
}

#[derive(Deserialize)]
struct WallPost {
    post_id: i64,
}

impl VkPublisher {
    pub fn new(cfg: &VkConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building vk client")?;
        Ok(Self {
            client,
            token: cfg.access_token.clone(),
            groups: cfg.groups.clone(),
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            api_version: cfg.api_version.clone(),
            description_limit: cfg.description_limit,
        })
    }

    /// Call an API method and decode its `response` member.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<T, PublishError> {
        let mut form: Vec<(&str, String)> = params.to_vec();
        form.push(("access_token", self.token.clone()));
        form.push(("v", self.api_version.clone()));

        let body: Value = self
            .client
            .post(format!("{}/{}", self.api_base, method))
            .form(&form)
            .send()
            .await
            .map_err(|e| PublishError::transport(CHANNEL_ID, e))?
            .json()
            .await
            .map_err(|e| PublishError::transport(CHANNEL_ID, e))?;

        if let Some(err) = body.get("error") {
            let code = err.get("error_code").and_then(Value::as_i64).unwrap_or(0);
            let msg = err
                .get("error_msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(map_api_error(code, msg));
        }

        let response = body.get("response").cloned().ok_or_else(|| PublishError::Api {
            channel: CHANNEL_ID.into(),
            code: 0,
            message: format!("{method}: no response member"),
        })?;
        serde_json::from_value(response).map_err(|e| PublishError::Api {
            channel: CHANNEL_ID.into(),
            code: 0,
            message: format!("{method}: {e}"),
        })
    }

    async fn upload_photo(&self, group_id: i64, image: ImagePayload) -> Result<String, PublishError> {
        let server: UploadServer = self
            .call("photos.getWallUploadServer", &[("group_id", group_id.to_string())])
            .await?;

        let part = Part::bytes(image.bytes)
            .file_name(image.file_name)
            .mime_str(&image.content_type)
            .map_err(|e| PublishError::MediaUpload(e.to_string()))?;
        let uploaded: UploadedPhoto = self
            .client
            .post(&server.upload_url)
            .multipart(Form::new().part("photo", part))
            .send()
            .await
            .map_err(|e| PublishError::MediaUpload(e.to_string()))?
            .json()
            .await
            .map_err(|e| PublishError::MediaUpload(e.to_string()))?;
        if uploaded.photo.is_empty() || uploaded.photo == "[]" {
            return Err(PublishError::MediaUpload("upload server returned no photo".into()));
        }

        let saved: Vec<SavedPhoto> = self
            .call(
                "photos.saveWallPhoto",
                &[
                    ("group_id", group_id.to_string()),
                    ("server", uploaded.server.to_string()),
                    ("photo", uploaded.photo),
                    ("hash", uploaded.hash),
                ],
            )
            .await?;
        let first = saved
            .first()
            .ok_or_else(|| PublishError::MediaUpload("saveWallPhoto returned nothing".into()))?;
        Ok(format!("photo{}_{}", first.owner_id, first.id))
    }
}

fn map_api_error(code: i64, message: String) -> PublishError {
    match code {
        5 => PublishError::Auth {
            channel: CHANNEL_ID.into(),
            message,
        },
        6 | 9 | 29 => PublishError::RateLimited {
            channel: CHANNEL_ID.into(),
            retry_after: None,
        },
        _ => PublishError::Api {
            channel: CHANNEL_ID.into(),
            code,
            message,
        },
    }
}

fn parse_group(destination: &str) -> Result<i64, PublishError> {
    destination.parse::<i64>().map(i64::abs).map_err(|_| PublishError::Api {
        channel: CHANNEL_ID.into(),
        code: 0,
        message: format!("bad group id {destination}"),
    })
}

#[async_trait]
impl ChannelPublisher for VkPublisher {
    fn channel_id(&self) -> &str {
        CHANNEL_ID
    }

    fn destination_for(&self, category: &str) -> Option<String> {
        self.groups.get(category).map(|g| g.abs().to_string())
    }

    fn format_post(&self, a: &Announcement, signature: &str) -> String {
        let mut out = format!("📢 {}", a.title);
        if let Some(p) = a.price.filter(|p| *p > 0) {
            out.push_str(&format!("\n💰 Цена: {} ₽", format_price(p)));
        }
        if !a.description.is_empty() {
            out.push_str("\n\n");
            out.push_str(&truncate(&a.description, self.description_limit));
        }
        if !a.url.is_empty() {
            out.push_str(&format!("\n\n🔗 Смотреть объявление: {}", a.url));
        }
        if !signature.is_empty() {
            out.push_str("\n\n");
            out.push_str(signature);
        }
        out
    }

    async fn upload_media(
        &self,
        destination: &str,
        image: ImagePayload,
    ) -> Result<MediaRef, PublishError> {
        let group = parse_group(destination)?;
        // Anything going wrong here is a media problem, not a post failure.
        self.upload_photo(group, image)
            .await
            .map(MediaRef::Attachment)
            .map_err(|e| match e {
                PublishError::MediaUpload(_) => e,
                other => PublishError::MediaUpload(other.to_string()),
            })
    }

    async fn publish(
        &self,
        destination: &str,
        text: &str,
        media: Option<&MediaRef>,
    ) -> Result<String, PublishError> {
        let group = parse_group(destination)?;
        let mut params = vec![
            ("owner_id", format!("-{group}")),
            ("from_group", "1".to_string()),
            ("message", text.to_string()),
        ];
        if let Some(MediaRef::Attachment(att)) = media {
            params.push(("attachments", att.clone()));
        }
        let post: WallPost = self.call("wall.post", &params).await?;
        Ok(post.post_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::AuthorType;
    use chrono::Utc;

    fn publisher() -> VkPublisher {
        let cfg = VkConfig {
            access_token: "t".into(),
            groups: HashMap::from([("auto".to_string(), -12345)]),
            ..VkConfig::default()
        };
        VkPublisher::new(&cfg, Duration::from_secs(5)).unwrap()
    }

    fn announcement(description: &str) -> Announcement {
        let now = Utc::now();
        Announcement::from_listing(
            crate::ingest::types::RawListing {
                external_id: "1".into(),
                title: "Toyota Camry".into(),
                description: description.into(),
                price: Some(1_200_000),
                url: "https://board.example/avto/1".into(),
                image_urls: vec![],
                location: None,
                author_type: AuthorType::Private,
                category: "auto".into(),
            },
            now,
        )
    }

    #[test]
    fn destination_is_positive_group_id() {
        let p = publisher();
        assert_eq!(p.destination_for("auto").as_deref(), Some("12345"));
        assert_eq!(p.destination_for("realty"), None);
    }

    #[test]
    fn post_text_has_all_parts() {
        let p = publisher();
        let text = p.format_post(&announcement(&"x".repeat(600)), "#авто");
        assert!(text.starts_with("📢 Toyota Camry"));
        assert!(text.contains("1 200 000 ₽"));
        assert!(text.contains(&format!("{}...", "x".repeat(500))));
        assert!(!text.contains(&"x".repeat(501)));
        assert!(text.contains("https://board.example/avto/1"));
        assert!(text.ends_with("#авто"));
    }

    #[test]
    fn api_error_codes_map_to_kinds() {
        assert_eq!(map_api_error(5, "x".into()).kind(), "auth");
        assert_eq!(map_api_error(9, "x".into()).kind(), "rate_limited");
        assert_eq!(map_api_error(100, "x".into()).kind(), "api");
    }
}
