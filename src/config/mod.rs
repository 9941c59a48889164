// src/config/mod.rs
//! Relay configuration loaded from TOML.
//!
//! Path resolution: `$LISTING_RELAY_CONFIG`, then `config/relay.toml`.
//! Credentials written as `"ENV"` are read from the environment at load time.

pub mod stop_words;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::{env, fs};

use crate::filter::FilterConfig;
use crate::ingest::types::SourceConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config/relay.toml";
pub const ENV_CONFIG_PATH: &str = "LISTING_RELAY_CONFIG";

pub const ENV_VK_TOKEN: &str = "VK_ACCESS_TOKEN";
pub const ENV_TELEGRAM_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
pub const ENV_RENDER_TOKEN: &str = "RENDER_SERVICE_TOKEN";

fn default_interval_secs() -> u64 {
    300
}
fn default_error_cooldown_secs() -> u64 {
    600
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_pages() -> u32 {
    3
}
fn default_delay_min_ms() -> u64 {
    1_000
}
fn default_delay_max_ms() -> u64 {
    3_000
}
fn default_concurrency() -> usize {
    2
}
fn default_max_consecutive_failures() -> u32 {
    2
}
fn default_captcha_markers() -> Vec<String> {
    vec![
        "доступ ограничен".to_string(),
        "подтвердите, что вы не робот".to_string(),
        "are you a robot".to_string(),
    ]
}
fn default_cookie_path() -> String {
    "state/render_cookies.json".to_string()
}
fn default_min_description_len() -> usize {
    10
}
fn default_store_path() -> Option<String> {
    Some("state/announcements.json".to_string())
}
fn default_true() -> bool {
    true
}
fn default_send_delay_ms() -> u64 {
    2_000
}
fn default_media_timeout_secs() -> u64 {
    10
}
fn default_media_max_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_vk_api_base() -> String {
    "https://api.vk.com/method".to_string()
}
fn default_vk_api_version() -> String {
    "5.199".to_string()
}
fn default_vk_description_limit() -> usize {
    500
}
fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}
fn default_telegram_description_limit() -> usize {
    800
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub filter: FilterSection,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Pause after an aborted cycle; always longer than `interval_secs`.
    #[serde(default = "default_error_cooldown_secs")]
    pub error_cooldown_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            error_cooldown_secs: default_error_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FetchStrategy {
    #[default]
    Http,
    Rendered,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetcherConfig {
    #[serde(default)]
    pub strategy: FetchStrategy,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_delay_min_ms")]
    pub delay_min_ms: u64,
    #[serde(default = "default_delay_max_ms")]
    pub delay_max_ms: u64,
    /// Sources ingested in parallel.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub proxies: Vec<String>,
    #[serde(default = "default_captcha_markers")]
    pub captcha_markers: Vec<String>,
    #[serde(default)]
    pub rendered: Option<RenderedConfig>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            strategy: FetchStrategy::default(),
            timeout_secs: default_timeout_secs(),
            max_pages: default_max_pages(),
            delay_min_ms: default_delay_min_ms(),
            delay_max_ms: default_delay_max_ms(),
            concurrency: default_concurrency(),
            max_consecutive_failures: default_max_consecutive_failures(),
            user_agent: None,
            proxies: Vec::new(),
            captcha_markers: default_captcha_markers(),
            rendered: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderedConfig {
    pub endpoint: String,
    /// Bearer token for the render service; "ENV" reads RENDER_SERVICE_TOKEN.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_cookie_path")]
    pub cookie_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterSection {
    #[serde(default)]
    pub stop_words: Vec<String>,
    /// Optional stop-word list file (TOML `words = [...]` or JSON array).
    #[serde(default)]
    pub stop_words_path: Option<String>,
    #[serde(default)]
    pub min_price: u64,
    #[serde(default = "default_min_description_len")]
    pub min_description_len: usize,
}

impl Default for FilterSection {
    fn default() -> Self {
        Self {
            stop_words: Vec::new(),
            stop_words_path: None,
            min_price: 0,
            min_description_len: default_min_description_len(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// JSON state file. Empty keeps announcements in memory only.
    #[serde(default = "default_store_path")]
    pub path: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub vk: Option<VkConfig>,
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
    #[serde(default = "default_media_timeout_secs")]
    pub media_timeout_secs: u64,
    #[serde(default = "default_media_max_bytes")]
    pub media_max_bytes: usize,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            vk: None,
            telegram: None,
            media_timeout_secs: default_media_timeout_secs(),
            media_max_bytes: default_media_max_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VkConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// "ENV" means: read from VK_ACCESS_TOKEN
    pub access_token: String,
    /// category -> community id (sign is ignored)
    #[serde(default)]
    pub groups: HashMap<String, i64>,
    #[serde(default = "default_vk_api_base")]
    pub api_base: String,
    #[serde(default = "default_vk_api_version")]
    pub api_version: String,
    #[serde(default = "default_vk_description_limit")]
    pub description_limit: usize,
    #[serde(default = "default_send_delay_ms")]
    pub send_delay_ms: u64,
    #[serde(default)]
    pub send_jitter_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// "ENV" means: read from TELEGRAM_BOT_TOKEN
    pub bot_token: String,
    /// category -> chat id or @channel_name
    #[serde(default)]
    pub channels: HashMap<String, String>,
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
    #[serde(default = "default_telegram_description_limit")]
    pub description_limit: usize,
    #[serde(default = "default_send_delay_ms")]
    pub send_delay_ms: u64,
    #[serde(default)]
    pub send_jitter_ms: u64,
}

impl Default for VkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            access_token: String::new(),
            groups: HashMap::new(),
            api_base: default_vk_api_base(),
            api_version: default_vk_api_version(),
            description_limit: default_vk_description_limit(),
            send_delay_ms: default_send_delay_ms(),
            send_jitter_ms: 0,
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bot_token: String::new(),
            channels: HashMap::new(),
            api_base: default_telegram_api_base(),
            description_limit: default_telegram_description_limit(),
            send_delay_ms: default_send_delay_ms(),
            send_jitter_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// e.g. "127.0.0.1:8080"; status server is off when absent.
    #[serde(default)]
    pub bind: Option<String>,
}

impl AppConfig {
    /// Load using `$LISTING_RELAY_CONFIG` or `config/relay.toml`.
    pub fn load() -> Result<Self> {
        let path = env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from_file(&path)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading relay config from {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("parsing relay config {}", path.display()))
    }

    /// Parse, resolve "ENV" secrets and sanitize numeric settings.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut cfg: AppConfig = toml::from_str(s)?;
        cfg.resolve_secrets()?;
        cfg.sanitize();
        Ok(cfg)
    }

    fn resolve_secrets(&mut self) -> Result<()> {
        // Disabled channels may keep "ENV" placeholders without the variable set.
        if let Some(vk) = self.channels.vk.as_mut().filter(|c| c.enabled) {
            vk.access_token = resolve_secret(&vk.access_token, ENV_VK_TOKEN)?;
        }
        if let Some(tg) = self.channels.telegram.as_mut().filter(|c| c.enabled) {
            tg.bot_token = resolve_secret(&tg.bot_token, ENV_TELEGRAM_TOKEN)?;
        }
        if let Some(r) = self.fetcher.rendered.as_mut() {
            if let Some(tok) = r.token.as_deref() {
                r.token = Some(resolve_secret(tok, ENV_RENDER_TOKEN)?);
            }
        }
        Ok(())
    }

    fn sanitize(&mut self) {
        let sch = &mut self.scheduler;
        sch.interval_secs = sch.interval_secs.max(1);
        if sch.error_cooldown_secs <= sch.interval_secs {
            sch.error_cooldown_secs = sch.interval_secs.saturating_mul(2);
        }

        let f = &mut self.fetcher;
        f.max_pages = f.max_pages.max(1);
        f.concurrency = f.concurrency.max(1);
        f.max_consecutive_failures = f.max_consecutive_failures.max(1);
        f.timeout_secs = f.timeout_secs.max(1);
        if f.delay_min_ms > f.delay_max_ms {
            std::mem::swap(&mut f.delay_min_ms, &mut f.delay_max_ms);
        }
        f.proxies.retain(|p| !p.trim().is_empty());
    }

    /// category -> signature, first non-empty signature per category wins.
    pub fn signatures(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        for s in &self.sources {
            if s.signature.is_empty() {
                continue;
            }
            out.entry(s.category.clone())
                .or_insert_with(|| s.signature.clone());
        }
        out
    }

    /// Filter settings with inline stop words merged with the stop-word list file.
    pub fn filter_config(&self) -> Result<FilterConfig> {
        let mut words = self.filter.stop_words.clone();
        let from_file = match self.filter.stop_words_path.as_deref() {
            Some(p) => stop_words::load_stop_words_from(Path::new(p))?,
            None => stop_words::load_stop_words_default()?,
        };
        words.extend(from_file);
        Ok(FilterConfig {
            stop_words: stop_words::clean_list(words),
            min_price: self.filter.min_price,
            min_description_len: self.filter.min_description_len,
        })
    }
}

fn resolve_secret(raw: &str, env_name: &str) -> Result<String> {
    if raw.trim().eq_ignore_ascii_case("env") {
        return env::var(env_name).map_err(|_| anyhow!("Missing {env_name} env var"));
    }
    Ok(raw.to_string())
}
