// src/pipeline.rs
//! One relay cycle: ingest every enabled source, filter, upsert the accepted
//! records as a single batch, then publish pending announcements per channel.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::AppConfig;
use crate::error::CycleError;
use crate::filter::{self, FilterConfig};
use crate::ingest::extract::Extractor;
use crate::ingest::fetcher::{FetchSettings, Fetcher};
use crate::ingest::providers::build_transport;
use crate::ingest::types::{RawListing, SourceConfig};
use crate::ingest::{ingest_source, SourceReport};
use crate::publish::media::MediaFetcher;
use crate::publish::telegram::TelegramPublisher;
use crate::publish::vk::VkPublisher;
use crate::publish::{ChannelReport, PublishRouter};
use crate::store::{AnnouncementStore, UpsertStats};

/// Timeout for channel API calls.
const CHANNEL_API_TIMEOUT: Duration = Duration::from_secs(30);

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("pipeline_cycles_total", "Finished cycles by result.");
        describe_counter!("filter_rejected_total", "Rejected candidates by reason.");
        describe_counter!("filter_accepted_total", "Accepted candidates.");
        describe_histogram!("pipeline_cycle_ms", "Cycle duration in milliseconds.");
        describe_gauge!("pipeline_last_cycle_ts", "Unix ts of the last finished cycle.");
    });
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub sources: Vec<SourceReport>,
    pub candidates: usize,
    pub accepted: usize,
    /// reject reason kind -> count
    pub rejected: BTreeMap<String, usize>,
    pub upsert: UpsertStats,
    pub channels: Vec<ChannelReport>,
}

impl CycleReport {
    pub fn published(&self) -> usize {
        self.channels.iter().map(|c| c.published).sum()
    }

    pub fn failed(&self) -> usize {
        self.channels.iter().map(|c| c.failed).sum()
    }
}

pub struct Pipeline {
    fetcher: Fetcher,
    extractor: Extractor,
    filter: FilterConfig,
    sources: Vec<SourceConfig>,
    max_pages: u32,
    concurrency: usize,
    store: Arc<dyn AnnouncementStore>,
    router: PublishRouter,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fetcher: Fetcher,
        extractor: Extractor,
        filter: FilterConfig,
        sources: Vec<SourceConfig>,
        max_pages: u32,
        concurrency: usize,
        store: Arc<dyn AnnouncementStore>,
        router: PublishRouter,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            filter,
            sources,
            max_pages: max_pages.max(1),
            concurrency: concurrency.max(1),
            store,
            router,
        }
    }

    /// Wire transport, extractor, filter and enabled channels from config.
    pub fn from_config(cfg: &AppConfig, store: Arc<dyn AnnouncementStore>) -> Result<Self> {
        let transport = build_transport(&cfg.fetcher)?;
        let fetcher = Fetcher::new(transport, FetchSettings::from_config(&cfg.fetcher));
        let extractor = Extractor::new().context("compiling extraction rules")?;
        let filter = cfg.filter_config().context("loading filter settings")?;

        let media = MediaFetcher::new(
            Duration::from_secs(cfg.channels.media_timeout_secs),
            cfg.channels.media_max_bytes,
        )?;
        let mut router = PublishRouter::new(store.clone(), media, cfg.signatures());
        if let Some(vk) = cfg.channels.vk.as_ref().filter(|c| c.enabled) {
            router = router.with_channel(
                Arc::new(VkPublisher::new(vk, CHANNEL_API_TIMEOUT)?),
                vk.send_delay_ms,
                vk.send_jitter_ms,
            );
        }
        if let Some(tg) = cfg.channels.telegram.as_ref().filter(|c| c.enabled) {
            router = router.with_channel(
                Arc::new(TelegramPublisher::new(tg, CHANNEL_API_TIMEOUT)?),
                tg.send_delay_ms,
                tg.send_jitter_ms,
            );
        }
        if router.channel_ids().is_empty() {
            tracing::warn!(target: "pipeline", "no channels enabled, announcements will only be stored");
        }

        Ok(Self::new(
            fetcher,
            extractor,
            filter,
            cfg.sources.clone(),
            cfg.fetcher.max_pages,
            cfg.fetcher.concurrency,
            store,
            router,
        ))
    }

    pub fn store(&self) -> Arc<dyn AnnouncementStore> {
        self.store.clone()
    }

    /// Run one full cycle. Only a store failure aborts it.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        ensure_metrics_described();
        let started_at = Utc::now();
        let t0 = Instant::now();

        let enabled: Vec<&SourceConfig> = self.sources.iter().filter(|s| s.enabled).collect();
        tracing::info!(
            target: "pipeline",
            sources = enabled.len(),
            transport = self.fetcher.transport_name(),
            "cycle started"
        );

        // Boxed up front so the cycle future stays Send for the scheduler task.
        let jobs: Vec<BoxFuture<'_, (Vec<RawListing>, SourceReport)>> = enabled
            .into_iter()
            .map(|s| ingest_source(&self.fetcher, &self.extractor, s, self.max_pages).boxed())
            .collect();
        let results: Vec<(Vec<RawListing>, SourceReport)> = stream::iter(jobs)
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut candidates = Vec::new();
        let mut sources = Vec::with_capacity(results.len());
        for (mut listings, report) in results {
            candidates.append(&mut listings);
            sources.push(report);
        }
        let candidate_count = candidates.len();

        let (accepted, rejections) = filter::filter(candidates, &self.filter);
        let mut rejected: BTreeMap<String, usize> = BTreeMap::new();
        for r in &rejections {
            *rejected.entry(r.reason.kind().to_string()).or_default() += 1;
            counter!("filter_rejected_total", "reason" => r.reason.kind()).increment(1);
        }
        counter!("filter_accepted_total").increment(accepted.len() as u64);
        let accepted_count = accepted.len();

        let upsert = match self.store.upsert_batch(accepted).await {
            Ok(s) => s,
            Err(e) => {
                counter!("pipeline_cycles_total", "result" => "aborted").increment(1);
                tracing::error!(target: "pipeline", error = %e, "store failed, cycle aborted");
                return Err(CycleError::Persistence(e));
            }
        };
        tracing::info!(
            target: "pipeline",
            candidates = candidate_count,
            accepted = accepted_count,
            new = upsert.new,
            updated = upsert.updated,
            duplicate = upsert.duplicate,
            "batch stored"
        );

        let channels = self.router.publish_all().await;

        let duration = t0.elapsed();
        let report = CycleReport {
            started_at,
            duration_ms: duration.as_millis() as u64,
            sources,
            candidates: candidate_count,
            accepted: accepted_count,
            rejected,
            upsert,
            channels,
        };

        counter!("pipeline_cycles_total", "result" => "ok").increment(1);
        histogram!("pipeline_cycle_ms").record(duration.as_secs_f64() * 1_000.0);
        gauge!("pipeline_last_cycle_ts").set(Utc::now().timestamp() as f64);
        tracing::info!(
            target: "pipeline",
            published = report.published(),
            failed = report.failed(),
            ms = report.duration_ms,
            "cycle finished"
        );

        Ok(report)
    }
}
