pub mod config;
pub mod crawl;
pub mod download;
pub mod manifest;
pub mod normalize;
pub mod pagination;
pub mod partition;
pub mod pool;
pub mod progress;
pub mod sanitize;
pub mod source;

// --- Library API for embedding ---

/// Convenience re-exports for embedders.
pub mod prelude {
    pub use crate::config::{Categories, HarvestConfig};
    pub use crate::crawl::{CrawlReport, UrlMap};
    pub use crate::download::{DownloadOutcome, DownloadReport};
    pub use crate::manifest::{DedupRegistry, Manifest};
    pub use crate::partition::{DatasetItem, PartitionReport, Split, SplitPolicy};
    pub use crate::sanitize::SanitizeReport;
    pub use crate::source::{GalleryPage, GallerySource};
    pub use crate::{Harvester, PipelineReport};
}

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::config::HarvestConfig;
use crate::crawl::{CrawlOrchestrator, CrawlReport, UrlMap};
use crate::download::{DownloadManager, DownloadReport};
use crate::manifest::{DedupRegistry, Manifest};
use crate::pagination::PaginationSettings;
use crate::partition::{DatasetPartitioner, PartitionReport};
use crate::pool::WorkerPool;
use crate::sanitize::{ImageSanitizer, SanitizeReport};
use crate::source::{GallerySource, HttpGallerySource};

/// Everything one full pipeline run produced.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub crawl: CrawlReport,
    pub download: DownloadReport,
    pub sanitize: SanitizeReport,
    pub partition: PartitionReport,
}

/// Async library entry point. Owns the HTTP client, both worker pools and the
/// download registry for the lifetime of a run.
pub struct Harvester {
    config: HarvestConfig,
    client: reqwest::Client,
    source: Arc<dyn GallerySource>,
    crawl_pool: WorkerPool,
    download_pool: WorkerPool,
    registry: DedupRegistry,
}

impl Harvester {
    /// Harvester over the static-HTML gallery source at `config.url_template`.
    pub fn new(config: HarvestConfig) -> Result<Self> {
        let client = build_client(&config)?;
        let source = Arc::new(HttpGallerySource::new(client.clone(), config.url_template.clone()));
        Ok(Self::assemble(config, client, source))
    }

    /// Harvester crawling through a caller-provided gallery source (e.g. a browser driver).
    pub fn with_source(config: HarvestConfig, source: Arc<dyn GallerySource>) -> Result<Self> {
        let client = build_client(&config)?;
        Ok(Self::assemble(config, client, source))
    }

    fn assemble(config: HarvestConfig, client: reqwest::Client, source: Arc<dyn GallerySource>) -> Self {
        let crawl_pool = WorkerPool::new("crawl", config.crawl_workers);
        let download_pool = WorkerPool::new("download", config.download_workers);
        Self { config, client, source, crawl_pool, download_pool, registry: DedupRegistry::new() }
    }

    pub fn config(&self) -> &HarvestConfig { &self.config }

    /// Paths downloaded so far in this harvester's lifetime.
    pub fn manifest(&self) -> Manifest { self.registry.snapshot() }

    pub async fn crawl(&self) -> CrawlReport {
        let settings = PaginationSettings {
            load_more_timeout: self.config.load_more_timeout(),
            settle_delay: self.config.settle_delay(),
            max_rounds: self.config.max_pagination_rounds,
        };
        CrawlOrchestrator::new(
            self.source.clone(),
            self.crawl_pool.clone(),
            self.config.normalizer(),
            settings,
            self.config.max_images_per_term,
        )
        .crawl(&self.config.categories)
        .await
    }

    pub async fn download(&self, urls: &UrlMap) -> DownloadReport {
        self.downloader().download_all(urls).await
    }

    pub async fn sanitize(&self) -> Result<SanitizeReport> {
        ImageSanitizer::new(self.config.min_dimension).sanitize(&self.config.dataset_dir).await
    }

    pub async fn partition(&self, manifest: &Manifest) -> Result<PartitionReport> {
        DatasetPartitioner::new(
            &self.config.dataset_dir,
            &self.config.train_dir,
            &self.config.test_dir,
            self.config.split,
        )
        .partition(manifest)
        .await
    }

    /// Crawl, download, sanitize and partition, persisting the URL map and manifest
    /// at their configured paths along the way.
    pub async fn run(&self) -> Result<PipelineReport> {
        let crawl = self.crawl().await;
        crawl.save(&self.config.urls_file).await?;

        let downloader = self.downloader();
        let download = downloader.download_all(&crawl.urls).await;
        let manifest = downloader.export_manifest(&self.config.manifest_file).await
            .context("exporting manifest")?;

        let sanitize = self.sanitize().await?;
        let partition = self.partition(&manifest).await?;
        info!(
            urls = crawl.total_urls(),
            downloaded = download.downloaded(),
            removed = sanitize.removed.len(),
            items = partition.items.len(),
            "pipeline finished"
        );
        Ok(PipelineReport { crawl, download, sanitize, partition })
    }

    /// Stop both pools and wait for in-flight tasks.
    pub async fn shutdown(&self) {
        self.crawl_pool.shutdown().await;
        self.download_pool.shutdown().await;
    }

    fn downloader(&self) -> DownloadManager {
        DownloadManager::new(
            self.client.clone(),
            self.download_pool.clone(),
            &self.config.dataset_dir,
            self.config.submit_delay(),
        )
        .with_registry(self.registry.clone())
    }
}

fn build_client(config: &HarvestConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .build()
        .context("building http client")
}
