use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Categories;
use crate::normalize::UrlNormalizer;
use crate::pagination::{PaginationSettings, PaginationState};
use crate::pool::WorkerPool;
use crate::progress::{self, ProgressEvent, ProgressSink};
use crate::source::GallerySource;

/// category -> term -> URLs in discovery order.
pub type UrlMap = BTreeMap<String, BTreeMap<String, Vec<String>>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermFailure {
    pub category: String,
    pub term: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct CrawlReport {
    pub urls: UrlMap,
    /// Terms that contributed an empty list because their task failed.
    pub failures: Vec<TermFailure>,
}

impl CrawlReport {
    pub fn total_urls(&self) -> usize {
        self.urls.values().flat_map(|terms| terms.values()).map(Vec::len).sum()
    }

    /// Write the URL mapping as pretty-printed UTF-8 JSON.
    pub async fn save(&self, path: &Path) -> Result<()> {
        save_url_map(&self.urls, path).await
    }

    /// Read a saved URL mapping. Diagnostics are not persisted.
    pub async fn load(path: &Path) -> Result<Self> {
        Ok(Self { urls: load_url_map(path).await?, failures: Vec::new() })
    }
}

pub async fn save_url_map(urls: &UrlMap, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let payload = serde_json::to_string_pretty(urls)?;
    tokio::fs::write(path, payload).await
        .with_context(|| format!("writing url map: {}", path.display()))?;
    info!(path = %path.display(), "url map saved");
    Ok(())
}

pub async fn load_url_map(path: &Path) -> Result<UrlMap> {
    let payload = tokio::fs::read_to_string(path).await
        .with_context(|| format!("reading url map: {}", path.display()))?;
    serde_json::from_str(&payload).with_context(|| format!("parsing url map: {}", path.display()))
}

/// Outcome of one term task.
#[derive(Debug, Default)]
struct TermCrawl {
    urls: Vec<String>,
    diagnostic: Option<String>,
}

/// Fans out one crawl task per (category, term) over the injected crawl pool.
pub struct CrawlOrchestrator {
    source: Arc<dyn GallerySource>,
    pool: WorkerPool,
    normalizer: Arc<UrlNormalizer>,
    settings: PaginationSettings,
    cap: usize,
}

impl CrawlOrchestrator {
    pub fn new(
        source: Arc<dyn GallerySource>,
        pool: WorkerPool,
        normalizer: UrlNormalizer,
        settings: PaginationSettings,
        cap: usize,
    ) -> Self {
        Self { source, pool, normalizer: Arc::new(normalizer), settings, cap }
    }

    /// Crawl every term. Returns after all tasks are terminal; a failing term never
    /// affects its siblings.
    pub async fn crawl(&self, categories: &Categories) -> CrawlReport {
        let total = categories.values().map(Vec::len).sum();
        info!(
            categories = categories.len(),
            terms = total,
            workers = self.pool.size(),
            cap = self.cap,
            "crawl started"
        );
        let (sink, reporter) = progress::channel("crawl", total);

        let mut report = CrawlReport::default();
        for category in categories.keys() {
            report.urls.entry(category.clone()).or_default();
        }

        let mut tasks = Vec::with_capacity(total);
        for (category, terms) in categories {
            for term in terms {
                let task = crawl_term(
                    self.source.clone(),
                    self.normalizer.clone(),
                    self.settings.clone(),
                    self.cap,
                    category.clone(),
                    term.clone(),
                    sink.clone(),
                );
                match self.pool.submit(task) {
                    Ok(handle) => tasks.push((category.clone(), term.clone(), handle)),
                    Err(e) => {
                        let crawl = TermCrawl { urls: Vec::new(), diagnostic: Some(format!("{e:#}")) };
                        record(&mut report, &sink, category, term, crawl);
                    }
                }
            }
        }

        for (category, term, handle) in tasks {
            let crawl = match handle.await {
                Ok(crawl) => crawl,
                Err(e) => {
                    let crawl = TermCrawl {
                        urls: Vec::new(),
                        diagnostic: Some(format!("crawl task aborted: {e}")),
                    };
                    sink.send(ProgressEvent::TermFailed {
                        category: category.clone(),
                        term: term.clone(),
                        reason: crawl.diagnostic.clone().unwrap_or_default(),
                    });
                    crawl
                }
            };
            report.urls.entry(category.clone()).or_default().insert(term.clone(), crawl.urls);
            if let Some(reason) = crawl.diagnostic {
                report.failures.push(TermFailure { category, term, reason });
            }
        }

        drop(sink);
        reporter.finish().await;
        info!(urls = report.total_urls(), failed_terms = report.failures.len(), "crawl finished");
        report
    }
}

fn record(report: &mut CrawlReport, sink: &ProgressSink, category: &str, term: &str, crawl: TermCrawl) {
    let reason = crawl.diagnostic.unwrap_or_default();
    sink.send(ProgressEvent::TermFailed {
        category: category.into(),
        term: term.into(),
        reason: reason.clone(),
    });
    report.urls.entry(category.into()).or_default().insert(term.into(), crawl.urls);
    report.failures.push(TermFailure { category: category.into(), term: term.into(), reason });
}

async fn crawl_term(
    source: Arc<dyn GallerySource>,
    normalizer: Arc<UrlNormalizer>,
    settings: PaginationSettings,
    cap: usize,
    category: String,
    term: String,
    sink: ProgressSink,
) -> TermCrawl {
    let crawl = collect_term(source.as_ref(), &normalizer, &settings, cap, &term).await;
    match &crawl.diagnostic {
        None => sink.send(ProgressEvent::TermCrawled { category, term, urls: crawl.urls.len() }),
        Some(reason) => sink.send(ProgressEvent::TermFailed { category, term, reason: reason.clone() }),
    }
    crawl
}

async fn collect_term(
    source: &dyn GallerySource,
    normalizer: &UrlNormalizer,
    settings: &PaginationSettings,
    cap: usize,
    term: &str,
) -> TermCrawl {
    if cap == 0 { return TermCrawl::default(); }
    // Initial render failure: exhausted immediately, no retry.
    let mut page = match source.open(term).await {
        Ok(page) => page,
        Err(e) => {
            return TermCrawl { urls: Vec::new(), diagnostic: Some(format!("initial render failed: {e:#}")) };
        }
    };
    let mut paginator = source.paginator(settings);
    let mut urls = Vec::new();
    let mut seen = HashSet::new();

    while urls.len() < cap {
        let sources = match page.image_sources().await {
            Ok(s) => s,
            Err(e) => {
                warn!(%term, error = %e, "render failure while extracting images");
                break;
            }
        };
        for raw in sources {
            if urls.len() >= cap { break; }
            let Some(url) = normalizer.normalize(page.base_url(), &raw) else { continue };
            let url = url.to_string();
            if seen.insert(url.clone()) { urls.push(url); }
        }
        if urls.len() >= cap { break; }
        if paginator.advance(page.as_mut()).await == PaginationState::Exhausted { break; }
    }
    TermCrawl { urls, diagnostic: None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::GalleryPage;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::time::Duration;
    use url::Url;

    /// Renders `initial` tags, then `batch` more per "load more" until `total`.
    struct GrowingPage { base: Url, shown: usize, batch: usize, total: usize, prefix: String }

    #[async_trait]
    impl GalleryPage for GrowingPage {
        fn base_url(&self) -> &Url { &self.base }
        async fn image_sources(&mut self) -> Result<Vec<String>> {
            Ok((0..self.shown).map(|i| format!("/img/{}_{i}_m.jpg", self.prefix)).collect())
        }
        async fn tag_count(&mut self) -> Result<usize> { Ok(self.shown) }
        async fn load_more(&mut self) -> Result<bool> {
            if self.shown >= self.total { return Ok(false); }
            self.shown = (self.shown + self.batch).min(self.total);
            Ok(true)
        }
        async fn scroll_to_bottom(&mut self) -> Result<()> { Ok(()) }
    }

    struct GrowingSource { initial: usize, batch: usize, total: usize }

    #[async_trait]
    impl GallerySource for GrowingSource {
        async fn open(&self, term: &str) -> Result<Box<dyn GalleryPage>> {
            match term {
                "broken" => Err(anyhow!("render timeout")),
                "panics" => panic!("driver crashed"),
                _ => Ok(Box::new(GrowingPage {
                    base: Url::parse("https://gallery.example/search").unwrap(),
                    shown: self.initial,
                    batch: self.batch,
                    total: self.total,
                    prefix: term.to_string(),
                })),
            }
        }
    }

    fn orchestrator(source: GrowingSource, cap: usize) -> CrawlOrchestrator {
        let settings = PaginationSettings {
            load_more_timeout: Duration::from_millis(100),
            settle_delay: Duration::ZERO,
            max_rounds: 50,
        };
        let normalizer = UrlNormalizer::new(&["_m.jpg"], "_b.jpg", &[] as &[&str]);
        CrawlOrchestrator::new(Arc::new(source), WorkerPool::new("crawl", 2), normalizer, settings, cap)
    }

    fn categories(pairs: Vec<(&str, Vec<&str>)>) -> Categories {
        pairs.into_iter().map(|(c, ts)| (c.to_string(), ts.into_iter().map(String::from).collect())).collect()
    }

    #[tokio::test]
    async fn respects_cap_and_discovery_order() {
        let orch = orchestrator(GrowingSource { initial: 4, batch: 4, total: 100 }, 10);
        let report = orch.crawl(&categories(vec![("animal", vec!["cat", "dog"])])).await;
        let cat = &report.urls["animal"]["cat"];
        assert_eq!(cat.len(), 10);
        assert_eq!(cat[0], "https://gallery.example/img/cat_0_b.jpg");
        assert_eq!(cat[9], "https://gallery.example/img/cat_9_b.jpg");
        assert_eq!(report.urls["animal"]["dog"].len(), 10);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn stops_when_page_is_exhausted() {
        let orch = orchestrator(GrowingSource { initial: 3, batch: 2, total: 7 }, 50);
        let report = orch.crawl(&categories(vec![("plant", vec!["fern"])])).await;
        assert_eq!(report.urls["plant"]["fern"].len(), 7, "re-scans must not duplicate urls");
    }

    #[tokio::test]
    async fn failures_are_isolated() {
        let orch = orchestrator(GrowingSource { initial: 5, batch: 0, total: 5 }, 3);
        let cats = categories(vec![("animal", vec!["cat", "broken", "panics"]), ("empty", vec![])]);
        let report = orch.crawl(&cats).await;
        assert_eq!(report.urls["animal"]["cat"].len(), 3);
        assert!(report.urls["animal"]["broken"].is_empty());
        assert!(report.urls["animal"]["panics"].is_empty());
        assert!(report.urls["empty"].is_empty());
        let mut failed: Vec<_> = report.failures.iter().map(|f| f.term.as_str()).collect();
        failed.sort();
        assert_eq!(failed, vec!["broken", "panics"]);
    }

    #[tokio::test]
    async fn url_map_round_trips_through_json_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out/image_urls.json");
        let orch = orchestrator(GrowingSource { initial: 2, batch: 0, total: 2 }, 5);
        let report = orch.crawl(&categories(vec![("animal", vec!["cat"])])).await;
        report.save(&path).await.unwrap();
        assert_eq!(CrawlReport::load(&path).await.unwrap().urls, report.urls);
        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["animal"]["cat"].as_array().unwrap().len(), 2);
    }
}
