use anyhow::{Context, Result};
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use crate::crawl::UrlMap;
use crate::manifest::{DedupRegistry, Manifest};
use crate::pool::WorkerPool;
use crate::progress::{self, ProgressEvent, ProgressSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub category: String,
    pub term: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded(PathBuf),
    /// Request failed, non-success status, or not an image content type.
    InvalidUrl,
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    /// One entry per job, in submission order.
    pub records: Vec<(DownloadJob, DownloadOutcome)>,
    pub manifest: Manifest,
}

impl DownloadReport {
    pub fn downloaded(&self) -> usize { self.count(|o| matches!(o, DownloadOutcome::Downloaded(_))) }
    pub fn invalid(&self) -> usize { self.count(|o| matches!(o, DownloadOutcome::InvalidUrl)) }
    pub fn failed(&self) -> usize { self.count(|o| matches!(o, DownloadOutcome::Failed(_))) }

    fn count(&self, f: impl Fn(&DownloadOutcome) -> bool) -> usize {
        self.records.iter().filter(|(_, o)| f(o)).count()
    }
}

/// Validates and fetches discovered URLs into `root/category/term/<file>`.
///
/// Submissions are spaced by `submit_delay`; the injected pool bounds concurrent
/// transfers. The registry only ever holds paths whose transfer completed.
pub struct DownloadManager {
    client: reqwest::Client,
    pool: WorkerPool,
    root: PathBuf,
    submit_delay: Duration,
    registry: DedupRegistry,
    part_seq: Arc<AtomicU64>,
}

impl DownloadManager {
    pub fn new(
        client: reqwest::Client,
        pool: WorkerPool,
        root: impl Into<PathBuf>,
        submit_delay: Duration,
    ) -> Self {
        Self {
            client,
            pool,
            root: root.into(),
            submit_delay,
            registry: DedupRegistry::new(),
            part_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Share an existing registry (e.g. across several `download_all` batches).
    pub fn with_registry(mut self, registry: DedupRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn root(&self) -> &Path { &self.root }
    pub fn registry(&self) -> &DedupRegistry { &self.registry }
    pub fn manifest(&self) -> Manifest { self.registry.snapshot() }

    pub async fn export_manifest(&self, path: &Path) -> Result<Manifest> {
        let manifest = self.manifest();
        manifest.write(path).await?;
        info!(path = %path.display(), entries = manifest.len(), "manifest exported");
        Ok(manifest)
    }

    pub async fn download_all(&self, urls: &UrlMap) -> DownloadReport {
        let jobs = jobs(urls);
        let total = jobs.len();
        info!(
            jobs = total,
            workers = self.pool.size(),
            delay = ?self.submit_delay,
            root = %self.root.display(),
            "download started"
        );
        tokio::fs::create_dir_all(&self.root).await.ok();
        let (sink, reporter) = progress::channel("download", total);

        let mut records = Vec::with_capacity(total);
        let mut handles = Vec::with_capacity(total);
        for (i, job) in jobs.into_iter().enumerate() {
            if i > 0 && !self.submit_delay.is_zero() {
                tokio::time::sleep(self.submit_delay).await;
            }
            let task = run_job(self.fetcher(), job.clone(), sink.clone());
            match self.pool.submit(task) {
                Ok(handle) => handles.push((job, handle)),
                Err(e) => records.push((job, DownloadOutcome::Failed(format!("{e:#}")))),
            }
        }
        for (job, handle) in handles {
            let outcome = handle.await
                .unwrap_or_else(|e| DownloadOutcome::Failed(format!("download task aborted: {e}")));
            records.push((job, outcome));
        }

        drop(sink);
        reporter.finish().await;
        let report = DownloadReport { records, manifest: self.registry.snapshot() };
        info!(
            downloaded = report.downloaded(),
            invalid = report.invalid(),
            failed = report.failed(),
            "download finished"
        );
        report
    }

    /// Download a single job on the current task, bypassing the pool.
    pub async fn download_one(&self, job: &DownloadJob) -> DownloadOutcome {
        self.fetcher().fetch(job).await
    }

    fn fetcher(&self) -> Fetcher {
        Fetcher {
            client: self.client.clone(),
            root: self.root.clone(),
            registry: self.registry.clone(),
            part_seq: self.part_seq.clone(),
        }
    }
}

/// Flatten the URL map into jobs: categories, then terms, then URLs in discovery order.
pub fn jobs(urls: &UrlMap) -> Vec<DownloadJob> {
    urls.iter()
        .flat_map(|(category, terms)| terms.iter().map(move |(term, list)| (category, term, list)))
        .flat_map(|(category, term, list)| {
            list.iter().map(move |url| DownloadJob {
                category: category.clone(),
                term: term.clone(),
                url: url.clone(),
            })
        })
        .collect()
}

/// `root/category/term/<last path segment>`; `None` when the URL path has no file name.
pub fn destination(root: &Path, category: &str, term: &str, url: &Url) -> Option<PathBuf> {
    let name = url.path_segments()?.next_back().filter(|s| !s.is_empty() && *s != "." && *s != "..")?;
    Some(root.join(category).join(term).join(name))
}

fn is_image(resp: &reqwest::Response) -> bool {
    resp.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
        .is_some_and(|mime| mime.starts_with("image/"))
}

async fn run_job(fetcher: Fetcher, job: DownloadJob, sink: ProgressSink) -> DownloadOutcome {
    let outcome = fetcher.fetch(&job).await;
    let url = job.url;
    sink.send(match &outcome {
        DownloadOutcome::Downloaded(path) => ProgressEvent::Downloaded { url, path: path.clone() },
        DownloadOutcome::InvalidUrl => ProgressEvent::InvalidUrl { url },
        DownloadOutcome::Failed(reason) => ProgressEvent::DownloadFailed { url, reason: reason.clone() },
    });
    outcome
}

/// Per-task handle on the manager's shared state.
struct Fetcher {
    client: reqwest::Client,
    root: PathBuf,
    registry: DedupRegistry,
    part_seq: Arc<AtomicU64>,
}

impl Fetcher {
    async fn fetch(&self, job: &DownloadJob) -> DownloadOutcome {
        let Ok(url) = Url::parse(&job.url) else { return DownloadOutcome::InvalidUrl };
        let resp = match self.client.get(url.clone()).send().await {
            Ok(resp) if resp.status().is_success() && is_image(&resp) => resp,
            Ok(resp) => {
                debug!(%url, status = %resp.status(), "rejected: not a successful image response");
                return DownloadOutcome::InvalidUrl;
            }
            Err(e) => {
                debug!(%url, error = %e, "rejected: request failed");
                return DownloadOutcome::InvalidUrl;
            }
        };

        let Some(dest) = destination(&self.root, &job.category, &job.term, &url) else {
            return DownloadOutcome::Failed("url has no file name".into());
        };
        match self.transfer(resp, &dest).await {
            Ok(()) => {
                self.registry.insert(dest.clone());
                DownloadOutcome::Downloaded(dest)
            }
            Err(e) => DownloadOutcome::Failed(format!("{e:#}")),
        }
    }

    /// Stream into a private part file, then rename over `dest`: concurrent writers to
    /// the same destination resolve last-writer-wins and never interleave.
    async fn transfer(&self, resp: reqwest::Response, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let seq = self.part_seq.fetch_add(1, Ordering::Relaxed);
        let mut part = dest.as_os_str().to_owned();
        part.push(format!(".part{seq}"));
        let part = PathBuf::from(part);

        let written = write_body(resp, &part).await;
        match written {
            Ok(0) => {
                tokio::fs::remove_file(&part).await.ok();
                anyhow::bail!("empty response body")
            }
            Ok(_) => tokio::fs::rename(&part, dest).await
                .with_context(|| format!("moving download into {}", dest.display())),
            Err(e) => {
                tokio::fs::remove_file(&part).await.ok();
                Err(e)
            }
        }
    }
}

async fn write_body(resp: reqwest::Response, path: &Path) -> Result<u64> {
    let mut file = tokio::fs::File::create(path).await
        .with_context(|| format!("creating {}", path.display()))?;
    let mut body = resp.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("reading response body")?;
        file.write_all(&chunk).await.context("writing image file")?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn destination_uses_last_path_segment() {
        let url = Url::parse("https://live.staticflickr.com/65535/123_abc_b.jpg?x=1").unwrap();
        assert_eq!(
            destination(Path::new("Dataset"), "animal", "Cat", &url).unwrap(),
            PathBuf::from("Dataset/animal/Cat/123_abc_b.jpg")
        );
        let dir = Url::parse("https://img.example/photos/").unwrap();
        assert!(destination(Path::new("Dataset"), "animal", "Cat", &dir).is_none());
    }

    #[test]
    fn jobs_flatten_in_map_order() {
        let mut urls = UrlMap::new();
        let mut animal = BTreeMap::new();
        animal.insert("Cat".to_string(), vec!["u1".to_string(), "u2".to_string()]);
        animal.insert("Dog".to_string(), vec!["u3".to_string()]);
        urls.insert("animal".to_string(), animal);
        urls.insert("plant".to_string(), BTreeMap::new());
        let flat: Vec<_> = jobs(&urls).into_iter().map(|j| (j.term, j.url)).collect();
        assert_eq!(flat, vec![
            ("Cat".to_string(), "u1".to_string()),
            ("Cat".to_string(), "u2".to_string()),
            ("Dog".to_string(), "u3".to_string()),
        ]);
    }
}
