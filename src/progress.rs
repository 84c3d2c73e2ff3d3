use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Progress reported by pool tasks. Tasks only send; one reporter task consumes.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    TermCrawled { category: String, term: String, urls: usize },
    TermFailed { category: String, term: String, reason: String },
    Downloaded { url: String, path: PathBuf },
    InvalidUrl { url: String },
    DownloadFailed { url: String, reason: String },
}

impl ProgressEvent {
    fn is_failure(&self) -> bool {
        matches!(self, Self::TermFailed { .. } | Self::InvalidUrl { .. } | Self::DownloadFailed { .. })
    }
}

/// Final tallies of one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Sending half; clone into every task.
#[derive(Clone)]
pub struct ProgressSink(mpsc::UnboundedSender<ProgressEvent>);

impl ProgressSink {
    /// A closed reporter is not an error for the sender.
    pub fn send(&self, event: ProgressEvent) { let _ = self.0.send(event); }
}

pub struct ProgressReporter {
    handle: JoinHandle<ProgressSummary>,
}

impl ProgressReporter {
    /// Resolves once every sink has been dropped and the queue is drained.
    pub async fn finish(self) -> ProgressSummary {
        self.handle.await.unwrap_or_default()
    }
}

/// Start a reporter for a stage of `total` expected events.
pub fn channel(stage: &'static str, total: usize) -> (ProgressSink, ProgressReporter) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
    let handle = tokio::spawn(async move {
        let mut summary = ProgressSummary { total, ..Default::default() };
        while let Some(event) = rx.recv().await {
            summary.completed += 1;
            if event.is_failure() { summary.failed += 1; }
            log_event(stage, &summary, &event);
        }
        info!(stage, completed = summary.completed, failed = summary.failed, total, "stage finished");
        summary
    });
    (ProgressSink(tx), ProgressReporter { handle })
}

fn log_event(stage: &str, s: &ProgressSummary, event: &ProgressEvent) {
    let (done, total) = (s.completed, s.total);
    match event {
        ProgressEvent::TermCrawled { category, term, urls } => {
            info!(stage, done, total, %category, %term, urls, "images retrieved for term");
        }
        ProgressEvent::TermFailed { category, term, reason } => {
            warn!(stage, done, total, %category, %term, %reason, "term crawl failed");
        }
        ProgressEvent::Downloaded { url, path } => {
            debug!(stage, done, total, %url, path = %path.display(), "downloaded");
        }
        ProgressEvent::InvalidUrl { url } => debug!(stage, done, total, %url, "invalid url"),
        ProgressEvent::DownloadFailed { url, reason } => {
            warn!(stage, done, total, %url, %reason, "download failed");
        }
    }
}
