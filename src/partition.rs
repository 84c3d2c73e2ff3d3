use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use crate::manifest::Manifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Test,
    Train,
    /// Left in the acquisition tree, excluded from both splits.
    Unassigned,
}

/// Per-class quotas, filled in manifest order: test first, then train.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitPolicy {
    pub test_per_class: usize,
    pub train_per_class: usize,
}

impl Default for SplitPolicy {
    fn default() -> Self { Self { test_per_class: 1, train_per_class: 19 } }
}

impl SplitPolicy {
    pub fn assign(&self, index: usize) -> Split {
        if index < self.test_per_class {
            Split::Test
        } else if index < self.test_per_class + self.train_per_class {
            Split::Train
        } else {
            Split::Unassigned
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetItem {
    pub path: PathBuf,
    pub label: String,
    pub split: Split,
}

#[derive(Debug, Clone, Default)]
pub struct PartitionReport {
    pub items: Vec<DatasetItem>,
    /// Manifest entries no longer on disk (removed by sanitization) or outside the root.
    pub skipped: Vec<PathBuf>,
}

impl PartitionReport {
    pub fn count(&self, split: Split) -> usize {
        self.items.iter().filter(|i| i.split == split).count()
    }

    pub fn count_for(&self, label: &str, split: Split) -> usize {
        self.items.iter().filter(|i| i.label == label && i.split == split).count()
    }
}

/// Class label of a raw download: the term directory in `root/<category>/<term>/<file>`.
pub fn class_label(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = rel.components().filter_map(|c| match c {
        Component::Normal(s) => Some(s),
        _ => None,
    }).collect();
    match parts.as_slice() {
        [_category, term, _file] => Some(term.to_string_lossy().into_owned()),
        _ => None,
    }
}

/// Copies sanitized downloads into `train_root/<class>` and `test_root/<class>`.
/// Originals are never modified.
pub struct DatasetPartitioner {
    source_root: PathBuf,
    train_root: PathBuf,
    test_root: PathBuf,
    policy: SplitPolicy,
}

impl DatasetPartitioner {
    pub fn new(
        source_root: impl Into<PathBuf>,
        train_root: impl Into<PathBuf>,
        test_root: impl Into<PathBuf>,
        policy: SplitPolicy,
    ) -> Self {
        Self {
            source_root: source_root.into(),
            train_root: train_root.into(),
            test_root: test_root.into(),
            policy,
        }
    }

    pub async fn partition(&self, manifest: &Manifest) -> Result<PartitionReport> {
        for dir in [&self.train_root, &self.test_root] {
            tokio::fs::create_dir_all(dir).await
                .with_context(|| format!("creating {}", dir.display()))?;
        }

        let mut report = PartitionReport::default();
        let mut classes: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for path in manifest.entries() {
            let Some(label) = class_label(&self.source_root, path) else {
                warn!(
                    path = %path.display(),
                    root = %self.source_root.display(),
                    "manifest entry outside acquisition layout"
                );
                report.skipped.push(path.clone());
                continue;
            };
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                debug!(path = %path.display(), "skipping removed file");
                report.skipped.push(path.clone());
                continue;
            }
            classes.entry(label).or_default().push(path.clone());
        }

        for (label, files) in classes {
            let test_dir = self.test_root.join(&label);
            let train_dir = self.train_root.join(&label);
            for dir in [&test_dir, &train_dir] {
                tokio::fs::create_dir_all(dir).await
                    .with_context(|| format!("creating {}", dir.display()))?;
            }

            for (index, path) in files.into_iter().enumerate() {
                let mut split = self.policy.assign(index);
                let target = match split {
                    Split::Test => Some(&test_dir),
                    Split::Train => Some(&train_dir),
                    Split::Unassigned => None,
                };
                if let (Some(dir), Some(name)) = (target, path.file_name()) {
                    let dest = dir.join(name);
                    if let Err(e) = tokio::fs::copy(&path, &dest).await {
                        warn!(
                            src = %path.display(),
                            dest = %dest.display(),
                            error = %e,
                            "copy failed; item left unassigned"
                        );
                        split = Split::Unassigned;
                    }
                }
                report.items.push(DatasetItem { path, label: label.clone(), split });
            }
        }

        info!(
            test = report.count(Split::Test),
            train = report.count(Split::Train),
            unassigned = report.count(Split::Unassigned),
            skipped = report.skipped.len(),
            "dataset partitioned"
        );
        Ok(report)
    }
}

/// `(class, file)` pairs of a partitioned split, sorted by class then file name.
pub fn inventory(split_root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    let mut classes: Vec<_> = std::fs::read_dir(split_root)
        .with_context(|| format!("reading {}", split_root.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .collect();
    classes.sort_by_key(|e| e.file_name());
    for class in classes {
        let label = class.file_name().to_string_lossy().into_owned();
        let mut files: Vec<PathBuf> = std::fs::read_dir(class.path())?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        out.extend(files.into_iter().map(|f| (label.clone(), f)));
    }
    Ok(out)
}
