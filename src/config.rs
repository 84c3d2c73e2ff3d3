use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::normalize::UrlNormalizer;
use crate::partition::SplitPolicy;

/// Category name -> ordered search terms.
pub type Categories = BTreeMap<String, Vec<String>>;

/// Run configuration. Every field has a default, so a TOML file only needs the
/// keys it wants to change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub categories: Categories,
    /// Gallery search URL; `{search_term}` is replaced by the term.
    pub url_template: String,
    pub user_agent: String,
    pub max_images_per_term: usize,
    pub crawl_workers: usize,
    pub download_workers: usize,
    pub submit_delay_ms: u64,
    pub load_more_timeout_ms: u64,
    pub settle_delay_ms: u64,
    pub max_pagination_rounds: usize,
    pub dataset_dir: PathBuf,
    pub train_dir: PathBuf,
    pub test_dir: PathBuf,
    pub urls_file: PathBuf,
    pub manifest_file: PathBuf,
    pub min_dimension: u32,
    pub split: SplitPolicy,
    pub normalizer: NormalizerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    pub low_res_suffixes: Vec<String>,
    pub high_res_suffix: String,
    pub denylist: Vec<String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            low_res_suffixes: vec!["_m.jpg".into(), "_n.jpg".into(), "_w.jpg".into()],
            high_res_suffix: "_b.jpg".into(),
            denylist: vec![
                "https://combo.staticflickr.com/ap/build/images/getty/IStock_corporate_logo.svg".into(),
            ],
        }
    }
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            categories: Categories::new(),
            url_template: "https://www.flickr.com/search/?text={search_term}".into(),
            user_agent: concat!("harvest/", env!("CARGO_PKG_VERSION")).into(),
            max_images_per_term: 20,
            crawl_workers: 5,
            download_workers: 4,
            submit_delay_ms: 1000,
            load_more_timeout_ms: 10_000,
            settle_delay_ms: 2000,
            max_pagination_rounds: 200,
            dataset_dir: PathBuf::from("Dataset"),
            train_dir: PathBuf::from("data/train"),
            test_dir: PathBuf::from("data/test"),
            urls_file: PathBuf::from("image_urls.json"),
            manifest_file: PathBuf::from("filename.txt"),
            min_dimension: 50,
            split: SplitPolicy::default(),
            normalizer: NormalizerConfig::default(),
        }
    }
}

impl HarvestConfig {
    /// Load from an explicit file, else the per-user config file if present, else defaults.
    /// `HARVEST_*` environment variables are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path().filter(|p| p.exists()),
        };
        let mut cfg = match file {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config: {}", path.display()))
    }

    fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Unset or unparsable values leave the field alone.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parse = |key: &str| lookup(key).and_then(|s| s.trim().parse().ok());
        if let Some(v) = parse("HARVEST_CRAWL_WORKERS") { self.crawl_workers = v; }
        if let Some(v) = parse("HARVEST_DOWNLOAD_WORKERS") { self.download_workers = v; }
        if let Some(v) = parse("HARVEST_MAX_IMAGES") { self.max_images_per_term = v; }
        if let Some(v) = lookup("HARVEST_SUBMIT_DELAY_MS").and_then(|s| s.trim().parse().ok()) {
            self.submit_delay_ms = v;
        }
    }

    pub fn submit_delay(&self) -> Duration { Duration::from_millis(self.submit_delay_ms) }
    pub fn load_more_timeout(&self) -> Duration { Duration::from_millis(self.load_more_timeout_ms) }
    pub fn settle_delay(&self) -> Duration { Duration::from_millis(self.settle_delay_ms) }

    pub fn normalizer(&self) -> UrlNormalizer {
        UrlNormalizer::new(
            &self.normalizer.low_res_suffixes,
            &self.normalizer.high_res_suffix,
            &self.normalizer.denylist,
        )
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("dev", "harvest", "harvest").map(|p| p.config_dir().join("harvest.toml"))
}
