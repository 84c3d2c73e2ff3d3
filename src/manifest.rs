use anyhow::{Context, Result};
use dashmap::DashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Concurrency-safe set of destination paths of successful downloads.
///
/// Cloning shares the underlying set. Inserting an existing path is a no-op, so two
/// URLs that land on the same file produce one entry.
#[derive(Debug, Clone, Default)]
pub struct DedupRegistry {
    paths: Arc<DashSet<PathBuf>>,
}

impl DedupRegistry {
    pub fn new() -> Self { Self::default() }

    /// Returns `false` if the path was already registered.
    pub fn insert(&self, path: PathBuf) -> bool { self.paths.insert(path) }
    pub fn contains(&self, path: &Path) -> bool { self.paths.contains(path) }
    pub fn len(&self) -> usize { self.paths.len() }
    pub fn is_empty(&self) -> bool { self.paths.is_empty() }

    pub fn snapshot(&self) -> Manifest {
        Manifest::new(self.paths.iter().map(|p| p.key().clone()))
    }
}

/// Sorted, duplicate-free list of downloaded file paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<PathBuf>,
}

impl Manifest {
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        let mut entries: Vec<PathBuf> = paths.into_iter().collect();
        entries.sort();
        entries.dedup();
        Self { entries }
    }

    pub fn entries(&self) -> &[PathBuf] { &self.entries }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// One path per line, sorted.
    pub fn to_text(&self) -> String {
        self.entries.iter().map(|p| format!("{}\n", p.display())).collect()
    }

    pub fn from_text(text: &str) -> Self {
        Self::new(text.lines().map(str::trim).filter(|l| !l.is_empty()).map(PathBuf::from))
    }

    pub async fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::write(path, self.to_text()).await
            .with_context(|| format!("writing manifest: {}", path.display()))
    }

    pub async fn read(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await
            .with_context(|| format!("reading manifest: {}", path.display()))?;
        Ok(Self::from_text(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_inserts_lose_nothing_and_never_duplicate() {
        let registry = DedupRegistry::new();
        let mut handles = Vec::new();
        for worker in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..250 {
                    // Half the paths collide across workers.
                    let name = if i % 2 == 0 { format!("shared/{i}.jpg") } else { format!("w{worker}/{i}.jpg") };
                    registry.insert(PathBuf::from(name));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for h in handles { h.await.unwrap(); }
        assert_eq!(registry.len(), 125 + 8 * 125);
        let manifest = registry.snapshot();
        assert_eq!(manifest.len(), registry.len());
        assert!(manifest.entries().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn insert_reports_duplicates() {
        let registry = DedupRegistry::new();
        assert!(registry.insert(PathBuf::from("Dataset/a/b/1.jpg")));
        assert!(!registry.insert(PathBuf::from("Dataset/a/b/1.jpg")));
        assert!(registry.contains(Path::new("Dataset/a/b/1.jpg")));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn manifest_file_is_sorted_one_per_line() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("filename.txt");
        let manifest = Manifest::new(["Dataset/b/x/2.jpg", "Dataset/a/y/1.jpg", "Dataset/a/y/1.jpg"].map(PathBuf::from));
        manifest.write(&path).await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "Dataset/a/y/1.jpg\nDataset/b/x/2.jpg\n");
        assert_eq!(Manifest::read(&path).await.unwrap(), manifest);
    }
}
