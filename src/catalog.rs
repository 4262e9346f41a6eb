//! Static asset discovery.
//!
//! Stage 1 of the optimization pipeline. Walks the static-asset root and
//! records one [`Asset`] per file whose extension is on the allow-list:
//! size, kind, SHA-256 content hash, modification time, whether the file is
//! critical (its path matches one of the configured critical patterns), and
//! the relative paths it imports.
//!
//! ## Classification
//!
//! ```text
//! static/
//! ├── css/critical.css     # critical, priority 30 ("critical" is pattern #1)
//! ├── css/main.css         # critical, priority 20
//! ├── css/blog.css         # not critical
//! ├── img/hero.webp        # critical image → hero-images bundle
//! └── js/app.js            # not critical
//! ```
//!
//! Matching is a case-insensitive substring test on the relative path, so a
//! `critical/` directory marks everything below it.
//!
//! ## Snapshots
//!
//! A scan is never incremental. The new asset list is built off to the side
//! and swapped in under a write lock once complete, so concurrent readers see
//! either the previous catalog or the new one, never a mix.
//!
//! Hidden files (dot-prefixed) are ignored. A file that cannot be read is
//! logged and skipped; only an unreadable root fails the scan.

use crate::cache::hash_bytes;
use crate::config::AssetsConfig;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::RwLock;
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("cannot read asset root {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("asset root is not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Css,
    Js,
    Image,
    Other,
}

impl AssetKind {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "css" => AssetKind::Css,
            "js" | "mjs" => AssetKind::Js,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" | "avif" => AssetKind::Image,
            _ => AssetKind::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AssetKind::Css => "css",
            AssetKind::Js => "js",
            AssetKind::Image => "image",
            AssetKind::Other => "other",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file discovered under the static root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Path relative to the scanned root, `/`-separated.
    pub path: PathBuf,
    pub size: u64,
    pub kind: AssetKind,
    pub critical: bool,
    /// Higher survives longer when a critical bundle must shed assets.
    pub priority: i32,
    /// Relative paths referenced via `@import` / `import`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<PathBuf>,
    pub content_hash: String,
    pub last_modified: DateTime<Utc>,
}

/// Immutable view of the catalog at one point in time.
pub type Snapshot = Arc<[Arc<Asset>]>;

/// Counts reported by a completed scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub root: PathBuf,
    pub assets: usize,
    pub critical: usize,
    pub skipped: usize,
    pub total_bytes: u64,
}

/// The narrow interface the orchestrator uses; swap it out in tests.
pub trait AssetScanner: Send + Sync {
    fn scan(&self, root: &Path) -> Result<ScanSummary, ScanError>;
    fn assets(&self) -> Snapshot;
}

/// Reads asset contents for bundling.
pub trait AssetReader: Send + Sync {
    fn read(&self, asset: &Asset) -> io::Result<Vec<u8>>;
}

/// Reads assets relative to a root directory.
#[derive(Debug, Clone)]
pub struct FsReader {
    root: PathBuf,
}

impl FsReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AssetReader for FsReader {
    fn read(&self, asset: &Asset) -> io::Result<Vec<u8>> {
        fs::read(self.root.join(&asset.path))
    }
}

/// Serves asset contents from memory, keyed by relative path.
#[derive(Debug, Clone, Default)]
pub struct MemoryReader {
    files: HashMap<PathBuf, Vec<u8>>,
}

impl MemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), content.into());
    }
}

impl AssetReader for MemoryReader {
    fn read(&self, asset: &Asset) -> io::Result<Vec<u8>> {
        self.files.get(&asset.path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no in-memory content for {}", asset.path.display()),
            )
        })
    }
}

/// Extension allow-list and critical-name patterns.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOptions {
    pub extensions: Vec<String>,
    pub critical_patterns: Vec<String>,
}

impl ScanOptions {
    pub fn from_config(config: &AssetsConfig) -> Self {
        Self {
            extensions: config
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            critical_patterns: config
                .critical_patterns
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
        }
    }

    fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .is_some_and(|ext| self.extensions.iter().any(|allowed| *allowed == ext))
    }

    /// Priority of a critical asset, or `None` when no pattern matches.
    ///
    /// The first pattern ranks highest: with three patterns, a match on the
    /// first gives 30, the second 20, the third 10.
    pub fn classify(&self, rel_path: &str) -> Option<i32> {
        let lower = rel_path.to_lowercase();
        let count = self.critical_patterns.len();
        self.critical_patterns
            .iter()
            .position(|pattern| !pattern.is_empty() && lower.contains(pattern.as_str()))
            .map(|index| ((count - index) * 10) as i32)
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self::from_config(&AssetsConfig::default())
    }
}

/// Filesystem-backed catalog with publish-by-swap snapshots.
pub struct AssetCatalog {
    options: ScanOptions,
    snapshot: RwLock<Snapshot>,
}

impl AssetCatalog {
    pub fn new(options: ScanOptions) -> Self {
        Self {
            options,
            snapshot: RwLock::new(Arc::from(Vec::new())),
        }
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn find(&self, path: &Path) -> Option<Arc<Asset>> {
        self.assets().iter().find(|a| a.path == path).cloned()
    }

    /// Build an [`Asset`] from a file on disk. `Err` means the file is skipped.
    fn describe(&self, root: &Path, path: &Path) -> io::Result<Asset> {
        let bytes = fs::read(path)?;
        let metadata = fs::metadata(path)?;
        let rel = path.strip_prefix(root).unwrap_or(path);
        let rel_str = to_slash(rel);
        let kind = rel
            .extension()
            .map(|e| AssetKind::from_extension(&e.to_string_lossy()))
            .unwrap_or(AssetKind::Other);
        let rank = self.options.classify(&rel_str);
        let last_modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let dependencies = match kind {
            AssetKind::Css | AssetKind::Js => {
                extract_dependencies(kind, &String::from_utf8_lossy(&bytes), Path::new(&rel_str))
            }
            _ => Vec::new(),
        };

        Ok(Asset {
            path: PathBuf::from(rel_str),
            size: bytes.len() as u64,
            kind,
            critical: rank.is_some(),
            priority: rank.unwrap_or(0),
            dependencies,
            content_hash: hash_bytes(&bytes),
            last_modified,
        })
    }
}

impl AssetScanner for AssetCatalog {
    fn scan(&self, root: &Path) -> Result<ScanSummary, ScanError> {
        let unreadable = |source| ScanError::Unreadable {
            path: root.to_path_buf(),
            source,
        };
        let metadata = fs::metadata(root).map_err(unreadable)?;
        if !metadata.is_dir() {
            return Err(ScanError::NotADirectory(root.to_path_buf()));
        }
        fs::read_dir(root).map_err(unreadable)?;

        let mut skipped = 0;
        let mut candidates = Vec::new();
        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if err.depth() == 0 => return Err(ScanError::Walk(err)),
                Err(err) => {
                    warn!("skipping unreadable entry: {err}");
                    skipped += 1;
                    continue;
                }
            };
            if entry.file_type().is_file() && self.options.accepts(entry.path()) {
                candidates.push(entry.into_path());
            }
        }

        // Collect preserves walk order, so the snapshot is deterministic.
        let described: Vec<_> = candidates
            .par_iter()
            .map(|path| (path, self.describe(root, path)))
            .collect();

        let mut assets = Vec::with_capacity(described.len());
        for (path, result) in described {
            match result {
                Ok(asset) => {
                    debug!(
                        "asset {} ({} bytes, {}{})",
                        asset.path.display(),
                        asset.size,
                        asset.kind,
                        if asset.critical { ", critical" } else { "" }
                    );
                    assets.push(Arc::new(asset));
                }
                Err(err) => {
                    warn!("skipping {}: {err}", path.display());
                    skipped += 1;
                }
            }
        }

        let summary = ScanSummary {
            root: root.to_path_buf(),
            assets: assets.len(),
            critical: assets.iter().filter(|a| a.critical).count(),
            skipped,
            total_bytes: assets.iter().map(|a| a.size).sum(),
        };
        *self.snapshot.write() = Arc::from(assets);

        info!(
            "scanned {}: {} assets ({} critical, {} skipped, {} bytes)",
            root.display(),
            summary.assets,
            summary.critical,
            summary.skipped,
            summary.total_bytes
        );
        Ok(summary)
    }

    fn assets(&self) -> Snapshot {
        Arc::clone(&*self.snapshot.read())
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

static CSS_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"@import\s+(?:url\(\s*)?['"]?([^'")\s;]+)['"]?\s*\)?"#).unwrap()
});

static JS_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*(?:import|export)\s+(?:[^'";]*?\s+from\s+)?['"]([^'"]+)['"]"#).unwrap()
});

/// Relative import targets of a CSS or JS file, resolved against the
/// importing file's directory. URLs and bare package specifiers are ignored.
pub fn extract_dependencies(kind: AssetKind, source: &str, rel_path: &Path) -> Vec<PathBuf> {
    let pattern = match kind {
        AssetKind::Css => &*CSS_IMPORT,
        AssetKind::Js => &*JS_IMPORT,
        _ => return Vec::new(),
    };
    let base = rel_path.parent().unwrap_or(Path::new(""));
    let mut deps: Vec<PathBuf> = Vec::new();
    for cap in pattern.captures_iter(source) {
        let target = &cap[1];
        if target.contains("://") || target.starts_with("//") || target.starts_with("data:") {
            continue;
        }
        if kind == AssetKind::Js && !(target.starts_with("./") || target.starts_with("../")) {
            continue;
        }
        let resolved = if let Some(abs) = target.strip_prefix('/') {
            normalize(Path::new(abs))
        } else {
            normalize(&base.join(target))
        };
        if !deps.contains(&resolved) {
            deps.push(resolved);
        }
    }
    deps
}

/// Lexically resolve `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    PathBuf::from(parts.join("/"))
}
