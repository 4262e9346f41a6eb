//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use first_packet::cache::hash_bytes;
use first_packet::catalog::{
    Asset, AssetKind, AssetScanner, MemoryReader, ScanError, ScanSummary, Snapshot,
};
use first_packet::compress::{Algorithm, CompressionError, Compressor, StandardCompressor};
use first_packet::config::OptimizerConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Config rooted at `root` with outputs and cache inside it.
pub fn config_for(root: &Path) -> OptimizerConfig {
    let mut config = OptimizerConfig::default();
    config.paths.static_dir = root.join("static");
    config.paths.templates_dir = root.join("templates");
    config.paths.output_dir = root.join("dist");
    config.paths.cache_dir = root.join("cache");
    config
}

/// Reports `len * num / den` as the compressed length and counts calls.
pub struct ScaledCompressor {
    num: usize,
    den: usize,
    calls: AtomicUsize,
}

impl ScaledCompressor {
    pub fn new(num: usize, den: usize) -> Self {
        Self {
            num,
            den,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Compressor for ScaledCompressor {
    fn compress(&self, data: &[u8], _: Algorithm, _: u32) -> Result<Vec<u8>, CompressionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![0; data.len() * self.num / self.den])
    }
}

/// Real compression, counting calls.
#[derive(Default)]
pub struct SpyCompressor {
    calls: AtomicUsize,
}

impl SpyCompressor {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Compressor for SpyCompressor {
    fn compress(
        &self,
        data: &[u8],
        algorithm: Algorithm,
        level: u32,
    ) -> Result<Vec<u8>, CompressionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        StandardCompressor.compress(data, algorithm, level)
    }
}

/// A catalog that always reports the same assets.
pub struct FixedCatalog {
    assets: Snapshot,
}

impl FixedCatalog {
    pub fn new(assets: Vec<Arc<Asset>>) -> Self {
        Self {
            assets: assets.into(),
        }
    }
}

impl AssetScanner for FixedCatalog {
    fn scan(&self, root: &Path) -> Result<ScanSummary, ScanError> {
        Ok(ScanSummary {
            root: root.to_path_buf(),
            assets: self.assets.len(),
            critical: self.assets.iter().filter(|a| a.critical).count(),
            skipped: 0,
            total_bytes: self.assets.iter().map(|a| a.size).sum(),
        })
    }

    fn assets(&self) -> Snapshot {
        Arc::clone(&self.assets)
    }
}

/// Already-minified CSS of exactly `len` bytes.
pub fn css_of_len(tag: &str, len: usize) -> String {
    let mut css = String::new();
    let mut i = 0;
    while css.len() < len {
        css.push_str(&format!(".{tag}{i}{{margin:0}}"));
        i += 1;
    }
    css.truncate(len);
    css
}

/// Register `content` under `path` and describe it as an asset.
pub fn css_asset(
    reader: &mut MemoryReader,
    path: &str,
    content: &str,
    critical: bool,
    priority: i32,
) -> Arc<Asset> {
    reader.insert(path, content);
    Arc::new(Asset {
        path: PathBuf::from(path),
        size: content.len() as u64,
        kind: AssetKind::Css,
        critical,
        priority,
        dependencies: Vec::new(),
        content_hash: hash_bytes(content.as_bytes()),
        last_modified: DateTime::<Utc>::UNIX_EPOCH,
    })
}

/// Ten stylesheets, 20KB in total: three critical ones of 6KB each
/// (priorities 30, 20, 10) and seven small ones making up the rest.
pub fn ten_css_assets() -> (Vec<Arc<Asset>>, MemoryReader) {
    let mut reader = MemoryReader::new();
    let mut assets = Vec::new();
    for (i, priority) in [30, 20, 10].into_iter().enumerate() {
        let css = css_of_len(&format!("c{i}-"), 6 * 1024);
        assets.push(css_asset(
            &mut reader,
            &format!("css/critical-{i}.css"),
            &css,
            true,
            priority,
        ));
    }
    let rest = 20 * 1024 - 18 * 1024;
    for i in 0..7 {
        let len = if i < 6 { rest / 7 } else { rest - 6 * (rest / 7) };
        let css = css_of_len(&format!("x{i}-"), len);
        assets.push(css_asset(&mut reader, &format!("css/page-{i}.css"), &css, false, 0));
    }
    (assets, reader)
}

/// Write `content` to `root/rel`, creating parent directories.
pub fn write(root: &Path, rel: &str, content: &str) -> PathBuf {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
}

pub const PAGE: &str = r#"<!doctype html>
<html>
<head>
<title>Home</title>
<link rel="stylesheet" href="/css/site.css">
</head>
<body>
<header class="header"><nav class="nav"><a href="/">Home</a></nav></header>
<section class="hero"><img src="/img/hero.png" alt="hero"></section>
<img src="/img/gallery.png" alt="gallery">
<script src="/js/app.js"></script>
</body>
</html>
"#;

/// A small site on disk: critical and extended CSS, a script, an image
/// and one page.
pub fn setup_site(root: &Path) {
    write(root, "static/css/critical.css", "body { margin: 0; }\n.header { display: flex; }\n");
    write(root, "static/css/main.css", ".hero { min-height: 60vh; }\n.nav a { color: #333; }\n");
    write(root, "static/css/blog.css", ".post { max-width: 40rem; }\n");
    write(root, "static/js/app.js", "document.querySelector('.nav').classList.add('ready');\n");
    write(root, "static/img/hero.png", "\u{89}PNG");
    write(root, "templates/index.html", PAGE);
}
