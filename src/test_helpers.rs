//! Shared test utilities for the first-packet test suite.
//!
//! Builds a small on-disk site (static assets plus one template) in a temp
//! directory, and provides constructors for in-memory [`Asset`] values.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let tmp = setup_static_site();
//! let catalog = AssetCatalog::new(ScanOptions::default());
//! catalog.scan(&tmp.path().join("static")).unwrap();
//!
//! assert!(asset_paths(&catalog.assets()).contains(&"css/main.css".to_string()));
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::catalog::{Asset, AssetKind, Snapshot};
use crate::cache::hash_bytes;
use chrono::{DateTime, Utc};

// =========================================================================
// Fixture setup
// =========================================================================

pub const CRITICAL_CSS: &str = "html{box-sizing:border-box}\nbody { margin: 0; font-family: system-ui; }\n.header { display: flex; }\n";
pub const MAIN_CSS: &str = ".hero { display: grid; min-height: 60vh; }\n.nav a { color: #333; }\n.sidebar { width: 20rem; }\n";
pub const BLOG_CSS: &str = ".post { max-width: 40rem; }\n.comment { border-top: 1px solid #ddd; }\n";
pub const APP_JS: &str = "import { h } from './dom.js';\ndocument.querySelector('.nav').classList.add('ready');\n";
pub const DOM_JS: &str = "export function h(tag) { return document.createElement(tag); }\n";
pub const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head>
<title>Home</title>
<link rel="stylesheet" href="/css/main.css">
</head>
<body>
<header class="header"><nav class="nav"><a href="/">Home</a></nav></header>
<section class="hero"><img src="/img/hero.png" alt="hero"></section>
<img src="/img/gallery-1.png" alt="one">
<img src="/img/gallery-2.png" alt="two">
<script src="/js/app.js"></script>
</body>
</html>
"#;

/// Write a small site to a temp directory and return it.
///
/// ```text
/// static/css/critical.css
/// static/css/main.css
/// static/css/blog.css
/// static/img/hero.png
/// static/js/app.js
/// static/js/dom.js
/// templates/index.html
/// ```
pub fn setup_static_site() -> TempDir {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    write(root, "static/css/critical.css", CRITICAL_CSS.as_bytes());
    write(root, "static/css/main.css", MAIN_CSS.as_bytes());
    write(root, "static/css/blog.css", BLOG_CSS.as_bytes());
    write(root, "static/img/hero.png", &[0x89, b'P', b'N', b'G', 0, 0, 0, 0]);
    write(root, "static/js/app.js", APP_JS.as_bytes());
    write(root, "static/js/dom.js", DOM_JS.as_bytes());
    write(root, "templates/index.html", INDEX_HTML.as_bytes());
    tmp
}

/// Write `content` to `root/rel`, creating parent directories.
pub fn write(root: &Path, rel: &str, content: &[u8]) -> PathBuf {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
}

// =========================================================================
// Assets
// =========================================================================

/// An [`Asset`] that exists only in memory. The content hash is derived
/// from the path so distinct assets never collide.
pub fn make_asset(path: &str, kind: AssetKind, size: u64, critical: bool, priority: i32) -> Asset {
    Asset {
        path: PathBuf::from(path),
        size,
        kind,
        critical,
        priority,
        dependencies: Vec::new(),
        content_hash: hash_bytes(path.as_bytes()),
        last_modified: DateTime::<Utc>::UNIX_EPOCH,
    }
}

/// Relative paths of every asset in a snapshot, in snapshot order.
pub fn asset_paths(snapshot: &Snapshot) -> Vec<String> {
    snapshot
        .iter()
        .map(|a| a.path.to_string_lossy().into_owned())
        .collect()
}
