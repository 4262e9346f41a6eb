//! Resource bundling under the first-packet budget.
//!
//! Groups catalog assets into named bundles by `(kind, critical)`:
//!
//! | Bundle            | Members               | Load priority | Budget |
//! |-------------------|-----------------------|---------------|--------|
//! | `critical-css`    | critical stylesheets  | 100           | yes    |
//! | `critical-js`     | critical scripts      | 90            | yes    |
//! | `hero-images`     | critical images       | 80            | yes    |
//! | `critical-assets` | other critical assets | 70            | yes    |
//! | `extended-css`    | other stylesheets     | 50            | no     |
//! | `app-js`          | other scripts         | 40            | no     |
//! | `lazy-images`     | other images          | 10            | no     |
//! | `other-assets`    | everything else       | 0             | no     |
//!
//! ## Budget enforcement
//!
//! A budget-bound bundle's compressed size must not exceed the critical
//! budget. When the whole partition doesn't fit, members are ranked by
//! priority (stable, so ties keep catalog order) and admitted one at a time
//! while the compressed bundle still fits. The first member that doesn't fit
//! and every member ranked below it are dropped: each drop is recorded as a
//! compliance violation and the asset is demoted to the non-critical bundle
//! of its kind so it is still delivered. Admitted members keep catalog order in
//! the bundle so the cascade is unchanged.
//!
//! ## Chunking
//!
//! Unbounded bundles larger than the chunk size are split in catalog order
//! into `name-1`, `name-2`, … using raw asset sizes. A chunk only exceeds the
//! limit when a single asset does; assets are never split.
//!
//! ## Content
//!
//! Stylesheets are minified and joined with newlines, scripts are joined with
//! `;\n`. Image and other bundles are groupings only: they carry no combined
//! content and their compressed size is their raw size.

use crate::cache::{CacheKey, hash_bytes};
use crate::catalog::{Asset, AssetKind, AssetReader};
use crate::clock::{Clock, SystemClock};
use crate::compress::{Algorithm, CompressionError, Compressor};
use crate::config::OptimizerConfig;
use crate::critical::minify_css;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Name of the manifest written next to the bundle files.
pub const MANIFEST_FILENAME: &str = "bundles.json";

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Compression(#[from] CompressionError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    CriticalCss,
    CriticalJs,
    HeroImages,
    CriticalOther,
    ExtendedCss,
    AppJs,
    LazyImages,
    Other,
}

impl Slot {
    const BUDGET_BOUND: [Slot; 4] = [
        Slot::CriticalCss,
        Slot::CriticalJs,
        Slot::HeroImages,
        Slot::CriticalOther,
    ];
    const UNBOUNDED: [Slot; 4] = [
        Slot::ExtendedCss,
        Slot::AppJs,
        Slot::LazyImages,
        Slot::Other,
    ];

    fn of(asset: &Asset) -> Slot {
        match (asset.kind, asset.critical) {
            (AssetKind::Css, true) => Slot::CriticalCss,
            (AssetKind::Js, true) => Slot::CriticalJs,
            (AssetKind::Image, true) => Slot::HeroImages,
            (AssetKind::Css, false) => Slot::ExtendedCss,
            (AssetKind::Js, false) => Slot::AppJs,
            (AssetKind::Image, false) => Slot::LazyImages,
            (AssetKind::Other, true) => Slot::CriticalOther,
            (AssetKind::Other, false) => Slot::Other,
        }
    }

    /// Where a member dropped from this slot ends up.
    fn demoted(self) -> Slot {
        match self {
            Slot::CriticalCss => Slot::ExtendedCss,
            Slot::CriticalJs => Slot::AppJs,
            Slot::HeroImages => Slot::LazyImages,
            Slot::CriticalOther => Slot::Other,
            other => other,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Slot::CriticalCss => "critical-css",
            Slot::CriticalJs => "critical-js",
            Slot::HeroImages => "hero-images",
            Slot::CriticalOther => "critical-assets",
            Slot::ExtendedCss => "extended-css",
            Slot::AppJs => "app-js",
            Slot::LazyImages => "lazy-images",
            Slot::Other => "other-assets",
        }
    }

    fn kind(self) -> AssetKind {
        match self {
            Slot::CriticalCss | Slot::ExtendedCss => AssetKind::Css,
            Slot::CriticalJs | Slot::AppJs => AssetKind::Js,
            Slot::HeroImages | Slot::LazyImages => AssetKind::Image,
            Slot::CriticalOther | Slot::Other => AssetKind::Other,
        }
    }

    fn load_priority(self) -> i32 {
        match self {
            Slot::CriticalCss => 100,
            Slot::CriticalJs => 90,
            Slot::HeroImages => 80,
            Slot::CriticalOther => 70,
            Slot::ExtendedCss => 50,
            Slot::AppJs => 40,
            Slot::LazyImages => 10,
            Slot::Other => 0,
        }
    }
}

/// A named group of assets slated for combined delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub name: String,
    pub kind: AssetKind,
    pub assets: Vec<Arc<Asset>>,
    /// Budget-bound. Always within the critical budget when set.
    pub critical: bool,
    pub uncompressed_size: usize,
    pub compressed_size: usize,
    pub content_hash: String,
    pub load_priority: i32,
    pub created_at: DateTime<Utc>,
    pub content: Vec<u8>,
    pub compressed: Vec<u8>,
}

impl Bundle {
    /// File extension of the combined content, `None` for groupings.
    pub fn extension(&self) -> Option<&'static str> {
        match self.kind {
            AssetKind::Css => Some("css"),
            AssetKind::Js => Some("js"),
            AssetKind::Image | AssetKind::Other => None,
        }
    }

    /// Output file name: `name.ext` or `name.hash8.ext`.
    pub fn file_name(&self, hash_suffix: bool) -> Option<String> {
        let ext = self.extension()?;
        if hash_suffix {
            let short = &self.content_hash[..self.content_hash.len().min(8)];
            Some(format!("{}.{short}.{ext}", self.name))
        } else {
            Some(format!("{}.{ext}", self.name))
        }
    }

    pub fn asset_paths(&self) -> Vec<&Path> {
        self.assets.iter().map(|a| a.path.as_path()).collect()
    }

    /// True for `base` itself and its chunks `base-1`, `base-2`, …
    pub fn belongs_to(&self, base: &str) -> bool {
        match self.name.strip_prefix(base) {
            Some("") => true,
            Some(rest) => rest
                .strip_prefix('-')
                .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit())),
            None => false,
        }
    }
}

/// Output of one bundling pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleSet {
    pub algorithm: Algorithm,
    pub bundles: BTreeMap<String, Bundle>,
    pub violations: Vec<String>,
}

impl BundleSet {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            bundles: BTreeMap::new(),
            violations: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Bundle> {
        self.bundles.get(name)
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// A bundle and its chunks, in chunk order.
    pub fn family(&self, base: &str) -> Vec<&Bundle> {
        let mut members: Vec<&Bundle> = self
            .bundles
            .values()
            .filter(|b| b.belongs_to(base))
            .collect();
        members.sort_by_key(|b| chunk_index(&b.name));
        members
    }

    /// Highest load priority first, then by name.
    pub fn by_load_priority(&self) -> Vec<&Bundle> {
        let mut all: Vec<&Bundle> = self.bundles.values().collect();
        all.sort_by(|a, b| {
            b.load_priority
                .cmp(&a.load_priority)
                .then_with(|| chunk_index(&a.name).cmp(&chunk_index(&b.name)))
                .then_with(|| a.name.cmp(&b.name))
        });
        all
    }

    pub fn total_uncompressed(&self) -> usize {
        self.bundles.values().map(|b| b.uncompressed_size).sum()
    }

    pub fn total_compressed(&self) -> usize {
        self.bundles.values().map(|b| b.compressed_size).sum()
    }
}

fn chunk_index(name: &str) -> usize {
    name.rsplit_once('-')
        .and_then(|(_, n)| n.parse().ok())
        .unwrap_or(0)
}

/// Budget, chunking and compression settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleOptions {
    pub critical_budget: usize,
    pub chunk_size: usize,
    pub algorithm: Algorithm,
    pub level: u32,
}

impl BundleOptions {
    pub fn from_config(config: &OptimizerConfig) -> Self {
        Self {
            critical_budget: config.budget.critical_bytes,
            chunk_size: config.budget.chunk_bytes,
            algorithm: config.compression.algorithm,
            level: config.compression.level,
        }
    }
}

impl Default for BundleOptions {
    fn default() -> Self {
        Self::from_config(&OptimizerConfig::default())
    }
}

pub struct BundleBuilder {
    compressor: Arc<dyn Compressor>,
    options: BundleOptions,
    clock: Arc<dyn Clock>,
}

impl BundleBuilder {
    pub fn new(compressor: Arc<dyn Compressor>, options: BundleOptions) -> Self {
        Self {
            compressor,
            options,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(&self) -> &BundleOptions {
        &self.options
    }

    pub fn compressor(&self) -> &Arc<dyn Compressor> {
        &self.compressor
    }

    /// Partition, budget-fit and chunk `assets`.
    pub fn build(
        &self,
        assets: &[Arc<Asset>],
        reader: &dyn AssetReader,
    ) -> Result<BundleSet, BundleError> {
        let mut set = BundleSet::new(self.options.algorithm);
        let mut contents = ContentCache::new(reader);
        let mut demoted: HashSet<PathBuf> = HashSet::new();

        for slot in Slot::BUDGET_BOUND {
            let members: Vec<Arc<Asset>> = assets
                .iter()
                .filter(|a| Slot::of(a) == slot)
                .cloned()
                .collect();
            if members.is_empty() {
                continue;
            }
            let (kept, dropped) = self.fit_budget(slot, members, &mut contents)?;
            for asset in dropped {
                let violation = format!(
                    "{} (priority {}) dropped from {}: compressed size exceeds the {}-byte critical budget",
                    asset.path.display(),
                    asset.priority,
                    slot.name(),
                    self.options.critical_budget
                );
                warn!("{violation}");
                set.violations.push(violation);
                demoted.insert(asset.path.clone());
            }
            if let Some(bundle) = kept {
                set.bundles.insert(bundle.name.clone(), bundle);
            }
        }

        for slot in Slot::UNBOUNDED {
            let members: Vec<Arc<Asset>> = assets
                .iter()
                .filter(|a| {
                    let own = Slot::of(a);
                    own == slot || (own.demoted() == slot && demoted.contains(&a.path))
                })
                .cloned()
                .collect();
            if members.is_empty() {
                continue;
            }
            let chunks = split_chunks(members, self.options.chunk_size);
            let count = chunks.len();
            for (index, chunk) in chunks.into_iter().enumerate() {
                let name = if count == 1 {
                    slot.name().to_string()
                } else {
                    format!("{}-{}", slot.name(), index + 1)
                };
                let bundle = self.assemble(name, slot, chunk, &mut contents)?;
                set.bundles.insert(bundle.name.clone(), bundle);
            }
        }

        info!(
            "built {} bundles ({} bytes, {} compressed, {} violations)",
            set.len(),
            set.total_uncompressed(),
            set.total_compressed(),
            set.violations.len()
        );
        Ok(set)
    }

    /// Largest priority-ranked prefix of `members` whose bundle fits the
    /// budget, and the members left over.
    fn fit_budget(
        &self,
        slot: Slot,
        members: Vec<Arc<Asset>>,
        contents: &mut ContentCache<'_>,
    ) -> Result<(Option<Bundle>, Vec<Arc<Asset>>), BundleError> {
        let budget = self.options.critical_budget;
        let full = self.assemble(slot.name().to_string(), slot, members.clone(), contents)?;
        if full.compressed_size <= budget {
            return Ok((Some(full), Vec::new()));
        }
        debug!(
            "{} is {} bytes compressed, over the {budget}-byte budget",
            slot.name(),
            full.compressed_size
        );

        let mut ranked: Vec<usize> = (0..members.len()).collect();
        ranked.sort_by_key(|&i| Reverse(members[i].priority));

        let mut admitted = vec![false; members.len()];
        let mut best = None;
        let mut dropped = Vec::new();
        let mut full_up = false;
        for i in ranked {
            if full_up {
                dropped.push(Arc::clone(&members[i]));
                continue;
            }
            admitted[i] = true;
            let candidate: Vec<Arc<Asset>> = members
                .iter()
                .zip(&admitted)
                .filter(|(_, keep)| **keep)
                .map(|(a, _)| Arc::clone(a))
                .collect();
            let bundle = self.assemble(slot.name().to_string(), slot, candidate, contents)?;
            if bundle.compressed_size <= budget {
                best = Some(bundle);
            } else {
                admitted[i] = false;
                full_up = true;
                dropped.push(Arc::clone(&members[i]));
            }
        }
        Ok((best, dropped))
    }

    fn assemble(
        &self,
        name: String,
        slot: Slot,
        assets: Vec<Arc<Asset>>,
        contents: &mut ContentCache<'_>,
    ) -> Result<Bundle, BundleError> {
        let kind = slot.kind();
        let (content, compressed, content_hash, uncompressed_size, compressed_size) = match kind {
            AssetKind::Css | AssetKind::Js => {
                let separator: &[u8] = if kind == AssetKind::Css { b"\n" } else { b";\n" };
                let mut content = Vec::new();
                for (i, asset) in assets.iter().enumerate() {
                    if i > 0 {
                        content.extend_from_slice(separator);
                    }
                    content.extend_from_slice(contents.get(asset)?);
                }
                let compressed = self.compressor.compress(
                    &content,
                    self.options.algorithm,
                    self.options.level,
                )?;
                let hash = hash_bytes(&content);
                let (raw, packed) = (content.len(), compressed.len());
                (content, compressed, hash, raw, packed)
            }
            AssetKind::Image | AssetKind::Other => {
                let mut key = CacheKey::new(&name);
                for asset in &assets {
                    key.str(&asset.content_hash);
                }
                let raw = assets.iter().map(|a| a.size as usize).sum();
                (Vec::new(), Vec::new(), key.finish(), raw, raw)
            }
        };

        Ok(Bundle {
            name,
            kind,
            critical: Slot::BUDGET_BOUND.contains(&slot),
            uncompressed_size,
            compressed_size,
            content_hash,
            load_priority: slot.load_priority(),
            created_at: self.clock.now(),
            content,
            compressed,
            assets,
        })
    }
}

/// Reads each text asset at most once per build, minifying stylesheets.
struct ContentCache<'a> {
    reader: &'a dyn AssetReader,
    loaded: HashMap<PathBuf, Vec<u8>>,
}

impl<'a> ContentCache<'a> {
    fn new(reader: &'a dyn AssetReader) -> Self {
        Self {
            reader,
            loaded: HashMap::new(),
        }
    }

    fn get(&mut self, asset: &Asset) -> Result<&[u8], BundleError> {
        if !self.loaded.contains_key(&asset.path) {
            let raw = self.reader.read(asset).map_err(|source| BundleError::Read {
                path: asset.path.clone(),
                source,
            })?;
            let content = match asset.kind {
                AssetKind::Css => minify_css(&String::from_utf8_lossy(&raw)).into_bytes(),
                _ => raw,
            };
            self.loaded.insert(asset.path.clone(), content);
        }
        Ok(self.loaded.get(&asset.path).map(Vec::as_slice).unwrap_or_default())
    }
}

/// Split in encounter order so no chunk exceeds `limit` raw bytes unless it
/// holds a single oversized asset.
fn split_chunks(members: Vec<Arc<Asset>>, limit: usize) -> Vec<Vec<Arc<Asset>>> {
    let limit = limit as u64;
    let mut chunks = Vec::new();
    let mut current: Vec<Arc<Asset>> = Vec::new();
    let mut size = 0u64;
    for asset in members {
        if !current.is_empty() && size + asset.size > limit {
            chunks.push(std::mem::take(&mut current));
            size = 0;
        }
        size += asset.size;
        current.push(asset);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// One line of `bundles.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub kind: AssetKind,
    pub critical: bool,
    pub load_priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precompressed: Option<String>,
    pub uncompressed_size: usize,
    pub compressed_size: usize,
    pub content_hash: String,
    pub assets: Vec<PathBuf>,
}

/// Write every bundle with combined content as `name[.hash8].ext` plus a
/// precompressed sibling, and a `bundles.json` manifest covering all bundles.
///
/// Stops between bundles once `cancel` fires. The manifest is written last,
/// so an interrupted write leaves the previous manifest in place.
pub fn write_bundles(
    set: &BundleSet,
    dir: &Path,
    hash_suffix: bool,
    cancel: &CancellationToken,
) -> Result<Vec<ManifestEntry>, BundleError> {
    fs::create_dir_all(dir)?;
    let mut manifest = Vec::with_capacity(set.len());
    for bundle in set.by_load_priority() {
        if cancel.is_cancelled() {
            return Err(BundleError::Cancelled);
        }
        let file = bundle.file_name(hash_suffix);
        let mut precompressed = None;
        if let Some(file) = &file {
            fs::write(dir.join(file), &bundle.content)?;
            let sibling = format!("{file}.{}", set.algorithm.extension());
            fs::write(dir.join(&sibling), &bundle.compressed)?;
            debug!("wrote {file} ({} bytes, {sibling})", bundle.uncompressed_size);
            precompressed = Some(sibling);
        }
        manifest.push(ManifestEntry {
            name: bundle.name.clone(),
            kind: bundle.kind,
            critical: bundle.critical,
            load_priority: bundle.load_priority,
            file,
            precompressed,
            uncompressed_size: bundle.uncompressed_size,
            compressed_size: bundle.compressed_size,
            content_hash: bundle.content_hash.clone(),
            assets: bundle.assets.iter().map(|a| a.path.clone()).collect(),
        });
    }
    let json = serde_json::to_string_pretty(&manifest)?;
    fs::write(dir.join(MANIFEST_FILENAME), json)?;
    Ok(manifest)
}
