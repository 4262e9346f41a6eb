//! Built-in stages.
//!
//! ```text
//! scan ─► extract-critical-css ─► ┌ optimize-images  ┐ ─► bundle-resources
//!                                  │ optimize-scripts │
//!                                  └ optimize-fonts   ┘
//!      ─► optimize-templates ─► validate-compliance ─► generate-reports
//! ```
//!
//! `scan`, `extract-critical-css` and `bundle-resources` are critical: the
//! build cannot produce a usable first packet without them. The rest degrade
//! to warnings. Filesystem and CPU-bound work runs on the blocking pool.

use super::{BuildContext, OptimizationStage, StageAction, StageError, StageOutcome, TemplateDoc};
use crate::bundle::{Bundle, BundleBuilder, BundleOptions, BundleSet, write_bundles};
use crate::cache::{CacheEntry, CacheKey, hash_bytes};
use crate::catalog::{Asset, AssetKind};
use crate::config::OptimizerConfig;
use crate::critical::extract_critical;
use crate::report::write_reports;
use crate::transform::{
    AsyncStylesheets, ContentTransform, DeferScripts, FontDisplaySwap, InjectBundles,
    InlineCriticalCss, LazyImages,
};
use async_trait::async_trait;
use log::{debug, info};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

pub const SCAN: &str = "scan";
pub const EXTRACT_CRITICAL_CSS: &str = "extract-critical-css";
pub const OPTIMIZE_IMAGES: &str = "optimize-images";
pub const OPTIMIZE_SCRIPTS: &str = "optimize-scripts";
pub const OPTIMIZE_FONTS: &str = "optimize-fonts";
pub const BUNDLE_RESOURCES: &str = "bundle-resources";
pub const OPTIMIZE_TEMPLATES: &str = "optimize-templates";
pub const VALIDATE_COMPLIANCE: &str = "validate-compliance";
pub const GENERATE_REPORTS: &str = "generate-reports";

/// URL prefix under which bundle files are served.
const BUNDLE_URL_PREFIX: &str = "/bundles/";

/// Checked between units of blocking work.
fn stop_if_cancelled(cancel: &CancellationToken) -> Result<(), StageError> {
    if cancel.is_cancelled() {
        Err(StageError::Cancelled)
    } else {
        Ok(())
    }
}

/// The standard stage list, with timeouts and retries from `config`.
pub fn default_stages(config: &OptimizerConfig) -> Vec<OptimizationStage> {
    let stage = |name: &str, action: Arc<dyn StageAction>| {
        OptimizationStage::new(name, action)
            .timeout(config.stage_timeout())
            .max_retries(config.build.max_retries)
    };
    let rewrite = |name: &str, transform: Arc<dyn ContentTransform>| {
        stage(name, Arc::new(RewriteTemplates { transform }))
            .parallelizable(true)
            .critical(false)
    };

    vec![
        stage(SCAN, Arc::new(ScanAssets)),
        stage(EXTRACT_CRITICAL_CSS, Arc::new(ExtractCriticalCss)),
        rewrite(OPTIMIZE_IMAGES, Arc::new(LazyImages::default())),
        rewrite(OPTIMIZE_SCRIPTS, Arc::new(DeferScripts)),
        rewrite(OPTIMIZE_FONTS, Arc::new(FontDisplaySwap)),
        stage(BUNDLE_RESOURCES, Arc::new(BundleResources)),
        stage(OPTIMIZE_TEMPLATES, Arc::new(OptimizeTemplates)).critical(false),
        stage(VALIDATE_COMPLIANCE, Arc::new(ValidateCompliance)).critical(false),
        stage(GENERATE_REPORTS, Arc::new(GenerateReports)).critical(false),
    ]
}

// ============================================================================
// scan
// ============================================================================

/// Catalog the static root and load page templates.
pub struct ScanAssets;

#[async_trait]
impl StageAction for ScanAssets {
    async fn run(
        &self,
        ctx: Arc<BuildContext>,
        cancel: CancellationToken,
    ) -> Result<StageOutcome, StageError> {
        let worker = Arc::clone(&ctx);
        let (summary, templates) = spawn_blocking(move || -> Result<_, StageError> {
            let summary = worker.catalog.scan(&worker.config.paths.static_dir)?;
            stop_if_cancelled(&cancel)?;
            let templates = discover_templates(&worker.config.paths.templates_dir)?;
            Ok((summary, templates))
        })
        .await??;

        match &templates {
            Some(found) => info!("found {} templates", found.len()),
            None => ctx.warn(format!(
                "templates directory {} not found, only bundling",
                ctx.config.paths.templates_dir.display()
            )),
        }
        ctx.set_templates(templates.unwrap_or_default());
        ctx.state().scan = Some(summary);
        Ok(StageOutcome::Completed)
    }
}

/// `.html`/`.htm` files under `dir`, sorted by path. `None` when `dir`
/// doesn't exist.
pub fn discover_templates(dir: &Path) -> io::Result<Option<Vec<TemplateDoc>>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut templates = Vec::new();
    let walker = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
    for entry in walker {
        let entry = entry?;
        let is_template = entry
            .path()
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .is_some_and(|ext| ext == "html" || ext == "htm");
        if !entry.file_type().is_file() || !is_template {
            continue;
        }
        let html = fs::read_to_string(entry.path())?;
        let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        debug!("template {} ({} bytes)", rel.display(), html.len());
        templates.push(TemplateDoc::new(rel, html));
    }
    Ok(Some(templates))
}

// ============================================================================
// extract-critical-css
// ============================================================================

/// Per-page critical CSS from all catalogued stylesheets.
pub struct ExtractCriticalCss;

#[async_trait]
impl StageAction for ExtractCriticalCss {
    async fn run(
        &self,
        ctx: Arc<BuildContext>,
        cancel: CancellationToken,
    ) -> Result<StageOutcome, StageError> {
        let worker = Arc::clone(&ctx);
        spawn_blocking(move || extract_pages(&worker, &cancel)).await??;
        Ok(StageOutcome::Completed)
    }
}

fn extract_pages(ctx: &BuildContext, cancel: &CancellationToken) -> Result<(), StageError> {
    let templates = ctx.templates();
    if templates.is_empty() {
        return Ok(());
    }

    let mut full_css = String::new();
    for asset in ctx.catalog.assets().iter().filter(|a| a.kind == AssetKind::Css) {
        let bytes = ctx.reader.read(asset)?;
        full_css.push_str(&String::from_utf8_lossy(&bytes));
        full_css.push('\n');
    }
    let css_hash = hash_bytes(full_css.as_bytes());
    let budget = ctx.config.budget.critical_bytes;
    let mut reported_malformed = false;

    for doc in templates {
        stop_if_cancelled(cancel)?;
        let html = doc.html();
        let key = CacheKey::new("critical-css")
            .str(&css_hash)
            .str(&hash_bytes(html.as_bytes()))
            .u64(budget as u64)
            .finish();

        let cached = ctx
            .cache
            .as_ref()
            .and_then(|cache| cache.get(&key))
            .and_then(|entry| String::from_utf8(entry.artifact).ok());
        let css = match cached {
            Some(css) => css,
            None => {
                let extracted = extract_critical(&full_css, &html, budget);
                if !reported_malformed {
                    for err in &extracted.malformed {
                        ctx.warn(format!("skipped malformed CSS rule: {err}"));
                    }
                    reported_malformed = true;
                }
                debug!(
                    "{}: kept {} rules, {} unused, {} over budget",
                    doc.path.display(),
                    extracted.kept,
                    extracted.unused,
                    extracted.dropped
                );
                if let Some(cache) = &ctx.cache {
                    let entry = CacheEntry::new(
                        key.clone(),
                        extracted.css.clone().into_bytes(),
                        true,
                        cache.now(),
                    );
                    cache.put(key, entry);
                }
                extracted.css
            }
        };
        ctx.state().critical_css.insert(doc.path.clone(), css);
    }
    Ok(())
}

// ============================================================================
// optimize-images / optimize-scripts / optimize-fonts
// ============================================================================

/// Apply one content transform to every template.
pub struct RewriteTemplates {
    pub transform: Arc<dyn ContentTransform>,
}

#[async_trait]
impl StageAction for RewriteTemplates {
    async fn run(
        &self,
        ctx: Arc<BuildContext>,
        cancel: CancellationToken,
    ) -> Result<StageOutcome, StageError> {
        let transform = Arc::clone(&self.transform);
        let worker = Arc::clone(&ctx);
        let changed = spawn_blocking(move || -> Result<usize, StageError> {
            let mut changed = 0;
            for doc in worker.templates() {
                stop_if_cancelled(&cancel)?;
                if doc.apply(transform.as_ref())? {
                    worker.mark_optimized(worker.config.paths.templates_dir.join(&doc.path));
                    changed += 1;
                }
            }
            Ok(changed)
        })
        .await??;
        debug!("{} rewrote {changed} templates", self.transform.name());
        Ok(StageOutcome::Completed)
    }
}

// ============================================================================
// bundle-resources
// ============================================================================

/// Build (or restore from cache) and write the bundle set.
pub struct BundleResources;

/// Key covering every input that affects the bundle set.
pub fn bundle_cache_key(assets: &[Arc<Asset>], options: &BundleOptions) -> String {
    let mut key = CacheKey::new("bundles");
    key.u64(options.critical_budget as u64)
        .u64(options.chunk_size as u64)
        .str(options.algorithm.encoding())
        .u64(options.level as u64);
    for asset in assets {
        key.str(&asset.path.to_string_lossy())
            .str(&asset.content_hash)
            .str(asset.kind.as_str())
            .bool(asset.critical)
            .u64(asset.priority as i64 as u64)
            .u64(asset.size);
    }
    key.finish()
}

#[async_trait]
impl StageAction for BundleResources {
    async fn run(
        &self,
        ctx: Arc<BuildContext>,
        cancel: CancellationToken,
    ) -> Result<StageOutcome, StageError> {
        let assets = ctx.catalog.assets();
        let options = BundleOptions::from_config(&ctx.config);
        let key = bundle_cache_key(&assets, &options);

        let cached = ctx
            .cache
            .as_ref()
            .and_then(|cache| cache.get(&key))
            .and_then(|entry| match serde_json::from_slice::<BundleSet>(&entry.artifact) {
                Ok(set) => Some(set),
                Err(err) => {
                    log::warn!("ignoring unreadable cached bundle set: {err}");
                    None
                }
            });

        let set = match cached {
            Some(set) => {
                info!("bundle set restored from cache ({} bundles)", set.len());
                set
            }
            None => {
                stop_if_cancelled(&cancel)?;
                let worker = Arc::clone(&ctx);
                let set = spawn_blocking(move || {
                    BundleBuilder::new(Arc::clone(&worker.compressor), options)
                        .with_clock(Arc::clone(&worker.clock))
                        .build(&assets, worker.reader.as_ref())
                })
                .await??;
                if let Some(cache) = &ctx.cache {
                    let artifact = serde_json::to_vec(&set)?;
                    let entry = CacheEntry::new(
                        key.clone(),
                        artifact,
                        set.violations.is_empty(),
                        cache.now(),
                    );
                    cache.put(key, entry);
                }
                set
            }
        };

        stop_if_cancelled(&cancel)?;
        let set = Arc::new(set);
        let writer = Arc::clone(&set);
        let dir = ctx.config.bundles_dir();
        let hash_suffix = ctx.config.budget.hash_suffix;
        spawn_blocking(move || write_bundles(&writer, &dir, hash_suffix, &cancel)).await??;

        for violation in &set.violations {
            ctx.violation(violation.clone());
        }
        let text_bundles: Vec<&Bundle> = set
            .bundles
            .values()
            .filter(|b| b.extension().is_some())
            .collect();
        for bundle in &text_bundles {
            for asset in &bundle.assets {
                ctx.mark_optimized(ctx.config.paths.static_dir.join(&asset.path));
            }
        }
        let mut state = ctx.state();
        state.bundle_savings = text_bundles
            .iter()
            .map(|b| b.uncompressed_size as i64 - b.compressed_size as i64)
            .sum();
        state.bundles = Some(Arc::clone(&set));
        Ok(StageOutcome::Completed)
    }
}

// ============================================================================
// optimize-templates
// ============================================================================

/// Inline critical CSS, reference bundles, write pages and check each
/// page's compressed size against the budget.
pub struct OptimizeTemplates;

#[async_trait]
impl StageAction for OptimizeTemplates {
    async fn run(
        &self,
        ctx: Arc<BuildContext>,
        cancel: CancellationToken,
    ) -> Result<StageOutcome, StageError> {
        let worker = Arc::clone(&ctx);
        spawn_blocking(move || optimize_pages(&worker, &cancel)).await??;
        Ok(StageOutcome::Completed)
    }
}

fn bundle_urls(set: Option<&BundleSet>, base: &str, hash_suffix: bool) -> Vec<String> {
    set.map(|set| {
        set.family(base)
            .into_iter()
            .filter_map(|b| b.file_name(hash_suffix))
            .map(|file| format!("{BUNDLE_URL_PREFIX}{file}"))
            .collect()
    })
    .unwrap_or_default()
}

fn optimize_pages(ctx: &BuildContext, cancel: &CancellationToken) -> Result<(), StageError> {
    let (bundles, critical_css) = {
        let state = ctx.state();
        (state.bundles.clone(), state.critical_css.clone())
    };
    let config = &ctx.config;
    let hash_suffix = config.budget.hash_suffix;
    let inject = InjectBundles {
        stylesheets: bundle_urls(bundles.as_deref(), "extended-css", hash_suffix),
        scripts: bundle_urls(bundles.as_deref(), "app-js", hash_suffix),
    };
    let out_dir = config.templates_output_dir();
    let budget = config.budget.critical_bytes;

    let mut checked = 0;
    let mut compliant = 0;
    let mut savings = 0i64;
    let mut over_budget = Vec::new();
    for doc in ctx.templates() {
        stop_if_cancelled(cancel)?;
        let inline = InlineCriticalCss {
            css: critical_css.get(&doc.path).cloned().unwrap_or_default(),
        };
        let chain: [&dyn ContentTransform; 3] = [&inline, &AsyncStylesheets, &inject];
        // partials without a <head> or <body> are left alone
        if let Err(err) = doc.apply_all(&chain) {
            ctx.warn(format!("skipped page {}: {err}", doc.path.display()));
            continue;
        }

        let html = doc.html();
        let target = out_dir.join(&doc.path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, &html)?;

        let compressed = ctx.compressor.compressed_len(
            html.as_bytes(),
            config.compression.algorithm,
            config.compression.level,
        )?;
        checked += 1;
        if compressed <= budget {
            compliant += 1;
        } else {
            over_budget.push(format!(
                "page {} is {compressed} bytes compressed, over the {budget}-byte first-packet budget",
                doc.path.display()
            ));
        }
        savings += doc.original_size as i64 - compressed as i64;
        ctx.mark_optimized(config.paths.templates_dir.join(&doc.path));
    }

    for violation in over_budget {
        ctx.violation(violation);
    }
    let mut state = ctx.state();
    state.pages_checked = checked;
    state.pages_compliant = compliant;
    state.page_savings = savings;
    info!("optimized {checked} pages, {compliant} within budget");
    Ok(())
}

// ============================================================================
// validate-compliance
// ============================================================================

/// Re-check budget-bound bundles and record page compliance if the page
/// check didn't run.
pub struct ValidateCompliance;

#[async_trait]
impl StageAction for ValidateCompliance {
    async fn run(
        &self,
        ctx: Arc<BuildContext>,
        _cancel: CancellationToken,
    ) -> Result<StageOutcome, StageError> {
        if !ctx.config.build.validate_compliance {
            return Ok(StageOutcome::Skipped(
                "compliance validation disabled".into(),
            ));
        }
        let budget = ctx.config.budget.critical_bytes;
        let bundles = ctx
            .state()
            .bundles
            .clone()
            .ok_or_else(|| StageError::Failed("no bundle set to validate".into()))?;
        for bundle in bundles.bundles.values().filter(|b| b.critical) {
            if bundle.compressed_size > budget {
                ctx.violation(format!(
                    "bundle {} is {} bytes compressed, over the {budget}-byte budget",
                    bundle.name, bundle.compressed_size
                ));
            }
        }

        let pages_checked = ctx.state().pages_checked;
        let templates = ctx.templates();
        if pages_checked == 0 && !templates.is_empty() {
            let mut compliant = 0;
            for doc in &templates {
                let len = ctx.compressor.compressed_len(
                    doc.html().as_bytes(),
                    ctx.config.compression.algorithm,
                    ctx.config.compression.level,
                )?;
                if len <= budget {
                    compliant += 1;
                } else {
                    ctx.violation(format!(
                        "page {} is {len} bytes compressed, over the {budget}-byte first-packet budget",
                        doc.path.display()
                    ));
                }
            }
            let mut state = ctx.state();
            state.pages_checked = templates.len();
            state.pages_compliant = compliant;
        }

        let state = ctx.state();
        info!(
            "compliance: {} violations, {}/{} pages within budget",
            state.violations.len(),
            state.pages_compliant,
            state.pages_checked
        );
        Ok(StageOutcome::Completed)
    }
}

// ============================================================================
// generate-reports
// ============================================================================

/// Write text, JSON and HTML reports of the build so far.
pub struct GenerateReports;

#[async_trait]
impl StageAction for GenerateReports {
    async fn run(
        &self,
        ctx: Arc<BuildContext>,
        cancel: CancellationToken,
    ) -> Result<StageOutcome, StageError> {
        stop_if_cancelled(&cancel)?;
        let results = ctx.results(ctx.started_at, ctx.clock.now(), None, true);
        let dir = ctx.config.reports_dir();
        let written = spawn_blocking(move || write_reports(&results, &dir)).await??;
        debug!("wrote {} reports", written.len());
        Ok(StageOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::setup_static_site;

    fn config_for(root: &Path) -> OptimizerConfig {
        let mut config = OptimizerConfig::default();
        config.paths.static_dir = root.join("static");
        config.paths.templates_dir = root.join("templates");
        config.paths.output_dir = root.join("dist");
        config.paths.cache_dir = root.join("cache");
        config
    }

    #[test]
    fn default_stage_order_and_flags() {
        let stages = default_stages(&OptimizerConfig::default());
        let names: Vec<&str> = stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            [
                SCAN,
                EXTRACT_CRITICAL_CSS,
                OPTIMIZE_IMAGES,
                OPTIMIZE_SCRIPTS,
                OPTIMIZE_FONTS,
                BUNDLE_RESOURCES,
                OPTIMIZE_TEMPLATES,
                VALIDATE_COMPLIANCE,
                GENERATE_REPORTS
            ]
        );
        let critical: Vec<&str> = stages
            .iter()
            .filter(|s| s.critical)
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(critical, [SCAN, EXTRACT_CRITICAL_CSS, BUNDLE_RESOURCES]);
        assert_eq!(stages.iter().filter(|s| s.parallelizable).count(), 3);
        assert!(stages.iter().all(|s| s.max_retries == 2));
    }

    #[test]
    fn discover_templates_sorted_and_filtered() {
        let tmp = setup_static_site();
        let dir = tmp.path().join("templates");
        fs::create_dir_all(dir.join("blog")).unwrap();
        fs::write(dir.join("blog/post.htm"), "<p>post</p>").unwrap();
        fs::write(dir.join("notes.txt"), "ignore").unwrap();
        fs::write(dir.join(".draft.html"), "ignore").unwrap();

        let found = discover_templates(&dir).unwrap().unwrap();
        let paths: Vec<String> = found
            .iter()
            .map(|t| t.path.to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(paths, ["blog/post.htm", "index.html"]);
    }

    #[test]
    fn discover_templates_missing_dir_is_none() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(discover_templates(&tmp.path().join("nope")).unwrap().is_none());
    }

    #[test]
    fn bundle_cache_key_tracks_asset_content() {
        let tmp = setup_static_site();
        let config = config_for(tmp.path());
        let ctx = BuildContext::for_config(config.clone());
        ctx.catalog.scan(&config.paths.static_dir).unwrap();
        let options = BundleOptions::from_config(&config);
        let before = bundle_cache_key(&ctx.catalog.assets(), &options);
        assert_eq!(before, bundle_cache_key(&ctx.catalog.assets(), &options));

        fs::write(tmp.path().join("static/css/blog.css"), ".post{color:blue}").unwrap();
        ctx.catalog.scan(&config.paths.static_dir).unwrap();
        assert_ne!(before, bundle_cache_key(&ctx.catalog.assets(), &options));

        let mut smaller = options;
        smaller.critical_budget = 1024;
        assert_ne!(
            bundle_cache_key(&ctx.catalog.assets(), &options),
            bundle_cache_key(&ctx.catalog.assets(), &smaller)
        );
    }

    #[tokio::test]
    async fn validate_compliance_can_be_disabled() {
        let mut config = OptimizerConfig::default();
        config.build.validate_compliance = false;
        let ctx = Arc::new(BuildContext::for_config(config));
        let outcome = ValidateCompliance
            .run(ctx, CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, StageOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn validate_compliance_needs_bundles() {
        let ctx = Arc::new(BuildContext::for_config(OptimizerConfig::default()));
        let err = ValidateCompliance
            .run(ctx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Failed(_)));
    }

    #[tokio::test]
    async fn scan_then_extract_populates_state() {
        let tmp = setup_static_site();
        let ctx = Arc::new(BuildContext::for_config(config_for(tmp.path())));
        ScanAssets
            .run(Arc::clone(&ctx), CancellationToken::new())
            .await
            .unwrap();
        ExtractCriticalCss
            .run(Arc::clone(&ctx), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ctx.templates().len(), 1);
        let state = ctx.state();
        assert_eq!(state.scan.as_ref().unwrap().assets, 6);
        let css = &state.critical_css[Path::new("index.html")];
        assert!(css.contains(".header{display:flex}"));
        assert!(css.contains(".hero{"));
        // not on the page
        assert!(!css.contains(".sidebar"));
        assert!(!css.contains(".post"));
    }
}
