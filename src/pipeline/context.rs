//! Shared state of one build.
//!
//! Stages receive an `Arc<BuildContext>` and communicate only through it:
//! injected capabilities (catalog, reader, compressor, cache, clock), the
//! discovered templates, and a [`BuildState`] accumulating outputs,
//! violations and warnings.
//!
//! Templates are shared between stages of the same parallel group. Each
//! [`TemplateDoc`] has its own lock and is only changed by read-modify-write
//! under that lock, so rewrites of different parts of a page from concurrent
//! stages never lose each other's edits.

use super::StageReport;
use crate::bundle::BundleSet;
use crate::cache::BuildCache;
use crate::catalog::{AssetCatalog, AssetReader, AssetScanner, FsReader, ScanOptions, ScanSummary};
use crate::clock::{Clock, SystemClock};
use crate::compress::{Compressor, StandardCompressor};
use crate::config::OptimizerConfig;
use crate::report::BuildResults;
use crate::transform::{self, ContentTransform, TransformError};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

/// A page template being optimized.
#[derive(Debug)]
pub struct TemplateDoc {
    /// Path relative to the templates root.
    pub path: PathBuf,
    pub original_size: usize,
    html: Mutex<String>,
}

impl TemplateDoc {
    pub fn new(path: impl Into<PathBuf>, html: String) -> Self {
        Self {
            path: path.into(),
            original_size: html.len(),
            html: Mutex::new(html),
        }
    }

    pub fn html(&self) -> String {
        self.html.lock().clone()
    }

    /// Apply a transform under the document lock. Returns whether the
    /// markup changed.
    pub fn apply(&self, transform: &dyn ContentTransform) -> Result<bool, TransformError> {
        let mut html = self.html.lock();
        let rewritten = transform.transform(&html)?;
        let changed = rewritten != *html;
        *html = rewritten;
        Ok(changed)
    }

    /// Apply transforms in order under one lock. The markup is left as it
    /// was when any of them fails.
    pub fn apply_all(&self, transforms: &[&dyn ContentTransform]) -> Result<bool, TransformError> {
        let mut html = self.html.lock();
        let rewritten = transform::apply_all(transforms, &html)?;
        let changed = rewritten != *html;
        *html = rewritten;
        Ok(changed)
    }
}

/// Everything stages produce.
#[derive(Debug, Default)]
pub struct BuildState {
    pub scan: Option<ScanSummary>,
    /// Inlinable critical CSS per template path.
    pub critical_css: BTreeMap<PathBuf, String>,
    pub bundles: Option<Arc<BundleSet>>,
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
    /// Files rewritten or bundled, as paths under their source root.
    pub optimized: BTreeSet<PathBuf>,
    pub pages_checked: usize,
    pub pages_compliant: usize,
    /// Raw minus compressed bytes over text bundles.
    pub bundle_savings: i64,
    /// Original minus compressed bytes over optimized pages.
    pub page_savings: i64,
    /// Reports of stages finished so far, in completion order.
    pub stage_reports: Vec<StageReport>,
}

pub struct BuildContext {
    pub config: OptimizerConfig,
    pub catalog: Arc<dyn AssetScanner>,
    pub reader: Arc<dyn AssetReader>,
    pub compressor: Arc<dyn Compressor>,
    pub cache: Option<Arc<BuildCache>>,
    pub clock: Arc<dyn Clock>,
    pub started_at: DateTime<Utc>,
    templates: RwLock<Vec<Arc<TemplateDoc>>>,
    state: Mutex<BuildState>,
}

impl BuildContext {
    pub fn new(
        config: OptimizerConfig,
        catalog: Arc<dyn AssetScanner>,
        reader: Arc<dyn AssetReader>,
        compressor: Arc<dyn Compressor>,
        cache: Option<Arc<BuildCache>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            started_at: clock.now(),
            config,
            catalog,
            reader,
            compressor,
            cache,
            clock,
            templates: RwLock::new(Vec::new()),
            state: Mutex::new(BuildState::default()),
        }
    }

    /// Filesystem-backed context without a cache.
    pub fn for_config(config: OptimizerConfig) -> Self {
        let catalog = Arc::new(AssetCatalog::new(ScanOptions::from_config(&config.assets)));
        let reader = Arc::new(FsReader::new(config.paths.static_dir.clone()));
        Self::new(
            config,
            catalog,
            reader,
            Arc::new(StandardCompressor),
            None,
            Arc::new(SystemClock),
        )
    }

    pub fn templates(&self) -> Vec<Arc<TemplateDoc>> {
        self.templates.read().clone()
    }

    pub fn set_templates(&self, templates: Vec<TemplateDoc>) {
        *self.templates.write() = templates.into_iter().map(Arc::new).collect();
    }

    pub fn state(&self) -> MutexGuard<'_, BuildState> {
        self.state.lock()
    }

    pub fn warn(&self, warning: impl Into<String>) {
        let warning = warning.into();
        log::warn!("{warning}");
        self.state.lock().warnings.push(warning);
    }

    pub fn violation(&self, violation: impl Into<String>) {
        let violation = violation.into();
        log::warn!("compliance: {violation}");
        let mut state = self.state.lock();
        if !state.violations.contains(&violation) {
            state.violations.push(violation);
        }
    }

    pub fn mark_optimized(&self, path: PathBuf) {
        self.state.lock().optimized.insert(path);
    }

    pub fn record_stage(&self, report: &StageReport) {
        self.state.lock().stage_reports.push(report.clone());
    }

    /// Results from the current state. `stages` overrides the recorded
    /// stage reports when given (the final, declared-order list).
    pub fn results(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        stages: Option<Vec<StageReport>>,
        success: bool,
    ) -> BuildResults {
        let state = self.state.lock();
        let stages = stages.unwrap_or_else(|| state.stage_reports.clone());

        let mut warnings = state.warnings.clone();
        let mut errors = Vec::new();
        for report in stages.iter().filter(|r| r.failed()) {
            let message = format!(
                "{}: {}",
                report.name,
                report.error.as_deref().unwrap_or("failed")
            );
            if report.critical {
                errors.push(message);
            } else {
                warnings.push(message);
            }
        }

        let compliance_rate = if state.pages_checked == 0 {
            100.0
        } else {
            state.pages_compliant as f64 / state.pages_checked as f64 * 100.0
        };

        BuildResults {
            success,
            start_time,
            end_time,
            total_files: state.scan.as_ref().map_or(0, |s| s.assets) + self.templates.read().len(),
            optimized_files: state.optimized.len(),
            compliance_violations: state.violations.clone(),
            warnings,
            errors,
            size_savings: state.bundle_savings + state.page_savings,
            compliance_rate,
            stages,
        }
    }
}
