//! Build orchestration.
//!
//! The [`Orchestrator`] owns the configuration, the stage list and the
//! injected capabilities (catalog, reader, compressor, cache, clock), runs
//! builds through the stage engine and keeps the results of the last one.
//!
//! ```text
//! Orchestrator::new(config)
//!     .with_compressor(..)          // optional overrides
//!     .build_optimized(&cancel)     // -> Result<BuildResults, BuildError>
//!         ├─ warm cache from disk (first build only)
//!         ├─ run_stages(..)
//!         ├─ persist cache
//!         └─ record last results
//! ```
//!
//! Builds on one orchestrator are expected to run one at a time; the last
//! results are kept behind a mutex so accessors can be called from other
//! tasks while a build runs.

use crate::cache::BuildCache;
use crate::catalog::{AssetCatalog, AssetReader, AssetScanner, FsReader, ScanOptions};
use crate::clock::{Clock, SystemClock};
use crate::compress::{Compressor, StandardCompressor};
use crate::config::OptimizerConfig;
use crate::pipeline::stages::default_stages;
use crate::pipeline::{
    Backoff, BuildContext, OptimizationStage, RunOptions, linear_backoff, run_stages,
};
use crate::report::{BuildResults, format_build_report, format_build_summary};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// A build that did not succeed. Both variants carry the partial results.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("critical stage {stage} failed: {message}")]
    StageFailed {
        stage: String,
        message: String,
        results: Box<BuildResults>,
    },
    #[error("build cancelled")]
    Cancelled { results: Box<BuildResults> },
}

impl BuildError {
    pub fn results(&self) -> &BuildResults {
        match self {
            BuildError::StageFailed { results, .. } | BuildError::Cancelled { results } => results,
        }
    }
}

/// Default delay step between stage retries.
const RETRY_STEP: Duration = Duration::from_secs(1);

pub struct Orchestrator {
    config: OptimizerConfig,
    stages: Vec<OptimizationStage>,
    backoff: Backoff,
    clock: Arc<dyn Clock>,
    catalog: Arc<dyn AssetScanner>,
    reader: Arc<dyn AssetReader>,
    compressor: Arc<dyn Compressor>,
    cache: Option<Arc<BuildCache>>,
    last_results: Mutex<Option<BuildResults>>,
}

impl Orchestrator {
    /// Filesystem-backed orchestrator with the standard stages.
    pub fn new(config: OptimizerConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cache = config
            .build
            .enable_build_cache
            .then(|| Arc::new(new_cache(&config, Arc::clone(&clock))));
        Self {
            stages: default_stages(&config),
            backoff: linear_backoff(RETRY_STEP),
            catalog: Arc::new(AssetCatalog::new(ScanOptions::from_config(&config.assets))),
            reader: Arc::new(FsReader::new(config.paths.static_dir.clone())),
            compressor: Arc::new(StandardCompressor),
            cache,
            clock,
            config,
            last_results: Mutex::new(None),
        }
    }

    pub fn with_stages(mut self, stages: Vec<OptimizationStage>) -> Self {
        self.stages = stages;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replace the clock. A cache created by [`Orchestrator::new`] is
    /// recreated on the new clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        if self.cache.is_some() {
            self.cache = Some(Arc::new(new_cache(&self.config, Arc::clone(&clock))));
        }
        self.clock = clock;
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn AssetScanner>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_reader(mut self, reader: Arc<dyn AssetReader>) -> Self {
        self.reader = reader;
        self
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn with_cache(mut self, cache: Option<Arc<BuildCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn stages(&self) -> &[OptimizationStage] {
        &self.stages
    }

    pub fn cache(&self) -> Option<&Arc<BuildCache>> {
        self.cache.as_ref()
    }

    /// Run every stage once. `Err` carries the partial results when a
    /// critical stage fails or `cancel` fires.
    pub async fn build_optimized(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BuildResults, BuildError> {
        let cache_dir = &self.config.paths.cache_dir;
        if let Some(cache) = &self.cache
            && cache.is_empty()
        {
            cache.load(cache_dir);
        }

        let ctx = Arc::new(BuildContext::new(
            self.config.clone(),
            Arc::clone(&self.catalog),
            Arc::clone(&self.reader),
            Arc::clone(&self.compressor),
            self.cache.clone(),
            Arc::clone(&self.clock),
        ));
        info!(
            "build started: {} stages, {}",
            self.stages.len(),
            if self.config.build.parallel_stages {
                "parallel"
            } else {
                "sequential"
            }
        );

        let options = RunOptions {
            parallel: self.config.build.parallel_stages,
            build_timeout: self.config.build_timeout(),
            backoff: Arc::clone(&self.backoff),
        };
        let run = run_stages(&self.stages, &ctx, cancel, &options).await;

        let success = !run.cancelled && run.failed_stage.is_none();
        let mut results = ctx.results(ctx.started_at, self.clock.now(), Some(run.reports), success);
        if run.cancelled {
            results.errors.push("build cancelled".to_string());
        }

        if let Some(cache) = &self.cache {
            match cache.save(cache_dir) {
                Ok(()) => debug!("cache saved ({} entries, {})", cache.len(), cache.stats()),
                Err(err) => warn!("failed to save build cache: {err}"),
            }
        }
        *self.last_results.lock() = Some(results.clone());

        if run.cancelled {
            warn!("build cancelled");
            return Err(BuildError::Cancelled {
                results: Box::new(results),
            });
        }
        if let Some(stage) = run.failed_stage {
            let message = results
                .stages
                .iter()
                .find(|s| s.name == stage)
                .and_then(|s| s.error.clone())
                .unwrap_or_else(|| "failed".to_string());
            error!("build failed: {stage}: {message}");
            return Err(BuildError::StageFailed {
                stage,
                message,
                results: Box::new(results),
            });
        }
        info!(
            "build succeeded: {} files, {} optimized, {} violations",
            results.total_files,
            results.optimized_files,
            results.compliance_violations.len()
        );
        Ok(results)
    }

    pub fn last_build_results(&self) -> Option<BuildResults> {
        self.last_results.lock().clone()
    }

    pub fn build_summary(&self) -> Option<String> {
        self.last_build_results()
            .map(|r| format_build_summary(&r).join("\n"))
    }

    pub fn build_report(&self) -> Option<String> {
        self.last_build_results()
            .map(|r| format_build_report(&r).join("\n"))
    }

    /// Build, then rebuild whenever the static or template tree changes,
    /// until `cancel` fires. Failed builds are logged and watching goes on.
    pub async fn watch(&self, cancel: &CancellationToken) {
        let roots = vec![
            self.config.paths.static_dir.clone(),
            self.config.paths.templates_dir.clone(),
        ];
        let interval = self.config.watch_interval();
        let mut last = None;
        info!("watching {} every {interval:?}", display_roots(&roots));

        loop {
            let scan_roots = roots.clone();
            let current = match tokio::task::spawn_blocking(move || fingerprint(&scan_roots)).await
            {
                Ok(fp) => fp,
                Err(err) => {
                    error!("fingerprint task failed: {err}");
                    break;
                }
            };
            if last.as_ref() != Some(&current) {
                if last.is_some() {
                    info!("change detected, rebuilding");
                }
                if let Err(err) = self.build_optimized(cancel).await {
                    match err {
                        BuildError::Cancelled { .. } => break,
                        other => error!("{other}"),
                    }
                }
                last = Some(current);
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("watch stopped");
    }

    /// Periodically drop expired cache entries until `cancel` fires.
    /// `None` without a cache.
    pub fn spawn_cache_sweeper(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let cache = self.cache.clone()?;
        let period = self.config.cache.sweep_interval();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.prune_expired();
                        debug!("cache sweep: {removed} expired, {} left", cache.len());
                    }
                }
            }
        }))
    }
}

fn new_cache(config: &OptimizerConfig, clock: Arc<dyn Clock>) -> BuildCache {
    BuildCache::new(config.cache.ttl(), config.cache.max_entries, clock)
}

fn display_roots(roots: &[PathBuf]) -> String {
    roots
        .iter()
        .map(|r| r.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// `(path, size, mtime)` of every file under `roots`, in walk order.
/// Missing roots contribute nothing.
pub fn fingerprint(roots: &[PathBuf]) -> Vec<(PathBuf, u64, Option<SystemTime>)> {
    let mut entries = Vec::new();
    for root in roots.iter().filter(|r| r.exists()) {
        for entry in WalkDir::new(root).sort_by_file_name().into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            entries.push((
                entry.path().to_path_buf(),
                metadata.len(),
                metadata.modified().ok(),
            ));
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::test_helpers::setup_static_site;
    use std::fs;
    use std::path::Path;

    fn config_for(root: &Path) -> OptimizerConfig {
        let mut config = OptimizerConfig::default();
        config.paths.static_dir = root.join("static");
        config.paths.templates_dir = root.join("templates");
        config.paths.output_dir = root.join("dist");
        config.paths.cache_dir = root.join("cache");
        config
    }

    #[tokio::test]
    async fn accessors_empty_before_first_build() {
        let orchestrator = Orchestrator::new(OptimizerConfig::default());
        assert!(orchestrator.last_build_results().is_none());
        assert!(orchestrator.build_summary().is_none());
        assert!(orchestrator.build_report().is_none());
    }

    #[test]
    fn cache_follows_config_toggle() {
        let mut config = OptimizerConfig::default();
        assert!(Orchestrator::new(config.clone()).cache().is_some());
        config.build.enable_build_cache = false;
        assert!(Orchestrator::new(config).cache().is_none());
    }

    #[test]
    fn fingerprint_detects_changes() {
        let tmp = setup_static_site();
        let static_dir = tmp.path().join("static");
        let roots = vec![static_dir.clone()];
        let before = fingerprint(&roots);
        assert_eq!(before, fingerprint(&roots));

        fs::write(static_dir.join("css/new.css"), "a{}").unwrap();
        assert_ne!(before, fingerprint(&roots));
    }

    #[test]
    fn fingerprint_ignores_missing_roots() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(fingerprint(&[tmp.path().join("nope")]).is_empty());
    }

    #[tokio::test]
    async fn sweeper_prunes_and_stops() {
        let tmp = setup_static_site();
        let mut config = config_for(tmp.path());
        config.cache.sweep_interval_secs = 1;
        config.cache.ttl_secs = 10;
        let clock = Arc::new(ManualClock::default());
        let orchestrator = Orchestrator::new(config).with_clock(clock.clone());
        let cache = Arc::clone(orchestrator.cache().unwrap());
        cache.put(
            "k",
            crate::cache::CacheEntry::new("k", vec![1], true, clock.now()),
        );
        clock.advance(chrono::Duration::seconds(60));

        let cancel = CancellationToken::new();
        let handle = orchestrator.spawn_cache_sweeper(cancel.clone()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cache.is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("sweeper should prune the expired entry");
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn watch_builds_once_and_stops_on_cancel() {
        let tmp = setup_static_site();
        let mut config = config_for(tmp.path());
        config.build.watch_interval_secs = 1;
        let orchestrator = Orchestrator::new(config);
        let cancel = CancellationToken::new();
        let stopper = async {
            while orchestrator.last_build_results().is_none() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            cancel.cancel();
        };
        tokio::time::timeout(Duration::from_secs(30), async {
            tokio::join!(orchestrator.watch(&cancel), stopper)
        })
        .await
        .expect("watch should stop on cancel");
        let results = orchestrator.last_build_results().unwrap();
        assert!(results.success);
        assert!(tmp.path().join("dist/reports/build-results.json").exists());
    }
}
