//! # First Packet
//!
//! A build pipeline that makes a site's first paint fit in the first TCP
//! round trip. Browsers receive roughly 14KB (ten segments of the initial
//! congestion window) before the first ACK; everything needed to render the
//! page above the fold should arrive in that window, compressed.
//!
//! # Architecture: Staged Build
//!
//! A build is an ordered list of stages sharing one [`pipeline::BuildContext`]:
//!
//! ```text
//! scan                  static/     →  asset catalog
//! extract-critical-css  catalog     →  per-page inlinable CSS
//! optimize-images   ┐
//! optimize-scripts  ├─  templates   →  rewritten markup (run concurrently)
//! optimize-fonts    ┘
//! bundle-resources      catalog     →  dist/bundles/
//! optimize-templates    templates   →  dist/templates/
//! validate-compliance   bundles     →  violations
//! generate-reports      results     →  dist/reports/
//! ```
//!
//! Consecutive parallelizable stages form a group that runs concurrently;
//! everything else runs one at a time. Each stage has a timeout and a retry
//! budget. A failing non-critical stage becomes a warning; a failing
//! critical stage aborts the build and cancels its siblings.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`catalog`] | Walks the static root, classifies assets, extracts `@import`/`import` dependencies |
//! | [`critical`] | Minimal CSS parser, selector matching and budgeted critical-CSS selection |
//! | [`bundle`] | Partitions assets into named bundles and fits critical bundles into the budget |
//! | [`compress`] | The `Compressor` capability: gzip and brotli behind one trait |
//! | [`cache`] | Content-addressed, TTL-bounded artifact cache persisted as JSON |
//! | [`transform`] | `ContentTransform` rewrites applied to page markup |
//! | [`pipeline`] | Stage model, retry state machine, group scheduling and the built-in stages |
//! | [`orchestrator`] | Owns stages and capabilities; single builds, watch mode, cache sweeps |
//! | [`report`] | `BuildResults` plus text, JSON and HTML report rendering |
//! | [`config`] | `first-packet.toml` loading, merging over stock defaults, validation |
//! | [`clock`] | Injectable time source for TTLs and timestamps |
//!
//! # Design Decisions
//!
//! ## Budgets Are Measured Compressed
//!
//! The wire carries compressed bytes, so a critical bundle's size is the
//! length of its compressed content at the configured algorithm and level.
//! The same compressor measures pages after template optimization. Tests
//! swap in a compressor with a fixed ratio to make fitting deterministic.
//!
//! ## Demotion Over Failure
//!
//! When critical assets don't fit, the lowest-priority ones move to the
//! matching non-critical bundle (`critical-css` → `extended-css`,
//! `critical-js` → `app-js`) and each move is recorded as a compliance
//! violation. The build still succeeds; the report says what was given up.
//!
//! ## Explicit Capabilities
//!
//! The catalog, asset reader, compressor, cache and clock are trait objects
//! handed to the orchestrator at construction. Nothing reaches for a global:
//! tests build a pipeline over in-memory assets with a manual clock.

pub mod bundle;
pub mod cache;
pub mod catalog;
pub mod clock;
pub mod compress;
pub mod config;
pub mod critical;
pub mod orchestrator;
pub mod pipeline;
pub mod report;
pub mod transform;

#[cfg(test)]
pub(crate) mod test_helpers;
