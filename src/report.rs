//! Build results and their human-readable forms.
//!
//! # Output Format
//!
//! ## Summary
//!
//! ```text
//! Build succeeded in 412ms
//!     Files: 14 (9 optimized)
//!     Saved: 38.2 KB
//!     Compliance: 100.0% (0 violations)
//! ```
//!
//! ## Report
//!
//! The summary, followed by one line per stage and the violations, warnings
//! and errors:
//!
//! ```text
//! Stages
//! 001 scan: succeeded (1 attempt, 12ms)
//! 002 extract-critical-css: succeeded (1 attempt, 30ms)
//! 003 optimize-fonts: failed (3 attempts, 60004ms)
//!     Error: timed out after 20s
//!
//! Violations
//!     css/hero.css (priority 10) dropped from critical-css: …
//! ```
//!
//! # Architecture
//!
//! Each view has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format
//! functions are pure. [`write_reports`] persists the text report, the JSON
//! results and an HTML page to the reports directory.

use crate::catalog::{ScanSummary, Snapshot};
use crate::critical::CriticalCss;
use crate::pipeline::{StageReport, StageState};
use chrono::{DateTime, Utc};
use maud::{DOCTYPE, Markup, html};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const TEXT_REPORT: &str = "build-report.txt";
pub const JSON_REPORT: &str = "build-results.json";
pub const HTML_REPORT: &str = "build-report.html";

/// Outcome of one build. Immutable once the build returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildResults {
    pub success: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_files: usize,
    pub optimized_files: usize,
    pub compliance_violations: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    /// Bytes saved by compression and page optimization. Negative when
    /// outputs grew.
    pub size_savings: i64,
    /// Percentage of checked pages within the budget.
    pub compliance_rate: f64,
    pub stages: Vec<StageReport>,
}

impl BuildResults {
    pub fn duration_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds()
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// Human-readable byte count: `512 B`, `14.0 KB`, `1.2 MB`.
pub fn format_bytes(bytes: i64) -> String {
    let sign = if bytes < 0 { "-" } else { "" };
    let n = bytes.unsigned_abs() as f64;
    if n < 1024.0 {
        format!("{sign}{} B", bytes.unsigned_abs())
    } else if n < 1024.0 * 1024.0 {
        format!("{sign}{:.1} KB", n / 1024.0)
    } else {
        format!("{sign}{:.1} MB", n / (1024.0 * 1024.0))
    }
}

fn plural(n: u32, word: &str) -> String {
    if n == 1 {
        format!("{n} {word}")
    } else {
        format!("{n} {word}s")
    }
}

// ============================================================================
// Scan output
// ============================================================================

/// One line per catalogued asset, critical ones marked with their priority.
///
/// ```text
/// Assets
/// 001 css/critical.css (1.2 KB, css, critical p30)
/// 002 js/app.js (340 B, js)
///
/// 5 assets, 2 critical, 0 skipped (4.1 KB)
/// ```
pub fn format_scan_output(summary: &ScanSummary, assets: &Snapshot) -> Vec<String> {
    let mut lines = vec!["Assets".to_string()];
    for (i, asset) in assets.iter().enumerate() {
        let critical = if asset.critical {
            format!(", critical p{}", asset.priority)
        } else {
            String::new()
        };
        lines.push(format!(
            "{} {} ({}, {}{critical})",
            format_index(i + 1),
            asset.path.display(),
            format_bytes(asset.size as i64),
            asset.kind
        ));
        if !asset.dependencies.is_empty() {
            let deps: Vec<String> = asset
                .dependencies
                .iter()
                .map(|d| d.display().to_string())
                .collect();
            lines.push(format!("{}Imports: {}", indent(1), deps.join(", ")));
        }
    }
    lines.push(String::new());
    lines.push(format!(
        "{} assets, {} critical, {} skipped ({})",
        summary.assets,
        summary.critical,
        summary.skipped,
        format_bytes(summary.total_bytes as i64)
    ));
    lines
}

pub fn print_scan_output(summary: &ScanSummary, assets: &Snapshot) {
    for line in format_scan_output(summary, assets) {
        println!("{}", line);
    }
}

// ============================================================================
// Extract output
// ============================================================================

/// Statistics of a critical-CSS extraction. The CSS itself is not included.
pub fn format_extract_output(critical: &CriticalCss, budget: usize) -> Vec<String> {
    let mut lines = vec![format!(
        "Critical CSS: {} of {} budget",
        format_bytes(critical.css.len() as i64),
        format_bytes(budget as i64)
    )];
    lines.push(format!("{}Kept: {} rules", indent(1), critical.kept));
    lines.push(format!("{}Unused: {} rules", indent(1), critical.unused));
    lines.push(format!("{}Over budget: {} rules", indent(1), critical.dropped));
    for err in &critical.malformed {
        lines.push(format!("{}Malformed: {err}", indent(1)));
    }
    lines
}

// ============================================================================
// Build output
// ============================================================================

/// Short summary of a build.
pub fn format_build_summary(results: &BuildResults) -> Vec<String> {
    let status = if results.success { "succeeded" } else { "failed" };
    vec![
        format!("Build {status} in {}ms", results.duration_ms()),
        format!(
            "{}Files: {} ({} optimized)",
            indent(1),
            results.total_files,
            results.optimized_files
        ),
        format!("{}Saved: {}", indent(1), format_bytes(results.size_savings)),
        format!(
            "{}Compliance: {:.1}% ({} violations)",
            indent(1),
            results.compliance_rate,
            results.compliance_violations.len()
        ),
    ]
}

fn stage_line(index: usize, stage: &StageReport) -> String {
    match stage.state {
        StageState::Skipped => format!(
            "{} {}: skipped{}",
            format_index(index),
            stage.name,
            stage
                .note
                .as_deref()
                .map(|n| format!(" ({n})"))
                .unwrap_or_default()
        ),
        state => format!(
            "{} {}: {state} ({}, {}ms)",
            format_index(index),
            stage.name,
            plural(stage.attempts, "attempt"),
            stage.duration_ms
        ),
    }
}

/// Summary, stage trace, and every violation, warning and error.
pub fn format_build_report(results: &BuildResults) -> Vec<String> {
    let mut lines = format_build_summary(results);

    lines.push(String::new());
    lines.push("Stages".to_string());
    for (i, stage) in results.stages.iter().enumerate() {
        lines.push(stage_line(i + 1, stage));
        if let Some(err) = &stage.error
            && stage.state == StageState::Failed
        {
            lines.push(format!("{}Error: {err}", indent(1)));
        }
    }

    for (title, items) in [
        ("Violations", &results.compliance_violations),
        ("Warnings", &results.warnings),
        ("Errors", &results.errors),
    ] {
        if items.is_empty() {
            continue;
        }
        lines.push(String::new());
        lines.push(title.to_string());
        for item in items {
            lines.push(format!("{}{item}", indent(1)));
        }
    }
    lines
}

pub fn print_build_summary(results: &BuildResults) {
    for line in format_build_summary(results) {
        println!("{}", line);
    }
}

pub fn print_build_report(results: &BuildResults) {
    for line in format_build_report(results) {
        println!("{}", line);
    }
}

// ============================================================================
// HTML report
// ============================================================================

const REPORT_CSS: &str = "body{font-family:system-ui,sans-serif;margin:2rem;max-width:60rem}\
table{border-collapse:collapse;width:100%}td,th{padding:.3rem .6rem;border-bottom:1px solid #ddd;text-align:left}\
.failed{color:#b00}.succeeded{color:#070}.skipped{color:#777}";

fn state_class(state: StageState) -> &'static str {
    match state {
        StageState::Succeeded => "succeeded",
        StageState::Failed => "failed",
        StageState::Pending | StageState::Running { .. } | StageState::Skipped => "skipped",
    }
}

pub fn render_html_report(results: &BuildResults) -> Markup {
    let status = if results.success { "succeeded" } else { "failed" };
    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="utf-8";
                title { "first-packet build report" }
                style { (REPORT_CSS) }
            }
            body {
                h1 class=(status) { "Build " (status) }
                p {
                    "Started " (results.start_time.to_rfc3339()) ", took "
                    (results.duration_ms()) "ms."
                }
                table {
                    tr { th { "Files" } td { (results.total_files) } }
                    tr { th { "Optimized" } td { (results.optimized_files) } }
                    tr { th { "Saved" } td { (format_bytes(results.size_savings)) } }
                    tr { th { "Compliance" } td { (format!("{:.1}%", results.compliance_rate)) } }
                }
                h2 { "Stages" }
                table {
                    tr { th { "Stage" } th { "State" } th { "Attempts" } th { "Duration" } th { "Detail" } }
                    @for stage in &results.stages {
                        tr {
                            td { (stage.name) @if stage.critical { " *" } }
                            td class=(state_class(stage.state)) { (stage.state) }
                            td { (stage.attempts) }
                            td { (stage.duration_ms) "ms" }
                            td { (stage.error.as_deref().or(stage.note.as_deref()).unwrap_or("")) }
                        }
                    }
                }
                @for (title, items) in [
                    ("Violations", &results.compliance_violations),
                    ("Warnings", &results.warnings),
                    ("Errors", &results.errors),
                ] {
                    @if !items.is_empty() {
                        h2 { (title) }
                        ul {
                            @for item in items {
                                li { (item) }
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Write the text, JSON and HTML reports into `dir`.
pub fn write_reports(results: &BuildResults, dir: &Path) -> io::Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let text = dir.join(TEXT_REPORT);
    fs::write(&text, format_build_report(results).join("\n") + "\n")?;
    let json = dir.join(JSON_REPORT);
    fs::write(&json, serde_json::to_string_pretty(results)?)?;
    let page = dir.join(HTML_REPORT);
    fs::write(&page, render_html_report(results).into_string())?;
    Ok(vec![text, json, page])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::AssetKind;
    use crate::test_helpers::make_asset;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn stage(name: &str, state: StageState, attempts: u32) -> StageReport {
        StageReport {
            name: name.into(),
            critical: true,
            state,
            attempts,
            duration_ms: 5,
            error: (state == StageState::Failed).then(|| "boom".to_string()),
            note: (state == StageState::Skipped).then(|| "build aborted".to_string()),
            transitions: vec![StageState::Pending, state],
        }
    }

    fn results() -> BuildResults {
        let start = DateTime::<Utc>::UNIX_EPOCH;
        BuildResults {
            success: false,
            start_time: start,
            end_time: start + chrono::Duration::milliseconds(412),
            total_files: 14,
            optimized_files: 9,
            compliance_violations: vec!["css/x.css dropped".into()],
            warnings: vec![],
            errors: vec!["bundle-resources: boom".into()],
            size_savings: 39117,
            compliance_rate: 50.0,
            stages: vec![
                stage("scan", StageState::Succeeded, 1),
                stage("bundle-resources", StageState::Failed, 3),
                stage("generate-reports", StageState::Skipped, 0),
            ],
        }
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(14336), "14.0 KB");
        assert_eq!(format_bytes(-2048), "-2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn summary_lines() {
        let lines = format_build_summary(&results());
        assert_eq!(
            lines,
            vec![
                "Build failed in 412ms",
                "    Files: 14 (9 optimized)",
                "    Saved: 38.2 KB",
                "    Compliance: 50.0% (1 violations)",
            ]
        );
    }

    #[test]
    fn report_lists_stages_and_sections() {
        let lines = format_build_report(&results());
        assert!(lines.contains(&"001 scan: succeeded (1 attempt, 5ms)".to_string()));
        assert!(lines.contains(&"002 bundle-resources: failed (3 attempts, 5ms)".to_string()));
        assert!(lines.contains(&"    Error: boom".to_string()));
        assert!(lines.contains(&"003 generate-reports: skipped (build aborted)".to_string()));
        assert!(lines.contains(&"Violations".to_string()));
        assert!(lines.contains(&"Errors".to_string()));
        assert!(!lines.contains(&"Warnings".to_string()));
    }

    #[test]
    fn scan_output_marks_critical() {
        let mut asset = make_asset("css/critical.css", AssetKind::Css, 1229, true, 30);
        asset.dependencies = vec![PathBuf::from("css/base.css")];
        let assets: Snapshot = Arc::from(vec![
            Arc::new(asset),
            Arc::new(make_asset("js/app.js", AssetKind::Js, 340, false, 0)),
        ]);
        let summary = ScanSummary {
            root: PathBuf::from("static"),
            assets: 2,
            critical: 1,
            skipped: 0,
            total_bytes: 1569,
        };
        let lines = format_scan_output(&summary, &assets);
        assert_eq!(lines[1], "001 css/critical.css (1.2 KB, css, critical p30)");
        assert_eq!(lines[2], "    Imports: css/base.css");
        assert_eq!(lines[3], "002 js/app.js (340 B, js)");
        assert_eq!(lines.last().unwrap(), "2 assets, 1 critical, 0 skipped (1.5 KB)");
    }

    #[test]
    fn html_report_escapes_content() {
        let mut r = results();
        r.warnings.push("<script>alert(1)</script>".into());
        let page = render_html_report(&r).into_string();
        assert!(page.starts_with("<!DOCTYPE html>"));
        assert!(page.contains("&lt;script&gt;"));
        assert!(page.contains("bundle-resources"));
    }

    #[test]
    fn write_reports_creates_all_three() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("reports");
        let written = write_reports(&results(), &dir).unwrap();
        assert_eq!(written.len(), 3);
        let json = fs::read_to_string(dir.join(JSON_REPORT)).unwrap();
        let parsed: BuildResults = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, results());
        assert!(fs::read_to_string(dir.join(TEXT_REPORT)).unwrap().starts_with("Build failed"));
    }
}
