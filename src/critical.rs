//! Critical CSS extraction.
//!
//! Given a page's HTML and the site's full stylesheet, select the rules most
//! likely to matter for above-the-fold rendering and return them as one
//! minified stylesheet no larger than a byte budget.
//!
//! ## Algorithm
//!
//! 1. Parse the stylesheet into rules. `@media` and `@supports` blocks are
//!    descended into and their rules keep the wrapping condition. Other
//!    at-rules (`@font-face`, `@keyframes`, `@import`, …) never count as
//!    critical. Malformed rules are skipped and reported, not fatal.
//! 2. Drop rules whose selectors do not occur in the HTML, unless the
//!    selector is always critical (`html`, `body`, `*`, `:root`, headings).
//! 3. Score each surviving rule. Structural selectors and layout class names
//!    score high; pseudo-classes, pseudo-elements, long descendant chains and
//!    conditional blocks score lower.
//! 4. Take rules in score order until the next one would overflow the
//!    budget, then stop. Rules are never cut in half.
//! 5. Emit the chosen rules in their original source order (so the cascade
//!    still resolves the same way) and run a final minification pass.
//!
//! The output length never exceeds the budget. A budget of zero, or a budget
//! smaller than the best-scoring rule, yields an empty string.
//!
//! ## Limitations
//!
//! "Occurs in the HTML" is a literal substring test for each class, id and
//! tag token of a selector, not real selector matching. A class name that
//! appears in body text counts as used, and attribute or structural
//! pseudo-class constraints are ignored. This over-approximates, which only
//! costs budget, never correctness of the rendered page.

use log::debug;
use thiserror::Error;

/// Selectors kept even when they don't literally appear in the page.
const ALWAYS_CRITICAL: &[&str] = &["html", "body", "*", ":root", "h1", "h2", "h3", "h4", "h5", "h6"];

/// Tags that shape the page skeleton.
const STRUCTURAL_TAGS: &[&str] = &["html", "body", "header", "nav", "main", "section", "article"];

/// Class/id fragments that usually belong to layout containers.
const LAYOUT_NAMES: &[&str] = &[
    "container", "wrapper", "layout", "grid", "row", "col", "hero", "header", "nav", "main",
    "content", "page", "site", "banner", "above-fold", "fold",
];

/// Properties that affect first paint geometry or colour.
const LAYOUT_PROPERTIES: &[&str] = &[
    "display", "position", "width", "height", "margin", "padding", "font", "color",
    "background", "top", "left", "flex", "grid",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("unterminated block starting at byte {offset}")]
    Unterminated { offset: usize },
    #[error("unmatched `}}` at byte {offset}")]
    UnmatchedClose { offset: usize },
    #[error("rule at byte {offset} has an empty selector")]
    EmptySelector { offset: usize },
    #[error("declaration outside any rule at byte {offset}")]
    StrayDeclaration { offset: usize },
    #[error("rule `{selector}` has malformed declarations")]
    MalformedDeclarations { selector: String },
}

/// One style rule, possibly nested inside conditional at-rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CssRule {
    pub selector: String,
    pub declarations: String,
    /// Enclosing `@media`/`@supports` preludes, outermost first.
    pub conditions: Vec<String>,
    /// Position in the source stylesheet.
    pub order: usize,
}

impl CssRule {
    /// Minified text of the rule including its condition wrappers.
    pub fn render(&self) -> String {
        let declarations = self
            .declarations
            .split(';')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(|d| match d.split_once(':') {
                Some((prop, value)) => format!("{}:{}", prop.trim(), value.trim()),
                None => d.to_string(),
            })
            .collect::<Vec<_>>()
            .join(";");
        let mut text = format!("{}{{{}}}", self.selector.trim(), declarations);
        for condition in self.conditions.iter().rev() {
            text = format!("{}{{{}}}", condition.trim(), text);
        }
        minify_css(&text)
    }
}

/// Parse result: usable rules plus the problems that were skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedCss {
    pub rules: Vec<CssRule>,
    pub malformed: Vec<ExtractionError>,
}

/// Output of [`extract_critical`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CriticalCss {
    pub css: String,
    /// Rules included in `css`.
    pub kept: usize,
    /// Used rules that did not fit the budget.
    pub dropped: usize,
    /// Rules whose selectors don't occur in the page.
    pub unused: usize,
    pub malformed: Vec<ExtractionError>,
}

/// Select the above-the-fold subset of `full_css` for `html`.
pub fn extract_critical(full_css: &str, html: &str, budget: usize) -> CriticalCss {
    let parsed = parse_rules(full_css);
    if budget == 0 {
        return CriticalCss {
            malformed: parsed.malformed,
            dropped: parsed.rules.len(),
            ..CriticalCss::default()
        };
    }

    let html_lower = html.to_lowercase();
    let mut unused = 0;
    let mut candidates: Vec<(usize, i32, String)> = Vec::new();
    for rule in &parsed.rules {
        if rule_used(&rule.selector, html, &html_lower) {
            candidates.push((rule.order, score_rule(rule), rule.render()));
        } else {
            unused += 1;
        }
    }
    candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut total = 0;
    let mut chosen = Vec::new();
    for candidate in &candidates {
        if total + candidate.2.len() > budget {
            break;
        }
        total += candidate.2.len();
        chosen.push(candidate);
    }
    let kept = chosen.len();
    let dropped = candidates.len() - kept;
    chosen.sort_by_key(|c| c.0);

    let joined: String = chosen.iter().map(|c| c.2.as_str()).collect();
    let css = minify_css(&joined);
    debug!(
        "critical css: {} rules kept, {} over budget, {} unused, {} / {} bytes",
        kept,
        dropped,
        unused,
        css.len(),
        budget
    );

    CriticalCss {
        css,
        kept,
        dropped,
        unused,
        malformed: parsed.malformed,
    }
}

/// Split a stylesheet into rules. Never fails: problems are collected.
pub fn parse_rules(css: &str) -> ParsedCss {
    let stripped = strip_comments(css);
    let mut parsed = ParsedCss::default();
    let mut order = 0;
    parse_block(&stripped, 0, &[], &mut parsed, &mut order);
    parsed
}

fn parse_block(
    text: &str,
    base: usize,
    conditions: &[String],
    parsed: &mut ParsedCss,
    order: &mut usize,
) {
    let bytes = text.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        let Some((at, token)) = next_structural(bytes, pos) else {
            if !text[pos..].trim().is_empty() {
                parsed
                    .malformed
                    .push(ExtractionError::Unterminated { offset: base + pos });
            }
            break;
        };
        match token {
            b'}' => {
                parsed
                    .malformed
                    .push(ExtractionError::UnmatchedClose { offset: base + at });
                pos = at + 1;
            }
            b';' => {
                // Statement at-rules (@import, @charset) carry no style.
                if !text[pos..at].trim_start().starts_with('@') {
                    parsed
                        .malformed
                        .push(ExtractionError::StrayDeclaration { offset: base + pos });
                }
                pos = at + 1;
            }
            _ => {
                let prelude = text[pos..at].trim();
                let Some(close) = matching_close(bytes, at) else {
                    parsed
                        .malformed
                        .push(ExtractionError::Unterminated { offset: base + at });
                    break;
                };
                let body = &text[at + 1..close];
                if let Some(at_rule) = prelude.strip_prefix('@') {
                    let name = at_rule
                        .split(|c: char| c.is_whitespace() || c == '(')
                        .next()
                        .unwrap_or("")
                        .to_ascii_lowercase();
                    if name == "media" || name == "supports" {
                        let mut nested = conditions.to_vec();
                        nested.push(prelude.to_string());
                        parse_block(body, base + at + 1, &nested, parsed, order);
                    }
                } else if prelude.is_empty() {
                    parsed
                        .malformed
                        .push(ExtractionError::EmptySelector { offset: base + at });
                } else if body.contains('{') || !declarations_well_formed(body) {
                    parsed.malformed.push(ExtractionError::MalformedDeclarations {
                        selector: prelude.to_string(),
                    });
                } else {
                    parsed.rules.push(CssRule {
                        selector: prelude.to_string(),
                        declarations: body.trim().to_string(),
                        conditions: conditions.to_vec(),
                        order: *order,
                    });
                    *order += 1;
                }
                pos = close + 1;
            }
        }
    }
}

fn declarations_well_formed(body: &str) -> bool {
    body.split(';')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .all(|d| d.split_once(':').is_some_and(|(prop, _)| !prop.trim().is_empty()))
}

/// Next `{`, `}` or `;` outside a quoted string.
fn next_structural(bytes: &[u8], from: usize) -> Option<(usize, u8)> {
    let mut quote: Option<u8> = None;
    let mut i = from;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'{' | b'}' | b';' => return Some((i, b)),
                _ => {}
            },
        }
        i += 1;
    }
    None
}

/// Index of the `}` closing the `{` at `open`.
fn matching_close(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = open;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }
    None
}

/// Remove `/* … */` comments. An unterminated comment runs to the end.
pub fn strip_comments(css: &str) -> String {
    let mut out = String::with_capacity(css.len());
    let mut rest = css;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find("*/") {
            Some(end) => rest = &rest[start + 2 + end + 2..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Conservative CSS minifier: strips comments, collapses whitespace, drops
/// whitespace next to `{ } ; , >` and the last `;` of each block. Quoted
/// strings are left alone. The result is never longer than the input.
pub fn minify_css(css: &str) -> String {
    let stripped = strip_comments(css);
    let mut out = String::with_capacity(stripped.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut pending_space = false;

    for c in stripped.chars() {
        if let Some(q) = quote {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space {
            pending_space = false;
            if let Some(prev) = out.chars().last()
                && !is_tight(prev)
                && !is_tight(c)
            {
                out.push(' ');
            }
        }
        if c == '}' && out.ends_with(';') {
            out.pop();
        }
        if c == '"' || c == '\'' {
            quote = Some(c);
        }
        out.push(c);
    }
    out
}

fn is_tight(c: char) -> bool {
    matches!(c, '{' | '}' | ';' | ',' | '>')
}

// ============================================================================
// Selector analysis
// ============================================================================

/// Class, id and tag tokens of one compound selector.
#[derive(Debug, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    classes: Vec<String>,
    ids: Vec<String>,
    pseudo_classes: usize,
    pseudo_elements: usize,
    universal: bool,
}

/// Break a single selector (no commas) into compounds.
fn compounds(selector: &str) -> Vec<Compound> {
    let mut result = Vec::new();
    for part in selector
        .split(|c: char| c.is_whitespace() || c == '>' || c == '+' || c == '~')
        .filter(|p| !p.is_empty())
    {
        result.push(parse_compound(part));
    }
    result
}

fn parse_compound(part: &str) -> Compound {
    let mut compound = Compound::default();
    let chars: Vec<char> = part.chars().collect();
    let mut i = 0;
    let ident = |start: usize| -> (String, usize) {
        let mut end = start;
        while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '-' || chars[end] == '_') {
            end += 1;
        }
        (chars[start..end].iter().collect(), end)
    };
    while i < chars.len() {
        match chars[i] {
            '.' => {
                let (name, end) = ident(i + 1);
                if !name.is_empty() {
                    compound.classes.push(name);
                }
                i = end.max(i + 1);
            }
            '#' => {
                let (name, end) = ident(i + 1);
                if !name.is_empty() {
                    compound.ids.push(name);
                }
                i = end.max(i + 1);
            }
            '*' => {
                compound.universal = true;
                i += 1;
            }
            '[' => {
                while i < chars.len() && chars[i] != ']' {
                    i += 1;
                }
                i += 1;
            }
            ':' => {
                let element = chars.get(i + 1) == Some(&':');
                let start = if element { i + 2 } else { i + 1 };
                let (name, mut end) = ident(start);
                // :root is a structural anchor, not a state
                if !element && name == "root" {
                    compound.tag.get_or_insert_with(|| ":root".to_string());
                } else if element {
                    compound.pseudo_elements += 1;
                } else {
                    compound.pseudo_classes += 1;
                }
                if chars.get(end) == Some(&'(') {
                    let mut depth = 0;
                    while end < chars.len() {
                        match chars[end] {
                            '(' => depth += 1,
                            ')' => {
                                depth -= 1;
                                if depth == 0 {
                                    end += 1;
                                    break;
                                }
                            }
                            _ => {}
                        }
                        end += 1;
                    }
                }
                i = end.max(i + 1);
            }
            c if c.is_alphabetic() && i == 0 => {
                let (name, end) = ident(i);
                compound.tag = Some(name.to_ascii_lowercase());
                i = end;
            }
            _ => i += 1,
        }
    }
    compound
}

fn is_always_critical(compound: &Compound) -> bool {
    compound.classes.is_empty()
        && compound.ids.is_empty()
        && match &compound.tag {
            Some(tag) => ALWAYS_CRITICAL.contains(&tag.as_str()),
            None => compound.universal,
        }
}

/// Whether one selector's tokens all occur in the page.
pub fn selector_used(selector: &str, html: &str) -> bool {
    selector_used_lowered(selector, html, &html.to_lowercase())
}

fn selector_used_lowered(selector: &str, html: &str, html_lower: &str) -> bool {
    let parts = compounds(selector);
    if parts.is_empty() {
        return false;
    }
    parts.iter().all(|compound| {
        if is_always_critical(compound) {
            return true;
        }
        let tag_present = match &compound.tag {
            Some(tag) if tag == ":root" => true,
            Some(tag) => html_lower.contains(&format!("<{tag}")),
            None => true,
        };
        tag_present
            && compound.classes.iter().all(|c| html.contains(c.as_str()))
            && compound.ids.iter().all(|id| html.contains(id.as_str()))
    })
}

/// A comma-separated selector list is used when any member is.
fn rule_used(selector_list: &str, html: &str, html_lower: &str) -> bool {
    selector_list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .any(|s| selector_used_lowered(s, html, html_lower))
}

/// Priority of a single selector. Higher is more likely above the fold.
pub fn score_selector(selector: &str) -> i32 {
    let parts = compounds(selector);
    let mut score = 100;

    let structural = parts.iter().any(|c| {
        c.tag
            .as_deref()
            .is_some_and(|t| STRUCTURAL_TAGS.contains(&t) || t == ":root")
    });
    if structural {
        score += 50;
    }
    let layout = parts.iter().any(|c| {
        c.classes
            .iter()
            .chain(c.ids.iter())
            .any(|name| LAYOUT_NAMES.iter().any(|l| name.to_ascii_lowercase().contains(l)))
    });
    if layout {
        score += 30;
    }
    if parts.iter().any(|c| !c.ids.is_empty()) {
        score += 10;
    }

    let pseudo_classes: usize = parts.iter().map(|c| c.pseudo_classes).sum();
    let pseudo_elements: usize = parts.iter().map(|c| c.pseudo_elements).sum();
    score -= 20 * pseudo_classes as i32;
    score -= 30 * pseudo_elements as i32;

    let depth = parts.len().saturating_sub(1) as i32;
    score -= 10 * depth;
    if depth >= 3 {
        score -= 20;
    }
    score
}

/// Score of a whole rule: its best selector plus declaration and nesting
/// adjustments.
pub fn score_rule(rule: &CssRule) -> i32 {
    let best = rule
        .selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(score_selector)
        .max()
        .unwrap_or(0);

    let lower = rule.declarations.to_ascii_lowercase();
    let layout_props = lower
        .split(';')
        .filter_map(|d| d.split_once(':'))
        .filter(|(prop, _)| {
            let prop = prop.trim();
            LAYOUT_PROPERTIES
                .iter()
                .any(|p| prop == *p || prop.starts_with(&format!("{p}-")))
        })
        .count() as i32;

    best + (layout_props * 5).min(25) - 40 * rule.conditions.len() as i32
}
