//! HTML content transforms.
//!
//! Each transform is a pure `html -> html` rewrite behind [`ContentTransform`]
//! so the pipeline can apply them to templates without knowing what they do.
//! All of them are idempotent: running one twice gives the same markup as
//! running it once, so a retried stage never double-applies.
//!
//! Rewrites are tag-level regex heuristics, not an HTML parser. Markup inside
//! comments or `<script>` bodies that happens to look like a tag is rewritten
//! too.

use regex::{Captures, Regex};
use std::sync::LazyLock;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("{transform}: document has no {element} element")]
    MissingElement {
        transform: &'static str,
        element: &'static str,
    },
    #[error("{transform}: {reason}")]
    Failed {
        transform: &'static str,
        reason: String,
    },
}

/// A rewrite of a whole HTML document.
pub trait ContentTransform: Send + Sync {
    fn name(&self) -> &'static str;
    fn transform(&self, html: &str) -> Result<String, TransformError>;
}

static IMG_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<img\b[^>]*>").unwrap());
static SCRIPT_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b([^>]*)>").unwrap());
static STYLESHEET_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<link\b[^>]*>").unwrap());
static FONT_FACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)@font-face\s*\{([^}]*)\}").unwrap());
static HEAD_CLOSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)</head\s*>").unwrap());
static BODY_CLOSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)</body\s*>").unwrap());

static TAG_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)[\s/]([A-Za-z_:][-A-Za-z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+)))?"#)
        .unwrap()
});

/// Attributes of a tag as `(name, value)`, value `""` when absent.
fn attrs(tag: &str) -> impl Iterator<Item = (&str, &str)> {
    TAG_ATTR.captures_iter(tag).filter_map(|caps| {
        let name = caps.get(1)?.as_str();
        let value = caps
            .get(2)
            .or_else(|| caps.get(3))
            .or_else(|| caps.get(4))
            .map_or("", |m| m.as_str());
        Some((name, value))
    })
}

/// True when a tag carries `name` as an attribute (with or without value).
fn has_attr(tag: &str, name: &str) -> bool {
    attrs(tag).any(|(n, _)| n.eq_ignore_ascii_case(name))
}

/// Value of an attribute, without quotes.
fn attr_value<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    attrs(tag)
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

/// Insert ` attrs` before the tag's closing `>` or `/>`.
fn add_attrs(tag: &str, attrs: &str) -> String {
    let body = tag.trim_end_matches('>');
    let (body, close) = match body.strip_suffix('/') {
        Some(b) => (b.trim_end(), " />"),
        None => (body.trim_end(), ">"),
    };
    format!("{body} {attrs}{close}")
}

fn insert_before(
    html: &str,
    marker: &Regex,
    insertion: &str,
    transform: &'static str,
    element: &'static str,
) -> Result<String, TransformError> {
    let found = marker
        .find(html)
        .ok_or(TransformError::MissingElement { transform, element })?;
    let mut out = String::with_capacity(html.len() + insertion.len());
    out.push_str(&html[..found.start()]);
    out.push_str(insertion);
    out.push_str(&html[found.start()..]);
    Ok(out)
}

/// `loading="lazy" decoding="async"` on every `<img>` after the first
/// `skip_first`, which are assumed to be above the fold.
#[derive(Debug, Clone, Copy)]
pub struct LazyImages {
    pub skip_first: usize,
}

impl Default for LazyImages {
    fn default() -> Self {
        Self { skip_first: 1 }
    }
}

impl ContentTransform for LazyImages {
    fn name(&self) -> &'static str {
        "lazy-images"
    }

    fn transform(&self, html: &str) -> Result<String, TransformError> {
        let mut index = 0;
        let out = IMG_TAG.replace_all(html, |caps: &Captures| {
            let tag = &caps[0];
            index += 1;
            if index <= self.skip_first || has_attr(tag, "loading") {
                return tag.to_string();
            }
            if has_attr(tag, "decoding") {
                add_attrs(tag, r#"loading="lazy""#)
            } else {
                add_attrs(tag, r#"loading="lazy" decoding="async""#)
            }
        });
        Ok(out.into_owned())
    }
}

/// `defer` on external scripts that load synchronously.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeferScripts;

impl ContentTransform for DeferScripts {
    fn name(&self) -> &'static str {
        "defer-scripts"
    }

    fn transform(&self, html: &str) -> Result<String, TransformError> {
        let out = SCRIPT_OPEN.replace_all(html, |caps: &Captures| {
            let tag = &caps[0];
            let is_module = attr_value(tag, "type").is_some_and(|t| t.eq_ignore_ascii_case("module"));
            if !has_attr(tag, "src") || has_attr(tag, "async") || has_attr(tag, "defer") || is_module {
                return tag.to_string();
            }
            add_attrs(tag, "defer")
        });
        Ok(out.into_owned())
    }
}

/// `font-display: swap` in inline `@font-face` rules that don't set one.
#[derive(Debug, Clone, Copy, Default)]
pub struct FontDisplaySwap;

impl ContentTransform for FontDisplaySwap {
    fn name(&self) -> &'static str {
        "font-display-swap"
    }

    fn transform(&self, html: &str) -> Result<String, TransformError> {
        let out = FONT_FACE.replace_all(html, |caps: &Captures| {
            let body = &caps[1];
            if body.to_ascii_lowercase().contains("font-display") {
                return caps[0].to_string();
            }
            format!("@font-face{{font-display:swap;{}}}", body.trim_start())
        });
        Ok(out.into_owned())
    }
}

/// Inline a page's critical CSS at the end of `<head>`.
#[derive(Debug, Clone, Default)]
pub struct InlineCriticalCss {
    pub css: String,
}

const CRITICAL_STYLE_MARKER: &str = "data-critical";

impl ContentTransform for InlineCriticalCss {
    fn name(&self) -> &'static str {
        "inline-critical-css"
    }

    fn transform(&self, html: &str) -> Result<String, TransformError> {
        if self.css.is_empty() || html.contains(CRITICAL_STYLE_MARKER) {
            return Ok(html.to_string());
        }
        if self.css.to_ascii_lowercase().contains("</style") {
            return Err(TransformError::Failed {
                transform: self.name(),
                reason: "critical CSS contains a closing style tag".into(),
            });
        }
        let style = format!("<style {CRITICAL_STYLE_MARKER}>{}</style>\n", self.css);
        insert_before(html, &HEAD_CLOSE, &style, self.name(), "</head>")
    }
}

/// Turn blocking stylesheet links into print-media links that switch to
/// `all` once loaded, with a `<noscript>` fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsyncStylesheets;

const NOSCRIPT_OPEN: &str = "<noscript>";

impl ContentTransform for AsyncStylesheets {
    fn name(&self) -> &'static str {
        "async-stylesheets"
    }

    fn transform(&self, html: &str) -> Result<String, TransformError> {
        let out = STYLESHEET_LINK.replace_all(html, |caps: &Captures| {
            let whole = caps.get(0).map_or(0..0, |m| m.range());
            let tag = &html[whole.clone()];
            let is_stylesheet = attr_value(tag, "rel").is_some_and(|r| r.eq_ignore_ascii_case("stylesheet"));
            // our own fallback from a previous pass
            let in_noscript = html
                .get(whole.start.saturating_sub(NOSCRIPT_OPEN.len())..whole.start)
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(NOSCRIPT_OPEN));
            if !is_stylesheet || in_noscript || has_attr(tag, "media") || has_attr(tag, "onload") {
                return tag.to_string();
            }
            format!(
                "{}<noscript>{tag}</noscript>",
                add_attrs(tag, r#"media="print" onload="this.media='all'""#)
            )
        });
        Ok(out.into_owned())
    }
}

/// Reference bundle files from a page: stylesheets load asynchronously at
/// the end of `<head>`, scripts are deferred at the end of `<body>`.
#[derive(Debug, Clone, Default)]
pub struct InjectBundles {
    pub stylesheets: Vec<String>,
    pub scripts: Vec<String>,
}

impl ContentTransform for InjectBundles {
    fn name(&self) -> &'static str {
        "inject-bundles"
    }

    fn transform(&self, html: &str) -> Result<String, TransformError> {
        let mut out = html.to_string();

        let links: String = self
            .stylesheets
            .iter()
            .filter(|href| !out.contains(&format!("href=\"{href}\"")))
            .map(|href| {
                format!(
                    "<link rel=\"stylesheet\" href=\"{href}\" media=\"print\" onload=\"this.media='all'\">\n"
                )
            })
            .collect();
        if !links.is_empty() {
            out = insert_before(&out, &HEAD_CLOSE, &links, self.name(), "</head>")?;
        }

        let scripts: String = self
            .scripts
            .iter()
            .filter(|src| !out.contains(&format!("src=\"{src}\"")))
            .map(|src| format!("<script src=\"{src}\" defer></script>\n"))
            .collect();
        if !scripts.is_empty() {
            out = insert_before(&out, &BODY_CLOSE, &scripts, self.name(), "</body>")?;
        }
        Ok(out)
    }
}

/// Apply transforms in order, stopping at the first error.
pub fn apply_all(
    transforms: &[&dyn ContentTransform],
    html: &str,
) -> Result<String, TransformError> {
    let mut current = html.to_string();
    for transform in transforms {
        current = transform.transform(&current)?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head><title>t</title><link rel="stylesheet" href="/css/site.css"></head>
<body><img src="hero.png" alt="hero"><img src="a.png"><img src="b.png" loading="eager"/>
<script src="/js/app.js"></script><script type="module" src="/js/m.js"></script><script>inline()</script>
</body></html>"#;

    fn assert_idempotent(t: &dyn ContentTransform, html: &str) {
        let once = t.transform(html).unwrap();
        let twice = t.transform(&once).unwrap();
        assert_eq!(once, twice, "{} is not idempotent", t.name());
    }

    #[test]
    fn lazy_images_skips_first_and_explicit_loading() {
        let out = LazyImages { skip_first: 1 }.transform(PAGE).unwrap();
        assert!(out.contains(r#"<img src="hero.png" alt="hero">"#));
        assert!(out.contains(r#"<img src="a.png" loading="lazy" decoding="async">"#));
        assert!(out.contains(r#"<img src="b.png" loading="eager"/>"#));
        assert_idempotent(&LazyImages { skip_first: 1 }, PAGE);
    }

    #[test]
    fn lazy_images_handles_self_closing() {
        let out = LazyImages { skip_first: 0 }
            .transform(r#"<img src="x.png" decoding="sync" />"#)
            .unwrap();
        assert_eq!(out, r#"<img src="x.png" decoding="sync" loading="lazy" />"#);
    }

    #[test]
    fn defer_scripts_only_touches_blocking_external_scripts() {
        let out = DeferScripts.transform(PAGE).unwrap();
        assert!(out.contains(r#"<script src="/js/app.js" defer></script>"#));
        assert!(out.contains(r#"<script type="module" src="/js/m.js"></script>"#));
        assert!(out.contains("<script>inline()</script>"));
        assert_idempotent(&DeferScripts, PAGE);
    }

    #[test]
    fn defer_scripts_respects_async() {
        let html = r#"<script async src="a.js"></script>"#;
        assert_eq!(DeferScripts.transform(html).unwrap(), html);
    }

    #[test]
    fn font_display_added_once() {
        let html = "<style>@font-face { font-family: X; src: url(x.woff2); }</style>";
        let out = FontDisplaySwap.transform(html).unwrap();
        assert!(out.contains("@font-face{font-display:swap;font-family: X;"));
        assert_idempotent(&FontDisplaySwap, html);

        let explicit = "<style>@font-face{font-display:optional;font-family:Y}</style>";
        assert_eq!(FontDisplaySwap.transform(explicit).unwrap(), explicit);
    }

    #[test]
    fn inline_critical_css_goes_into_head() {
        let t = InlineCriticalCss {
            css: "body{margin:0}".into(),
        };
        let out = t.transform(PAGE).unwrap();
        assert!(out.contains("<style data-critical>body{margin:0}</style>\n</head>"));
        assert_idempotent(&t, PAGE);
    }

    #[test]
    fn inline_critical_css_without_head_fails() {
        let t = InlineCriticalCss { css: "a{}".into() };
        let err = t.transform("<p>fragment</p>").unwrap_err();
        assert!(matches!(err, TransformError::MissingElement { element: "</head>", .. }));
    }

    #[test]
    fn inline_critical_css_empty_is_noop() {
        let t = InlineCriticalCss::default();
        assert_eq!(t.transform("<p>fragment</p>").unwrap(), "<p>fragment</p>");
    }

    #[test]
    fn async_stylesheets_swap_media() {
        let out = AsyncStylesheets.transform(PAGE).unwrap();
        assert!(out.contains(
            r#"<link rel="stylesheet" href="/css/site.css" media="print" onload="this.media='all'"><noscript><link rel="stylesheet" href="/css/site.css"></noscript>"#
        ));
        assert_idempotent(&AsyncStylesheets, PAGE);
    }

    #[test]
    fn inject_bundles_adds_links_and_scripts_once() {
        let t = InjectBundles {
            stylesheets: vec!["/bundles/extended-css.css".into()],
            scripts: vec!["/bundles/app-js.js".into()],
        };
        let out = t.transform(PAGE).unwrap();
        assert!(out.contains(r#"<link rel="stylesheet" href="/bundles/extended-css.css" media="print""#));
        assert!(out.contains("<script src=\"/bundles/app-js.js\" defer></script>\n</body>"));
        assert_idempotent(&t, PAGE);
    }

    #[test]
    fn apply_all_chains_in_order() {
        let css = InlineCriticalCss { css: "a{b:c}".into() };
        let out = apply_all(&[&DeferScripts, &css], PAGE).unwrap();
        assert!(out.contains("defer"));
        assert!(out.contains("data-critical"));
    }

    #[test]
    fn attribute_helpers() {
        let tag = r#"<link rel='preload' as=font href=/f.woff2 crossorigin>"#;
        assert_eq!(attr_value(tag, "rel"), Some("preload"));
        assert_eq!(attr_value(tag, "as"), Some("font"));
        assert!(has_attr(tag, "crossorigin"));
        assert!(!has_attr(tag, "cross"));
        assert!(!has_attr(tag, "media"));

        // words inside a quoted value are not attributes
        let img = r#"<img alt="lazy loading demo" src=a.png>"#;
        assert!(!has_attr(img, "loading"));
        assert_eq!(attr_value(img, "alt"), Some("lazy loading demo"));
        assert_eq!(attr_value(img, "src"), Some("a.png"));
    }
}
