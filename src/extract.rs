//! HTML → safe Markdown / plain text.
//!
//! Pipeline: take the `<title>`, prune navigation and other chrome, pick the
//! main content container, sanitize it against a fixed tag/attribute/scheme
//! allowlist, convert to Markdown, then derive plain text from the Markdown.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use ammonia::UrlRelative;
use htmd::HtmlToMarkdown;
use htmd::options::{CodeBlockStyle, HeadingStyle, Options};
use regex::Regex;
use scraper::{Html, Selector};
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Extracted {
    pub title: Option<String>,
    pub markdown: String,
    pub text: String,
}

/// Regions that are never content.
const NOISE_SELECTORS: &[&str] = &[
    "nav",
    "header",
    "footer",
    "aside",
    "[role=navigation]",
    "[role=banner]",
    "[role=contentinfo]",
    "[role=complementary]",
    "[class*=sidebar]",
    "[id*=sidebar]",
    "[class~=ad]",
    "[class~=ads]",
    "[class*=advert]",
    "[id*=advert]",
    "[class*=ad-slot]",
    "[class*=cookie]",
    "[id*=cookie]",
    "[class*=consent]",
    "[id*=consent]",
    "[class*=comments]",
    "[id*=comments]",
    "[class*=breadcrumb]",
];

/// Main-content containers, most specific first.
const MAIN_SELECTORS: &[&str] = &[
    "main",
    "article",
    "[role=main]",
    "#content",
    "#main-content",
    "#main",
    ".content",
    ".post-content",
    ".entry-content",
    ".article-body",
];

/// Elements that survive pruning even when a noise heuristic matches them.
const PROTECTED_ELEMENTS: &[&str] = &["html", "body", "main", "article"];

const ALLOWED_TAGS: &[&str] = &[
    "h1", "h2", "h3", "h4", "h5", "h6", "p", "br", "hr", "div", "span", "section", "ul", "ol",
    "li", "b", "strong", "i", "em", "u", "s", "del", "ins", "mark", "small", "sub", "sup", "a",
    "img", "code", "pre", "kbd", "samp", "table", "thead", "tbody", "tfoot", "tr", "th", "td",
    "caption", "blockquote", "q", "cite", "dl", "dt", "dd", "figure", "figcaption", "abbr",
    "time",
];

/// Tags removed together with everything inside them.
const DROPPED_TAGS: &[&str] = &[
    "script", "style", "iframe", "object", "embed", "noscript", "template", "svg", "math", "form",
    "button", "select", "textarea", "canvas", "audio", "video",
];

const URL_SCHEMES: &[&str] = &["http", "https", "mailto"];

static NOISE: LazyLock<Vec<Selector>> = LazyLock::new(|| compile(NOISE_SELECTORS));
static MAIN: LazyLock<Vec<Selector>> = LazyLock::new(|| compile(MAIN_SELECTORS));
static TITLE: LazyLock<Vec<Selector>> = LazyLock::new(|| compile(&["title"]));
static BODY: LazyLock<Vec<Selector>> = LazyLock::new(|| compile(&["body"]));

fn compile(selectors: &[&str]) -> Vec<Selector> {
    selectors
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .collect()
}

/// Run the whole pipeline.  `base` is the page URL, used to absolutize
/// relative links; without it relative links are dropped.
pub fn extract(html: &str, base: Option<&Url>) -> Extracted {
    let mut doc = Html::parse_document(html);
    let title = extract_title(&doc);

    strip_noise(&mut doc);
    let fragment = select_main(&doc);
    let clean = sanitize(&fragment, base);

    let markdown = scrub(&to_markdown(&clean));
    let text = scrub(&markdown_to_text(&markdown));
    debug!(
        title = title.as_deref().unwrap_or(""),
        markdown_chars = markdown.chars().count(),
        "extracted HTML content"
    );

    Extracted {
        title,
        markdown,
        text,
    }
}

fn extract_title(doc: &Html) -> Option<String> {
    let el = TITLE.first().and_then(|sel| doc.select(sel).next())?;
    let title = el.text().collect::<String>();
    let title = title.trim();
    (!title.is_empty()).then(|| title.to_string())
}

fn strip_noise(doc: &mut Html) {
    let mut ids = Vec::new();
    for sel in NOISE.iter() {
        for el in doc.select(sel) {
            if !PROTECTED_ELEMENTS.contains(&el.value().name()) {
                ids.push(el.id());
            }
        }
    }

    for id in ids {
        if let Some(mut node) = doc.tree.get_mut(id) {
            node.detach();
        }
    }
}

fn select_main(doc: &Html) -> String {
    for sel in MAIN.iter() {
        if let Some(el) = doc.select(sel).next() {
            if el.text().any(|t| !t.trim().is_empty()) {
                return el.html();
            }
        }
    }
    BODY.first()
        .and_then(|sel| doc.select(sel).next())
        .map(|body| body.inner_html())
        .unwrap_or_else(|| doc.root_element().html())
}

/// Reduce a fragment to the allowlisted tags, attributes and URL schemes.
pub fn sanitize(fragment: &str, base: Option<&Url>) -> String {
    let tag_attributes: HashMap<&str, HashSet<&str>> = [
        ("a", ["href", "title"].as_slice()),
        ("img", ["src", "alt", "title", "width", "height"].as_slice()),
        ("td", ["colspan", "rowspan"].as_slice()),
        ("th", ["colspan", "rowspan"].as_slice()),
        ("ol", ["start"].as_slice()),
        ("code", ["class"].as_slice()),
        ("pre", ["class"].as_slice()),
    ]
    .into_iter()
    .map(|(tag, attrs)| (tag, attrs.iter().copied().collect()))
    .collect();

    let url_relative = match base {
        Some(base) => UrlRelative::RewriteWithBase(base.clone()),
        None => UrlRelative::Deny,
    };

    let mut builder = ammonia::Builder::default();
    builder
        .tags(ALLOWED_TAGS.iter().copied().collect())
        .clean_content_tags(DROPPED_TAGS.iter().copied().collect())
        .generic_attributes(["title", "lang"].into_iter().collect())
        .tag_attributes(tag_attributes)
        .url_schemes(URL_SCHEMES.iter().copied().collect())
        .url_relative(url_relative)
        .link_rel(None)
        .strip_comments(true)
        .attribute_filter(|element, attribute, value| {
            // mailto is for links only.
            if element == "img"
                && attribute == "src"
                && value.trim_start().to_ascii_lowercase().starts_with("mailto:")
            {
                return None;
            }
            Some(value.into())
        });
    builder.clean(fragment).to_string()
}

fn to_markdown(html: &str) -> String {
    let converter = HtmlToMarkdown::builder()
        .options(Options {
            heading_style: HeadingStyle::Atx,
            code_block_style: CodeBlockStyle::Fenced,
            ..Default::default()
        })
        .skip_tags(vec!["script", "style"])
        .build();
    match converter.convert(html) {
        Ok(md) => md.trim().to_string(),
        Err(e) => {
            warn!(error = %e, "markdown conversion failed");
            String::new()
        }
    }
}

static RE_FENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[ \t]*(```|~~~).*$").unwrap());
static RE_IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[([^\]]*)\]\([^)]*\)").unwrap());
static RE_LINK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap());
static RE_HR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*([-*_][ \t]*){3,}$").unwrap());
static RE_HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#{1,6}[ \t]+").unwrap());
static RE_BOLD_STAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*(.+?)\*\*").unwrap());
static RE_BOLD_UNDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"__(.+?)__").unwrap());
static RE_ITALIC_STAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*([^*\n]+)\*").unwrap());
static RE_ITALIC_UNDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b_([^_\n]+)_\b").unwrap());
static RE_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`+").unwrap());
static RE_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\([\\`*_{}\[\]()#+\-.!>])").unwrap());
static RE_BLANK_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[ \t]+$").unwrap());
static RE_BLANK_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Strip Markdown syntax, keeping link and alt text.
pub fn markdown_to_text(markdown: &str) -> String {
    let s = RE_FENCE.replace_all(markdown, "");
    let s = RE_IMAGE.replace_all(&s, "$1");
    let s = RE_LINK.replace_all(&s, "$1");
    let s = RE_HR.replace_all(&s, "");
    let s = RE_HEADING.replace_all(&s, "");
    let s = RE_BOLD_STAR.replace_all(&s, "$1");
    let s = RE_BOLD_UNDER.replace_all(&s, "$1");
    let s = RE_ITALIC_STAR.replace_all(&s, "$1");
    let s = RE_ITALIC_UNDER.replace_all(&s, "$1");
    let s = RE_CODE.replace_all(&s, "");
    let s = RE_ESCAPE.replace_all(&s, "$1");
    let s = RE_BLANK_LINE.replace_all(&s, "");
    let s = RE_BLANK_RUN.replace_all(&s, "\n\n");
    s.trim().to_string()
}

static RE_ACTIVE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<(/?)(script|iframe|object|embed)").unwrap());
static RE_JS_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(java|vb)script\s*:").unwrap());
static RE_EVENT_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(on[a-z]{3,})\s*=").unwrap());

/// Neutralize markup that reappears from escaped text, e.g. `&lt;script&gt;`.
fn scrub(s: &str) -> String {
    let s = RE_ACTIVE_TAG.replace_all(s, "&lt;$1$2");
    let s = RE_JS_SCHEME.replace_all(&s, "${1}script&#58;");
    let s = RE_EVENT_ATTR.replace_all(&s, "$1&#61;");
    s.into_owned()
}
