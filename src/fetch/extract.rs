//! Landing-page link extraction.
//!
//! When a candidate URL answers with HTML instead of a document, a
//! [`ContentExtractor`] looks for the one link on that page that points at the
//! document itself. Extractors are pure: they read the page and return a URL,
//! nothing more.
//!
//! [`LandingPageExtractor`] tries, in order:
//! 1. `citation_pdf_url`, then `citation_xml_url` meta tags
//! 2. embedded JSON fields such as `"pdfUrl": "..."`
//! 3. `<meta http-equiv="refresh">` targets
//! 4. publisher URL templates keyed by the page's host
//! 5. interstitial pages carrying exactly one link

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;
use url::Url;

use crate::doi::Doi;

/// Finds a direct document link on an HTML landing page.
pub trait ContentExtractor: Send + Sync {
    /// Returns an absolute document URL found on the page, if any.
    fn extract(&self, html: &str, page_url: &Url, doi: &Doi) -> Option<String>;

    /// Returns whether the page looks like a sign-in or purchase wall.
    ///
    /// Only consulted when [`extract`](Self::extract) found nothing.
    fn is_access_wall(&self, _html: &str, _page_url: &Url) -> bool {
        false
    }
}

/// Compiles a regex at static init; panics on invalid pattern.
fn compile_static_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid static regex '{pattern}': {e}"))
}

static META_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?is)<meta\s+[^>]*>"));
static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"([a-zA-Z_:][-a-zA-Z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
});
static JSON_PDF_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#""(?:pdfUrl|pdfDownloadUrl|linkToPdf)"\s*:\s*"([^"]+)""#)
});
static REFRESH_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"(?i)url\s*=\s*['"]?([^'"]+?)['"]?\s*$"#)
});
static ANCHOR_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?is)<a\s[^>]*>"));

/// Meta tag names holding a direct document link, most preferred first.
const DOCUMENT_META_KEYS: [&str; 2] = ["citation_pdf_url", "citation_xml_url"];

/// Document URL templates by landing-page host. `{doi}` is replaced with the
/// path-encoded DOI.
const DEFAULT_URL_TEMPLATES: &[(&str, &[&str])] = &[
    (
        "link.springer.com",
        &[
            "https://link.springer.com/content/pdf/{doi}.pdf",
            "https://page-one.springer.com/pdf/preview/{doi}",
        ],
    ),
    (
        "www.magonlinelibrary.com",
        &["https://www.magonlinelibrary.com/doi/pdf/{doi}"],
    ),
    (
        "onlinelibrary.wiley.com",
        &[
            "https://onlinelibrary.wiley.com/doi/pdf/{doi}",
            "https://onlinelibrary.wiley.com/doi/pdfdirect/{doi}",
        ],
    ),
    ("www.tandfonline.com", &["https://www.tandfonline.com/doi/pdf/{doi}"]),
    (
        "www.worldscientific.com",
        &["https://www.worldscientific.com/doi/pdf/{doi}"],
    ),
    ("www.jstor.org", &["https://www.jstor.org/stable/pdf/{doi}.pdf"]),
    (
        "www.emerald.com",
        &["https://www.emerald.com/insight/content/doi/{doi}/full/pdf"],
    ),
];

/// URL path fragments of sign-in and single sign-on pages.
const LOGIN_PATH_PATTERNS: &[&str] = &[
    "/login",
    "/signin",
    "/sign-in",
    "/sso",
    "/cas/login",
    "/saml",
    "/idp/",
    "/user/login",
];

/// Phrases typical of paywall and institutional sign-in pages.
const ACCESS_WALL_MARKERS: &[&str] = &[
    "sign in",
    "log in",
    "institutional access",
    "access through your institution",
    "single sign-on",
    "shibboleth",
    "openathens",
    "purchase this article",
    "buy article",
    "rent this article",
    "get access",
];

/// Marker hits needed before a page counts as an access wall.
const ACCESS_WALL_THRESHOLD: usize = 3;

/// Default [`ContentExtractor`] for publisher landing pages.
#[derive(Debug, Clone)]
pub struct LandingPageExtractor {
    templates: HashMap<String, Vec<String>>,
}

impl Default for LandingPageExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl LandingPageExtractor {
    /// Creates an extractor with the built-in publisher templates.
    #[must_use]
    pub fn new() -> Self {
        let templates = DEFAULT_URL_TEMPLATES
            .iter()
            .map(|(host, urls)| {
                (
                    (*host).to_string(),
                    urls.iter().map(|url| (*url).to_string()).collect(),
                )
            })
            .collect();
        Self { templates }
    }

    /// Registers an extra URL template for pages served from `host`.
    #[must_use]
    pub fn with_template(mut self, host: &str, template: impl Into<String>) -> Self {
        self.templates
            .entry(host.to_ascii_lowercase())
            .or_default()
            .push(template.into());
        self
    }

    fn from_templates(&self, page_url: &Url, doi: &Doi) -> Option<String> {
        let host = page_url.host_str()?.to_ascii_lowercase();
        self.templates
            .get(&host)?
            .first()
            .map(|template| template.replace("{doi}", &doi.url_path()))
    }
}

impl ContentExtractor for LandingPageExtractor {
    fn extract(&self, html: &str, page_url: &Url, doi: &Doi) -> Option<String> {
        let meta_tags = collect_meta_tags(html);

        let strategies: [(&str, Option<String>); 5] = [
            ("meta", first_meta_value(&meta_tags, &DOCUMENT_META_KEYS)),
            ("json", extract_json_pdf_url(html)),
            ("refresh", extract_refresh_target(html)),
            ("template", self.from_templates(page_url, doi)),
            ("single_link", extract_single_link(html)),
        ];

        strategies.into_iter().find_map(|(strategy, value)| {
            let url = absolutize_url(&value?, page_url)?;
            if url == page_url.as_str() {
                return None;
            }
            debug!(strategy, url = %url, "found document link on landing page");
            Some(url)
        })
    }

    fn is_access_wall(&self, html: &str, page_url: &Url) -> bool {
        let path = page_url.path().to_ascii_lowercase();
        if LOGIN_PATH_PATTERNS
            .iter()
            .any(|pattern| path.contains(pattern))
        {
            return true;
        }

        let normalized = html.to_ascii_lowercase();
        let hits = ACCESS_WALL_MARKERS
            .iter()
            .filter(|marker| normalized.contains(**marker))
            .count();
        hits >= ACCESS_WALL_THRESHOLD
    }
}

// ==================== HTML helpers ====================

#[derive(Debug, Clone)]
struct MetaTag {
    name: String,
    http_equiv: String,
    content: String,
}

fn collect_meta_tags(html: &str) -> Vec<MetaTag> {
    META_TAG_RE
        .find_iter(html)
        .filter_map(|tag_match| {
            let attrs = tag_attributes(tag_match.as_str());
            let content = attrs.get("content")?.clone();
            Some(MetaTag {
                name: attrs
                    .get("name")
                    .or_else(|| attrs.get("property"))
                    .map(|name| name.to_ascii_lowercase())
                    .unwrap_or_default(),
                http_equiv: attrs
                    .get("http-equiv")
                    .map(|value| value.to_ascii_lowercase())
                    .unwrap_or_default(),
                content,
            })
        })
        .collect()
}

/// Lowercased attribute names to trimmed values; first occurrence wins.
fn tag_attributes(tag: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    for captures in ATTR_RE.captures_iter(tag) {
        let key = captures
            .get(1)
            .map_or("", |m| m.as_str())
            .to_ascii_lowercase();
        let value = captures
            .get(2)
            .or_else(|| captures.get(3))
            .or_else(|| captures.get(4))
            .map_or("", |m| m.as_str())
            .trim()
            .to_string();
        attrs.entry(key).or_insert(value);
    }
    attrs
}

fn first_meta_value(meta_tags: &[MetaTag], keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        meta_tags
            .iter()
            .filter(|tag| tag.name == *key)
            .map(|tag| html_unescape_basic(&tag.content))
            .find(|value| !value.is_empty())
    })
}

fn extract_json_pdf_url(html: &str) -> Option<String> {
    JSON_PDF_URL_RE
        .captures(html)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().replace(r"\u002F", "/").replace(r"\/", "/"))
}

fn extract_refresh_target(html: &str) -> Option<String> {
    collect_meta_tags(html)
        .iter()
        .filter(|tag| tag.http_equiv == "refresh")
        .find_map(|tag| {
            REFRESH_URL_RE
                .captures(tag.content.trim())
                .and_then(|captures| captures.get(1))
                .map(|m| html_unescape_basic(m.as_str()))
        })
        .filter(|target| !target.is_empty())
}

fn extract_single_link(html: &str) -> Option<String> {
    let mut links: Vec<String> = Vec::new();
    for anchor in ANCHOR_RE.find_iter(html) {
        let Some(href) = tag_attributes(anchor.as_str()).remove("href") else {
            continue;
        };
        let href = html_unescape_basic(&href);
        let lowered = href.to_ascii_lowercase();
        if href.is_empty()
            || href.starts_with('#')
            || lowered.starts_with("javascript:")
            || lowered.starts_with("mailto:")
        {
            continue;
        }
        if !links.contains(&href) {
            links.push(href);
        }
    }
    if links.len() == 1 { links.pop() } else { None }
}

/// Resolves a possibly relative link against the page URL. Only http(s)
/// results are returned.
fn absolutize_url(value: &str, page_url: &Url) -> Option<String> {
    let joined = page_url.join(value.trim()).ok()?;
    matches!(joined.scheme(), "http" | "https").then(|| joined.to_string())
}

fn html_unescape_basic(value: &str) -> String {
    value
        .replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x2F;", "/")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .trim()
        .to_string()
}
