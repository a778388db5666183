//! Click-through URL extraction and normalization
//!
//! Candidates are gathered with a fixed precedence: the well-known anchor ids
//! first, then embedded metadata blobs and the `adData` global, then a generic
//! anchor scan. Every candidate is normalized (redirectors unwrapped, tracking
//! parameters stripped) and ad-serving infrastructure hosts are dropped. The
//! first surviving candidate is the primary click URL.

use crate::{CaptureError, CreativePage};
use regex::Regex;
use std::sync::OnceLock;
use url::Url;

/// Anchor ids used by the portal's creative templates for the landing link.
pub const WELL_KNOWN_ANCHORS: [&str; 3] = ["#image-anchor", "#header", "#visurl"];

const TRACKING_PARAMS: [&str; 8] = [
    "gclid", "dclid", "gclsrc", "fbclid", "mc_eid", "mc_cid", "_hsenc", "_hsmi",
];

const INFRASTRUCTURE_DOMAINS: [&str; 5] = [
    "google.com",
    "doubleclick.net",
    "tpc.googlesyndication.com",
    "pagead2.googlesyndication.com",
    "googleadservices.com",
];

const AD_DATA_FIELDS: [&str; 3] = ["redirect_url", "destination_url", "google_click_url"];

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{domain}"))
}

fn parse_lenient(raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if let Some(rest) = raw.strip_prefix("//") {
        return Url::parse(&format!("https://{rest}")).ok();
    }
    match Url::parse(raw) {
        Ok(url) => Some(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let host = raw.split('/').next().unwrap_or_default();
            if host.contains('.') && !host.contains(' ') {
                Url::parse(&format!("https://{raw}")).ok()
            } else {
                None
            }
        }
        Err(_) => None,
    }
}

/// Normalize a raw click candidate.
///
/// Returns `None` for anything that is not a usable destination: non-web
/// schemes, help pages, creative asset hosts, and redirector links without a
/// target.
pub fn normalize_click_url(raw: &str) -> Option<String> {
    if raw.trim().is_empty() {
        return None;
    }
    let mut url = parse_lenient(raw)?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    let host = url.host_str()?.to_ascii_lowercase();
    let path = url.path().to_ascii_lowercase();

    if host_matches(&host, "support.google.com") || host_matches(&host, "pagead2.googlesyndication.com") {
        return None;
    }
    if host_matches(&host, "tpc.googlesyndication.com")
        && (path.starts_with("/simgad") || path.contains("discover_ads"))
    {
        return None;
    }

    let redirector = host_matches(&host, "googleadservices.com")
        || (host_matches(&host, "googleads.g.doubleclick.net") && path.contains("pagead/conversion"));
    if redirector {
        let target = url
            .query_pairs()
            .find(|(k, v)| k == "adurl" && !v.is_empty())
            .map(|(_, v)| v.into_owned())?;
        return normalize_click_url(&target);
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAMS.contains(&k.as_ref()) && !k.starts_with("utm_"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    Some(url.to_string())
}

/// Ad-serving and portal hosts that are never a landing page.
pub fn is_infrastructure_host(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    INFRASTRUCTURE_DOMAINS.iter().any(|d| host_matches(&host, d))
}

pub fn select_primary_click_url(candidates: &[String]) -> Option<String> {
    candidates.iter().find(|c| !c.is_empty()).cloned()
}

/// Ordered, de-duplicated set of normalized destinations.
#[derive(Debug, Default, Clone)]
pub struct ClickCandidates {
    urls: Vec<String>,
}

impl ClickCandidates {
    pub fn add(&mut self, raw: &str) {
        if let Some(norm) = normalize_click_url(raw) {
            if !is_infrastructure_host(&norm) && !self.urls.contains(&norm) {
                self.urls.push(norm);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.urls
    }
}

/// Extract click-through candidates from a document, optionally scoped to the
/// subtree under `root`.
pub async fn collect_click_urls(
    page: &dyn CreativePage,
    root: Option<&str>,
) -> Result<Vec<String>, CaptureError> {
    let scoped = |sel: &str| match root {
        Some(root) => format!("{root} {sel}"),
        None => sel.to_string(),
    };
    let mut found = ClickCandidates::default();

    for anchor in WELL_KNOWN_ANCHORS {
        if let Some(href) = page.attribute(&scoped(anchor), "href").await? {
            found.add(&href);
        }
    }
    if !found.is_empty() {
        return Ok(found.into_vec());
    }

    for blob in page.attributes(&scoped("meta[data-asoch-meta]"), "data-asoch-meta").await? {
        for url in urls_in_meta_blob(&blob) {
            found.add(&url);
        }
    }
    if let Some(serde_json::Value::Object(ad_data)) = page.global_json("adData").await? {
        for field in AD_DATA_FIELDS {
            if let Some(serde_json::Value::String(url)) = ad_data.get(field) {
                found.add(url);
            }
        }
    }
    if !found.is_empty() {
        return Ok(found.into_vec());
    }

    for href in page.attributes(&scoped("a[href]"), "href").await? {
        found.add(&href);
    }
    Ok(found.into_vec())
}

/// Every http(s) URL embedded in a `data-asoch-meta` payload, in order.
pub fn urls_in_meta_blob(raw: &str) -> Vec<String> {
    let decoded = unescape_html(raw);
    let mut out = Vec::new();

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&decoded) {
        walk_json_strings(&value, &mut out);
    }
    for url in scan_urls(&decoded) {
        if !out.contains(&url) {
            out.push(url);
        }
    }
    out
}

fn walk_json_strings(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) if s.starts_with("http") => {
            if !out.contains(s) {
                out.push(s.clone());
            }
        }
        serde_json::Value::String(s) => {
            for url in scan_urls(s) {
                if !out.contains(&url) {
                    out.push(url);
                }
            }
        }
        serde_json::Value::Array(items) => items.iter().for_each(|v| walk_json_strings(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| walk_json_strings(v, out)),
        _ => {}
    }
}

fn regex(pattern: &'static str, desc: &'static str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|err| panic!("invalid {desc} regex: {err}"))
}

/// `http://` / `https://` runs in free text, ending at whitespace or quotes.
fn scan_urls(text: &str) -> Vec<String> {
    static HTTP_URL: OnceLock<Regex> = OnceLock::new();
    let http_url = HTTP_URL.get_or_init(|| regex(r#"https?://[^\s"'<>\\]+"#, "http url"));

    http_url.find_iter(text).map(|m| m.as_str().to_string()).collect()
}

fn unescape_html(raw: &str) -> String {
    static ENTITY: OnceLock<Regex> = OnceLock::new();
    let entity = ENTITY.get_or_init(|| regex("&(quot|#34|#39|apos|lt|gt|amp);", "html entity"));

    entity
        .replace_all(raw, |caps: &regex::Captures<'_>| match &caps[1] {
            "quot" | "#34" => "\"",
            "#39" | "apos" => "'",
            "lt" => "<",
            "gt" => ">",
            _ => "&",
        })
        .into_owned()
}

/// `(owner_id, item_id)` from a creative URL of the form
/// `.../advertiser/AR<digits>/creative/CR<digits>`.
pub fn parse_ids_from_url(url: &str) -> Option<(String, String)> {
    static CREATIVE_PATH: OnceLock<Regex> = OnceLock::new();
    let creative_path = CREATIVE_PATH.get_or_init(|| {
        regex(r"/advertiser/(AR\d+)/creative/(CR\d+)(?:/|$)", "creative path")
    });

    let parsed = Url::parse(url).ok()?;
    let caps = creative_path.captures(parsed.path())?;
    Some((caps[1].to_string(), caps[2].to_string()))
}
