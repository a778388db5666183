use crate::CaptureError;
use std::time::Duration;
use url::Url;

/// File-system safe form of an id used in debug artifact names.
pub fn sanitize_filename(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Parse `url` and require an http(s) scheme.
pub fn validate_url(url: &str) -> Result<Url, CaptureError> {
    let parsed = Url::parse(url).map_err(|e| CaptureError::Network(format!("{url}: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(CaptureError::Network(format!("{url}: unsupported scheme {other}"))),
    }
}

/// `raw` resolved against `base`; `None` when neither parses.
pub fn join_url(base: &str, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(absolute) = Url::parse(raw) {
        return Some(absolute.to_string());
    }
    Url::parse(base).ok()?.join(raw).ok().map(|u| u.to_string())
}

/// A frame or image source that can actually be loaded.
pub fn is_meaningful_src(src: &str) -> bool {
    let src = src.trim().to_ascii_lowercase();
    !(src.is_empty() || src == "about:blank" || src.starts_with("data:"))
}
