/// Utility functions and helpers

/// Characters that may not appear in a path segment on common filesystems
const INVALID_FILENAME_CHARS: [char; 9] = ['<', '>', ':', '"', '|', '?', '*', '/', '\\'];

/// Format duration in human readable format
pub fn format_duration(duration: std::time::Duration) -> String {
    let total_seconds = duration.as_secs();

    if total_seconds < 60 {
        format!("{}s", total_seconds)
    } else if total_seconds < 3600 {
        let minutes = total_seconds / 60;
        let seconds = total_seconds % 60;
        format!("{}m {}s", minutes, seconds)
    } else {
        let hours = total_seconds / 3600;
        let minutes = (total_seconds % 3600) / 60;
        let seconds = total_seconds % 60;
        format!("{}h {}m {}s", hours, minutes, seconds)
    }
}

/// Extract domain from URL
pub fn extract_domain(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()?
        .host_str()
        .map(|s| s.to_string())
}

/// Whether two URLs show the same document, ignoring fragment and a trailing slash
pub fn same_page(a: &str, b: &str) -> bool {
    fn normalized(raw: &str) -> String {
        match url::Url::parse(raw) {
            Ok(mut url) => {
                url.set_fragment(None);
                url.as_str().trim_end_matches('/').to_string()
            }
            Err(_) => raw.trim_end_matches('/').to_string(),
        }
    }
    normalized(a) == normalized(b)
}

/// `url` with `key=value` appended; `None` when `key` is already present or `url` does not parse
pub fn with_query_param(url: &str, key: &str, value: &str) -> Option<String> {
    let mut parsed = url::Url::parse(url).ok()?;
    if parsed.query_pairs().any(|(k, _)| k == key) {
        return None;
    }
    parsed.query_pairs_mut().append_pair(key, value);
    Some(parsed.into())
}

/// Absolute http(s) form of a link found on the page at `base`
pub fn resolve_link(raw: &str, base: &str) -> Option<String> {
    let url = match url::Url::parse(raw) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => url::Url::parse(base).ok()?.join(raw).ok()?,
        Err(_) => return None,
    };
    matches!(url.scheme(), "http" | "https").then(|| url.into())
}

/// Keep at most `max_chars` characters, never splitting a code point
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Sanitize a label for use as a directory or file name.
///
/// `/` and `\` become `_` so nested labels like "Home/Garden" stay one
/// segment; other reserved characters are dropped.
pub fn sanitize_filename(filename: &str) -> String {
    let mut sanitized: String = filename
        .trim()
        .chars()
        .filter_map(|ch| match ch {
            '/' | '\\' => Some('_'),
            c if INVALID_FILENAME_CHARS.contains(&c) || c.is_control() => None,
            c => Some(c),
        })
        .collect();

    if sanitized.chars().count() > 120 {
        sanitized = truncate_chars(&sanitized, 120);
    }

    let sanitized = sanitized.trim_matches(|c: char| c == '.' || c.is_whitespace()).to_string();
    if sanitized.is_empty() {
        "_".to_string()
    } else {
        sanitized
    }
}

/// Filesystem-safe key for a product's media folder, derived from its title
pub fn product_key(title: &str, index: usize) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| !INVALID_FILENAME_CHARS.contains(c) && !c.is_control())
        .collect();
    let key = truncate_chars(cleaned.trim(), 50).trim().replace(' ', "_");
    if key.is_empty() {
        format!("product_{}", index)
    } else {
        key
    }
}
