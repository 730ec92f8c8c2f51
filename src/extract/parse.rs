//! Best-effort field parsers over a card's captured text.
//!
//! Every parser returns `None` when nothing recognisable is found; the raw
//! text stays on the record either way.

use regex::Regex;
use std::sync::OnceLock;

const CURRENCY: &str = r"(?:[$€£₺]|(?:USD|EUR|GBP|TRY|TL)\b)";

static PRICE_LEADING: OnceLock<Option<Regex>> = OnceLock::new();
static PRICE_TRAILING: OnceLock<Option<Regex>> = OnceLock::new();
static BARE_NUMBER: OnceLock<Option<Regex>> = OnceLock::new();
static ORIGINAL_MARKER: OnceLock<Option<Regex>> = OnceLock::new();
static SOLD: OnceLock<Option<Regex>> = OnceLock::new();
static RATING: OnceLock<Option<Regex>> = OnceLock::new();
static FIRST_COUNT: OnceLock<Option<Regex>> = OnceLock::new();

fn compiled(cell: &'static OnceLock<Option<Regex>>, pattern: impl FnOnce() -> String) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(&pattern()).ok()).as_ref()
}

fn leading_currency() -> Option<&'static Regex> {
    compiled(&PRICE_LEADING, || format!(r"(?i){}[ \t\x{{00A0}}]*(?P<amount>\d[\d.,]*)", CURRENCY))
}

fn trailing_currency() -> Option<&'static Regex> {
    compiled(&PRICE_TRAILING, || format!(r"(?i)(?P<amount>\d[\d.,]*)[ \t\x{{00A0}}]*{}", CURRENCY))
}

/// First non-blank line, trimmed.
pub fn first_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Turn `1.299,99`, `1,299.99`, `12,50` or `1,299` into a float.
///
/// With both separators present the later one is the decimal mark. A lone
/// separator followed by exactly three digits is a thousands separator.
pub fn normalize_number(raw: &str) -> Option<f64> {
    let raw = raw.trim_matches(|c: char| c == '.' || c == ',');
    if raw.is_empty() {
        return None;
    }

    let last_dot = raw.rfind('.');
    let last_comma = raw.rfind(',');

    let normalized = match (last_dot, last_comma) {
        (Some(dot), Some(comma)) => {
            if dot > comma {
                raw.replace(',', "")
            } else {
                raw.replace('.', "").replace(',', ".")
            }
        }
        (Some(pos), None) | (None, Some(pos)) => {
            let sep = if last_dot.is_some() { '.' } else { ',' };
            let occurrences = raw.matches(sep).count();
            let decimals = raw.len() - pos - 1;
            if occurrences == 1 && decimals != 3 {
                raw.replace(sep, ".")
            } else {
                raw.replace(sep, "")
            }
        }
        (None, None) => raw.to_string(),
    };

    normalized.parse().ok()
}

/// First currency-marked amount in `text`, or the whole text when it is a
/// bare number. A symbol before the amount beats one after it.
pub fn parse_price(text: &str) -> Option<f64> {
    for regex in [leading_currency(), trailing_currency()].into_iter().flatten() {
        if let Some(amount) = regex.captures(text).and_then(|caps| caps.name("amount")) {
            return normalize_number(amount.as_str());
        }
    }

    let bare = compiled(&BARE_NUMBER, || r"^\d[\d.,]*$".to_string())?;
    let trimmed = text.trim();
    if bare.is_match(trimmed) {
        normalize_number(trimmed)
    } else {
        None
    }
}

/// Amount following a "was" / "list price" marker.
pub fn parse_original_price(text: &str) -> Option<f64> {
    let marker = compiled(&ORIGINAL_MARKER, || {
        r"(?i)\b(?:was|list price|previous price|original price|orig\.?)\s*:?\s*".to_string()
    })?;
    let found = marker.find(text)?;
    let rest = &text[found.end()..];
    let line = rest.lines().next().unwrap_or(rest);
    parse_price(line)
}

/// Count in phrases like `1,234 sold`, `5K+ bought` or `120 satıldı`.
pub fn parse_sold_count(text: &str) -> Option<u64> {
    let sold = compiled(&SOLD, || {
        r"(?i)(?P<n>\d[\d.,]*)[ \t]*(?P<unit>[km])?\+?[ \t]*(?:sold|bought|adet satıldı|satıldı)".to_string()
    })?;
    let caps = sold.captures(text)?;
    let digits = caps.name("n")?.as_str();

    match caps.name("unit").map(|m| m.as_str().to_ascii_lowercase()) {
        Some(unit) => {
            let base: f64 = digits.replace(',', ".").parse().ok()?;
            let scale = if unit == "m" { 1_000_000.0 } else { 1_000.0 };
            Some((base * scale).round() as u64)
        }
        None => digits.replace([',', '.'], "").parse().ok(),
    }
}

/// Star rating as written on the card, normalised to a dot decimal.
pub fn parse_rating(text: &str) -> Option<String> {
    let rating = compiled(&RATING, || r"(?i)\b(?P<r>\d(?:[.,]\d+)?)\s*(?:out of|/)\s*5\b".to_string())?;
    let caps = rating.captures(text)?;
    Some(caps.name("r")?.as_str().replace(',', "."))
}

/// First whole number in the text, thousands separators dropped:
/// `1.234 Değerlendirme`, `(87)`, `2,310 ratings`.
pub fn parse_count(text: &str) -> Option<u64> {
    let count = compiled(&FIRST_COUNT, || r"\d{1,3}(?:[.,]\d{3})+\b|\d+".to_string())?;
    count.find(text)?.as_str().replace([',', '.'], "").parse().ok()
}
