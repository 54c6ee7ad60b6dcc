//! Post-processing: deterministic cleanup of model replies.
//!
//! Even with explicit instructions, text models wrap answers in code fences,
//! emit `\r\n`, or leave zero-width characters behind. The rules here fix
//! those quirks without touching content, so the prompts can stay focused on
//! *what* to produce.
//!
//! Two entry points:
//!
//! * [`clean_markdown`] for cleaned chunk text;
//! * [`strip_json_fences`] for structuring / mutation replies, applied before
//!   strict JSON parsing.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply every Markdown rule to a cleaned chunk, in order:
///
/// 1. Strip outer ```` ```markdown ```` fences
/// 2. Normalise line endings (CRLF → LF)
/// 3. Trim trailing whitespace per line
/// 4. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 5. Collapse runs of blank lines to a single blank line
/// 6. Trim the whole text
///
/// The result carries no trailing newline; chunks are joined by the caller.
pub fn clean_markdown(input: &str) -> String {
    let s = strip_markdown_fences(input);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = remove_invisible_chars(&s);
    let s = collapse_blank_lines(&s);
    s.trim().to_string()
}

// ── Rule 1: Strip outer markdown fences ──────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?[ \t]*\r?\n(.*?)\r?\n```\s*$").unwrap());

fn strip_markdown_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 4: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 5: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

// ── JSON replies ─────────────────────────────────────────────────────────────

static RE_JSON_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*[ \t]*\r?\n?(.*?)\r?\n?```$").unwrap());

/// Strip an outer ```` ```json ```` (or bare ```` ``` ````) fence and trim.
///
/// Only the outermost fence is removed; anything else is left for the
/// strict parser to accept or reject.
pub fn strip_json_fences(input: &str) -> String {
    let trimmed = input.trim();
    match RE_JSON_FENCES.captures(trimmed) {
        Some(caps) => caps[1].trim().to_string(),
        None => trimmed.to_string(),
    }
}
