//! Per-category content rules: headings, formula rewrap, and text-body
//! list/numbering/paragraph normalization.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::cleanup::double_single_newlines;

fn strip_leading_decorations(content: &str) -> &str {
    let mut rest = content.trim_start();
    loop {
        if let Some(r) = rest.strip_prefix('#') {
            rest = r.trim_start();
        } else if let Some(r) = rest.strip_prefix("- ") {
            rest = r;
        } else if let Some(r) = rest.strip_prefix("* ") {
            rest = r;
        } else {
            break;
        }
    }
    rest
}

/// `doc_title` → `# …`, `paragraph_title` → `## …`, after stripping any
/// leading `#`/`- `/`* ` decoration the recognizer already emitted.
pub fn format_heading(content: &str, prefix: &str) -> String {
    format!("{prefix}{}", strip_leading_decorations(content).trim())
}

fn strip_wrapper<'a>(s: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let s = s.trim();
    if s.len() >= open.len() + close.len() && s.starts_with(open) && s.ends_with(close) {
        Some(&s[open.len()..s.len() - close.len()])
    } else {
        None
    }
}

/// Unwraps an existing `$$…$$`, `\[…\]`, or `\(…\)` delimiter pair and
/// re-wraps the inner LaTeX in the canonical `$$\n…\n$$` block form.
pub fn format_formula(content: &str) -> String {
    let trimmed = content.trim();
    let inner = strip_wrapper(trimmed, "$$", "$$")
        .or_else(|| strip_wrapper(trimmed, "\\[", "\\]"))
        .or_else(|| strip_wrapper(trimmed, "\\(", "\\)"))
        .unwrap_or(trimmed);
    format!("$$\n{}\n$$", inner.trim())
}

fn split_indent(line: &str) -> (&str, &str) {
    let trimmed = line.trim_start();
    let indent_len = line.len() - trimmed.len();
    (&line[..indent_len], trimmed)
}

fn convert_bullet_line(line: &str) -> String {
    let (indent, rest) = split_indent(line);
    for marker in ['\u{00B7}', '\u{2022}', '*'] {
        if let Some(tail) = rest.strip_prefix(marker) {
            return format!("{indent}- {}", tail.trim_start());
        }
    }
    line.to_string()
}

static NUMBERED_PAREN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[(\u{FF08}](\d+)[)\u{FF09}]").unwrap());
static NUMBERED_ALPHA_DOT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([A-Za-z])\.").unwrap());
static NUMBERED_ALPHA_PAREN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([A-Za-z])\)").unwrap());

/// Normalizes a leading list marker — `(1)`, the fullwidth `（1）`, `A.`,
/// or `a)` — to a canonical ASCII form with exactly one trailing space.
fn normalize_numbering_line(line: &str) -> String {
    let (indent, rest) = split_indent(line);
    if let Some(caps) = NUMBERED_PAREN.captures(rest) {
        let marker = caps.get(0).unwrap();
        let number = &caps[1];
        let tail = &rest[marker.end()..];
        return format!("{indent}({number}) {}", tail.trim_start());
    }
    if let Some(caps) = NUMBERED_ALPHA_DOT.captures(rest) {
        let marker = caps.get(0).unwrap();
        let letter = &caps[1];
        let tail = &rest[marker.end()..];
        return format!("{indent}{letter}. {}", tail.trim_start());
    }
    if let Some(caps) = NUMBERED_ALPHA_PAREN.captures(rest) {
        let marker = caps.get(0).unwrap();
        let letter = &caps[1];
        let tail = &rest[marker.end()..];
        return format!("{indent}{letter}) {}", tail.trim_start());
    }
    line.to_string()
}

/// Text-body rules: bullet conversion and numbering normalization run
/// per line (a recognized text region may span a short list), then
/// single newlines widen into paragraph breaks across the whole block.
pub fn format_text(content: &str) -> String {
    let rewritten: Vec<String> = content
        .lines()
        .map(|line| normalize_numbering_line(&convert_bullet_line(line)))
        .collect();
    double_single_newlines(&rewritten.join("\n"))
}

/// `![](page=i,bbox=[x1,y1,x2,y2])` placeholder for an `image`-labeled
/// region with no recognized content.
pub fn image_placeholder(page_index: usize, bbox: &pageread_core::BBox) -> String {
    format!(
        "![](page={},bbox=[{},{},{},{}])",
        page_index, bbox.x1, bbox.y1, bbox.x2, bbox.y2
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_heading_strips_existing_markdown_decoration() {
        assert_eq!(format_heading("# Already a heading", "# "), "# Already a heading");
        assert_eq!(format_heading("- bulleted title", "## "), "## bulleted title");
    }

    #[test]
    fn format_formula_unwraps_and_rewraps_all_delimiter_styles() {
        assert_eq!(format_formula("$$x^2$$"), "$$\nx^2\n$$");
        assert_eq!(format_formula("\\[x^2\\]"), "$$\nx^2\n$$");
        assert_eq!(format_formula("\\(x^2\\)"), "$$\nx^2\n$$");
        assert_eq!(format_formula("x^2"), "$$\nx^2\n$$");
    }

    #[test]
    fn format_text_converts_bullets_and_numbering() {
        let out = format_text("\u{00B7}first\n(1)second\n（2）third\nA.fourth\na)fifth");
        let lines: Vec<&str> = out.split("\n\n").collect();
        assert_eq!(lines[0], "- first");
        assert_eq!(lines[1], "(1) second");
        assert_eq!(lines[2], "(2) third");
        assert_eq!(lines[3], "A. fourth");
        assert_eq!(lines[4], "a) fifth");
    }

    #[test]
    fn image_placeholder_embeds_page_and_bbox() {
        let bbox = pageread_core::BBox { x1: 1.0, y1: 2.0, x2: 3.0, y2: 4.0 };
        assert_eq!(image_placeholder(0, &bbox), "![](page=0,bbox=[1,2,3,4])");
    }
}
