//! Generic content cleanup applied to every region's recognized text
//! before category-specific rules run.

use once_cell::sync::Lazy;
use regex::Regex;

/// Runs of two or more `.`, `·`, `_`, or the literal two-character
/// escape `\_` collapse to a canonical three-dot ellipsis — recognizer
/// output frequently renders leader dots/underscores as long runs of
/// varying length and character.
static DOT_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:\\_|[.\u{00B7}_]){2,}").unwrap());

/// Strips outer whitespace, collapses leader-dot/underscore runs, and
/// drops a literal (non-escaped) `\t` sequence sitting at either edge.
pub fn clean_content(raw: &str) -> String {
    let trimmed = raw.trim();
    let collapsed = DOT_RUN.replace_all(trimmed, "...");
    collapsed.trim_start_matches("\\t").trim_end_matches("\\t").to_string()
}

/// Replaces every lone `\n` (one not part of an existing `\n\n+` run)
/// with a blank-line paragraph break, leaving existing multi-newline
/// runs untouched. Implemented as a single index scan rather than a
/// regex, since the `regex` crate has no lookaround to express "exactly
/// one newline".
pub fn double_single_newlines(content: &str) -> String {
    let bytes = content.as_bytes();
    let mut out = String::with_capacity(content.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\n' {
            let start = i;
            while i < bytes.len() && bytes[i] == b'\n' {
                i += 1;
            }
            let run = i - start;
            if run == 1 {
                out.push_str("\n\n");
            } else {
                out.extend(std::iter::repeat('\n').take(run));
            }
        } else {
            out.push(content[i..].chars().next().unwrap());
            i += content[i..].chars().next().unwrap().len_utf8();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_content_trims_and_collapses_dot_runs() {
        assert_eq!(clean_content("  hello.......world  "), "hello...world");
        assert_eq!(clean_content("a···········b"), "a...b");
    }

    #[test]
    fn clean_content_drops_literal_tab_escape_at_edges() {
        assert_eq!(clean_content("\\ttext\\t"), "text");
        assert_eq!(clean_content("mid\\tdle"), "mid\\tdle");
    }

    #[test]
    fn double_single_newlines_leaves_existing_paragraph_breaks_alone() {
        assert_eq!(double_single_newlines("a\nb"), "a\n\nb");
        assert_eq!(double_single_newlines("a\n\nb"), "a\n\nb");
        assert_eq!(double_single_newlines("a\n\n\nb"), "a\n\n\nb");
    }
}
