//! Cross-region merge rules: word-break recombination, `formula_number`
//! tagging, and bullet-alignment inference.

use crate::assemble::FormatRegion;
use crate::label::Category;

/// Merges a `formula_number` region into its neighboring `formula`
/// region as a `\tag{…}` suffix, preferring the following region and
/// falling back to the preceding one. The `formula_number` region is
/// dropped from the output; content is still the raw cleaned text at
/// this point, before `format_formula` wraps it in `$$…$$`.
pub fn merge_formula_numbers(mut items: Vec<FormatRegion>) -> Vec<FormatRegion> {
    let mut i = 0;
    while i < items.len() {
        if items[i].category != Category::FormulaNumber {
            i += 1;
            continue;
        }
        let tag = items[i].content.clone().unwrap_or_default();
        let target = if i + 1 < items.len() && items[i + 1].category == Category::Formula {
            Some(i + 1)
        } else if i > 0 && items[i - 1].category == Category::Formula {
            Some(i - 1)
        } else {
            None
        };
        match target {
            Some(target) => {
                if let Some(formula_content) = items[target].content.as_mut() {
                    formula_content.push_str(&format!(" \\tag{{{}}}", tag.trim()));
                }
                items.remove(i);
                // Don't advance: the next element has shifted into index i.
            }
            None => i += 1,
        }
    }
    items
}

/// Merges adjacent `text`-category regions when the left region's
/// rendered content ends with `-` and the right begins with a lowercase
/// letter — a word broken across two detections by the layout model.
pub fn merge_word_breaks(items: Vec<FormatRegion>) -> Vec<FormatRegion> {
    let mut out: Vec<FormatRegion> = Vec::with_capacity(items.len());
    for item in items {
        let should_merge = match out.last() {
            Some(prev) => {
                prev.category == Category::Text
                    && item.category == Category::Text
                    && prev.content.as_deref().is_some_and(|l| l.ends_with('-'))
                    && item.content.as_deref().and_then(|r| r.chars().next()).is_some_and(char::is_lowercase)
            }
            None => false,
        };
        if should_merge {
            let prev = out.last_mut().unwrap();
            let mut left = prev.content.take().unwrap();
            left.pop();
            left.push_str(item.content.as_deref().unwrap_or(""));
            prev.content = Some(left);
        } else {
            out.push(item);
        }
    }
    out
}

fn is_bulleted(content: &Option<String>) -> bool {
    content.as_deref().is_some_and(|c| c.trim_start().starts_with("- "))
}

/// A middle `text` region sitting between two already-bulleted `text`
/// regions, with its left edge within 10 units of both neighbors, is
/// assumed to be a dropped bullet and gets one prepended.
pub fn align_bullets(mut items: Vec<FormatRegion>) -> Vec<FormatRegion> {
    if items.len() < 3 {
        return items;
    }
    for i in 1..items.len() - 1 {
        let left_bulleted = is_bulleted(&items[i - 1].content);
        let left_x1 = items[i - 1].region.bbox.x1;
        let right_bulleted = is_bulleted(&items[i + 1].content);
        let right_x1 = items[i + 1].region.bbox.x1;
        let middle = &items[i];
        if middle.category != Category::Text {
            continue;
        }
        let middle_x1 = middle.region.bbox.x1;
        let aligned = (middle_x1 - left_x1).abs() <= 10.0 && (middle_x1 - right_x1).abs() <= 10.0;
        if left_bulleted && right_bulleted && aligned {
            if let Some(content) = items[i].content.as_mut() {
                if !content.trim_start().starts_with("- ") {
                    *content = format!("- {content}");
                }
            }
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use pageread_core::{BBox, LayoutRegion, PipelineTask};

    fn region(index: usize, x1: f32) -> LayoutRegion {
        LayoutRegion {
            index,
            label: "text".to_string(),
            task: PipelineTask::Text,
            score: 1.0,
            bbox: BBox { x1, y1: 0.0, x2: x1 + 10.0, y2: 10.0 },
            polygon: vec![],
            order: index,
        }
    }

    fn text_item(index: usize, x1: f32, content: &str) -> FormatRegion {
        FormatRegion { region: region(index, x1), category: Category::Text, content: Some(content.to_string()) }
    }

    #[test]
    fn merge_word_breaks_joins_hyphenated_split() {
        let items = vec![text_item(0, 0.0, "hyphen-"), text_item(1, 0.0, "ated word")];
        let merged = merge_word_breaks(items);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].content.as_deref(), Some("hyphenated word"));
    }

    #[test]
    fn merge_word_breaks_leaves_non_lowercase_continuation_alone() {
        let items = vec![text_item(0, 0.0, "Sentence ends-"), text_item(1, 0.0, "New sentence")];
        let merged = merge_word_breaks(items);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn merge_formula_numbers_tags_the_following_formula() {
        let mut number = text_item(0, 0.0, "(1)");
        number.category = Category::FormulaNumber;
        let mut formula = text_item(1, 0.0, "x^2");
        formula.category = Category::Formula;
        let merged = merge_formula_numbers(vec![number, formula]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].content.as_deref(), Some("x^2 \\tag{(1)}"));
    }

    #[test]
    fn align_bullets_prepends_dash_for_middle_region_between_bullets() {
        let items = vec![
            text_item(0, 5.0, "- first"),
            text_item(1, 6.0, "dropped bullet"),
            text_item(2, 5.0, "- third"),
        ];
        let aligned = align_bullets(items);
        assert_eq!(aligned[1].content.as_deref(), Some("- dropped bullet"));
    }

    #[test]
    fn align_bullets_skips_when_x_left_diverges() {
        let items = vec![
            text_item(0, 5.0, "- first"),
            text_item(1, 60.0, "not a bullet"),
            text_item(2, 5.0, "- third"),
        ];
        let aligned = align_bullets(items);
        assert_eq!(aligned[1].content.as_deref(), Some("not a bullet"));
    }
}
