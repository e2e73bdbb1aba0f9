//! Page-level Markdown assembly: wires label normalization, cleanup,
//! per-category rules, and cross-region merges into one pass over a
//! page's regions, then re-numbers them in final pipeline order.

use pageread_core::LayoutRegion;

use crate::cleanup::clean_content;
use crate::label::Category;
use crate::merge::{align_bullets, merge_formula_numbers, merge_word_breaks};
use crate::rules::{format_formula, format_heading, format_text, image_placeholder};

/// One region carried through formatting: its (possibly still-updating)
/// layout metadata, the rendering category derived from its native
/// label, and its recognized content.
#[derive(Debug, Clone)]
pub struct FormatRegion {
    pub region: LayoutRegion,
    pub category: Category,
    pub content: Option<String>,
}

/// Formats one page's regions into the final `LayoutRegion` list
/// (re-numbered, relabeled) and its Markdown fragment. `contents[i]`
/// is the recognized text for `regions[i]`; the two slices are
/// positional pairs, not pre-sorted by reading order.
pub fn format_page(page_index: usize, regions: Vec<LayoutRegion>, contents: Vec<Option<String>>) -> (Vec<LayoutRegion>, String) {
    assert_eq!(regions.len(), contents.len(), "regions and contents must be the same length");

    let mut items: Vec<FormatRegion> = regions
        .into_iter()
        .zip(contents)
        .map(|(region, content)| {
            let category = Category::from_native_label(&region.label);
            FormatRegion { region, category, content }
        })
        .collect();
    items.sort_by_key(|item| item.region.index);

    for item in items.iter_mut() {
        item.content = item.content.take().map(|c| clean_content(&c));
    }

    let items = merge_formula_numbers(items);

    let mut items: Vec<FormatRegion> = items
        .into_iter()
        .map(|mut item| {
            item.content = item.content.take().map(|content| match item.category {
                Category::DocTitle => format_heading(&content, "# "),
                Category::ParagraphTitle => format_heading(&content, "## "),
                Category::Text => format_text(&content),
                Category::Formula | Category::FormulaNumber => format_formula(&content),
                Category::Table | Category::Image | Category::Native => content,
            });
            item
        })
        .collect();

    let items = merge_word_breaks(items);
    let mut items = align_bullets(items);

    for item in items.iter_mut() {
        if item.category == Category::Image && item.content.as_deref().map_or(true, |c| c.trim().is_empty()) {
            item.content = Some(image_placeholder(page_index, &item.region.bbox));
        }
    }

    let mut final_regions = Vec::with_capacity(items.len());
    let mut markdown_parts = Vec::with_capacity(items.len());
    for (new_index, mut item) in items.into_iter().enumerate() {
        let output_label = item.category.output_label(&item.region.label).to_string();
        item.region.label = output_label;
        item.region.index = new_index;
        if let Some(content) = &item.content {
            if !content.is_empty() {
                markdown_parts.push(content.clone());
            }
        }
        final_regions.push(item.region);
    }

    (final_regions, markdown_parts.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pageread_core::{BBox, PipelineTask};

    fn region(index: usize, label: &str, order: usize) -> LayoutRegion {
        LayoutRegion {
            index,
            label: label.to_string(),
            task: PipelineTask::Text,
            score: 0.9,
            bbox: BBox { x1: 0.0, y1: 0.0, x2: 100.0, y2: 20.0 },
            polygon: vec![],
            order,
        }
    }

    #[test]
    fn doc_title_text_table_page_formats_and_relabels() {
        let regions = vec![region(0, "doc_title", 0), region(1, "text", 1), region(2, "table", 2)];
        let contents = vec![
            Some("Report Title".to_string()),
            Some("Body paragraph.".to_string()),
            Some("<table></table>".to_string()),
        ];
        let (final_regions, markdown) = format_page(0, regions, contents);
        assert_eq!(final_regions.iter().map(|r| r.label.as_str()).collect::<Vec<_>>(), vec!["text", "text", "table"]);
        assert_eq!(final_regions.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(markdown.starts_with("# Report Title"));
        assert!(markdown.contains("<table></table>"));
    }

    #[test]
    fn regions_out_of_pipeline_order_are_sorted_first() {
        let regions = vec![region(1, "text", 1), region(0, "doc_title", 0)];
        let contents = vec![Some("second".to_string()), Some("first".to_string())];
        let (final_regions, markdown) = format_page(0, regions, contents);
        assert_eq!(final_regions[0].order, 0);
        assert!(markdown.starts_with("# first"));
    }

    #[test]
    fn empty_content_regions_are_dropped_from_markdown_but_kept_in_regions() {
        let regions = vec![region(0, "text", 0), region(1, "abandon", 1)];
        let contents = vec![Some(String::new()), Some(String::new())];
        let (final_regions, markdown) = format_page(0, regions, contents);
        assert_eq!(final_regions.len(), 2);
        assert!(markdown.is_empty());
    }
}
