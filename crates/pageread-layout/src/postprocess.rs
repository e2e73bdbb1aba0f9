//! Turns raw `LayoutPrediction` tensors into ordered, labeled
//! `LayoutRegion`s: scoring, thresholding, polygon extraction, NMS,
//! containment filtering and unclip.

use candle_core::Tensor;

use pageread_core::config::{LayoutConfig, MergeMode};
use pageread_core::model::{BBox, LayoutRegion, Point};
use pageread_tensor::interpolate::resize_nearest_mask;

use crate::geometry::{
    arc_length, boundary_points, convex_hull, insert_sharp_angle_vertices, largest_connected_component,
    ramer_douglas_peucker,
};
use crate::model::LayoutPrediction;
use crate::Result;

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

struct Candidate {
    selection_index: usize,
    class_id: usize,
    score: f32,
    /// Normalized `(cx, cy, w, h)` in `[0,1]`.
    norm_box: (f32, f32, f32, f32),
}

/// Every (query, class) pair is its own candidate — a query predicting
/// two classes with similar confidence yields two separate detections,
/// not just its argmax class. Gated on predicted box dimensions being
/// at least one mask cell wide/tall so a mask can meaningfully
/// represent it, flattened and sorted descending by score (ties by
/// ascending flat index for determinism), then truncated to the top
/// `num_queries` candidates.
fn score_candidates(logits: &Tensor, boxes: &Tensor, mask_h: usize, mask_w: usize) -> Result<Vec<Candidate>> {
    let (_, num_queries, num_classes) = logits.dims3()?;
    let logit_rows = logits.reshape((num_queries, num_classes))?.to_vec2::<f32>()?;
    let box_rows = boxes.reshape((num_queries, 4))?.to_vec2::<f32>()?;

    let mut candidates = Vec::with_capacity(num_queries * num_classes);
    for q in 0..num_queries {
        let (_, _, w, h) = (box_rows[q][0], box_rows[q][1], box_rows[q][2], box_rows[q][3]);
        if w <= 1.0 / mask_w as f32 || h <= 1.0 / mask_h as f32 {
            continue;
        }
        for (class_id, &logit) in logit_rows[q].iter().enumerate() {
            let flat_index = q * num_classes + class_id;
            candidates.push((
                flat_index,
                Candidate {
                    selection_index: q,
                    class_id,
                    score: sigmoid(logit),
                    norm_box: (box_rows[q][0], box_rows[q][1], box_rows[q][2], box_rows[q][3]),
                },
            ));
        }
    }
    candidates.sort_by(|(ai, a), (bi, b)| b.score.partial_cmp(&a.score).unwrap().then(ai.cmp(bi)));
    candidates.truncate(num_queries);
    Ok(candidates.into_iter().map(|(_, c)| c).collect())
}

/// Votes a reading-order rank for each kept candidate from the
/// order-pointer logits: candidate `i`'s rank is the number of other
/// kept candidates `j` the head judges should precede it
/// (`order_logits[j][i] > order_logits[i][j]`), so earlier content
/// accumulates a smaller rank. Ties break by selection index.
/// Computes the raw order-pointer rank for every one of the `n` original
/// queries: `vote[p] = Σ_{i<p} σ(logits[i,p]) + Σ_{i>p} (1 -
/// σ(logits[p,i]))`, ascending sort by vote (ties by original index) gives
/// each query's rank. Run over the full query set, independent of which
/// candidates later survive score/NMS filtering, since `order` is "the raw
/// order-pointer rank" rather than a position among kept detections.
fn order_ranks(order_logits: &Tensor) -> Result<Vec<usize>> {
    let (_, n, _) = order_logits.dims3()?;
    let rows = order_logits.reshape((n, n))?.to_vec2::<f32>()?;
    let mut votes: Vec<(f32, usize)> = (0..n)
        .map(|p| {
            let mut vote = 0f32;
            for i in 0..n {
                if i < p {
                    vote += sigmoid(rows[i][p]);
                } else if i > p {
                    vote += 1.0 - sigmoid(rows[p][i]);
                }
            }
            (vote, p)
        })
        .collect();
    votes.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap().then(a.1.cmp(&b.1)));
    let mut ranks = vec![0usize; n];
    for (rank, (_, p)) in votes.into_iter().enumerate() {
        ranks[p] = rank;
    }
    Ok(ranks)
}

/// Extracts a polygon for one candidate's mask, cropped to its absolute
/// box and resized to the box's pixel footprint, via largest-component
/// BFS, convex hull and RDP simplification, falling back to the box's
/// four corners when no positive pixels remain.
fn extract_polygon(mask_plane: &[f32], mask_h: usize, mask_w: usize, bbox: &BBox, page_w: u32, page_h: u32) -> Vec<Point> {
    let crop_x0 = ((bbox.x1 / page_w as f32) * mask_w as f32).floor().max(0.0) as usize;
    let crop_y0 = ((bbox.y1 / page_h as f32) * mask_h as f32).floor().max(0.0) as usize;
    let crop_x1 = (((bbox.x2 / page_w as f32) * mask_w as f32).ceil() as usize).clamp(crop_x0 + 1, mask_w);
    let crop_y1 = (((bbox.y2 / page_h as f32) * mask_h as f32).ceil() as usize).clamp(crop_y0 + 1, mask_h);
    let crop_w = crop_x1 - crop_x0;
    let crop_h = crop_y1 - crop_y0;

    let mut crop = vec![0f32; crop_w * crop_h];
    for y in 0..crop_h {
        for x in 0..crop_w {
            crop[y * crop_w + x] = mask_plane[(crop_y0 + y) * mask_w + (crop_x0 + x)];
        }
    }

    let box_w = (bbox.width().round().max(1.0)) as usize;
    let box_h = (bbox.height().round().max(1.0)) as usize;
    let resized = resize_nearest_mask(&crop, crop_h, crop_w, box_h, box_w);
    let binary: Vec<bool> = resized.iter().map(|&v| sigmoid(v) > 0.5).collect();

    let fallback = || {
        vec![
            Point { x: bbox.x1, y: bbox.y1 },
            Point { x: bbox.x2, y: bbox.y1 },
            Point { x: bbox.x2, y: bbox.y2 },
            Point { x: bbox.x1, y: bbox.y2 },
        ]
    };

    if !binary.iter().any(|&v| v) {
        return fallback();
    }

    let component = largest_connected_component(&binary, box_h, box_w);
    let boundary = boundary_points(&component, box_h, box_w);
    if boundary.len() < 3 {
        return fallback();
    }

    let hull = convex_hull(&boundary);
    if hull.len() < 3 {
        return fallback();
    }
    let epsilon = 0.004 * arc_length(&hull);
    let simplified = ramer_douglas_peucker(&hull, epsilon.max(1e-3));
    let with_sharp_angles = insert_sharp_angle_vertices(&simplified);

    with_sharp_angles
        .into_iter()
        .map(|p| Point { x: p.x + bbox.x1, y: p.y + bbox.y1 })
        .collect()
}

fn normalize_box(bbox: &BBox, page_w: u32, page_h: u32) -> BBox {
    let sx = 1000.0 / page_w as f32;
    let sy = 1000.0 / page_h as f32;
    BBox {
        x1: bbox.x1 * sx,
        y1: bbox.y1 * sy,
        x2: bbox.x2 * sx,
        y2: bbox.y2 * sy,
    }
}

/// Expands `bbox` from its own center by `ratio`, then clamps to the
/// page.
fn unclip(bbox: &BBox, ratio: (f32, f32), page_w: u32, page_h: u32) -> BBox {
    let (cx, cy) = bbox.center();
    let half_w = bbox.width() / 2.0 * ratio.0.max(1.0);
    let half_h = bbox.height() / 2.0 * ratio.1.max(1.0);
    BBox {
        x1: (cx - half_w).max(0.0),
        y1: (cy - half_h).max(0.0),
        x2: (cx + half_w).min(page_w as f32),
        y2: (cy + half_h).min(page_h as f32),
    }
}

/// Drops `image`-labeled detections whose area exceeds 82%/93% of the
/// page (portrait/landscape) unless they are the only remaining
/// detection, matching full-page false positives from the image class.
/// Other labels are left untouched even when they span the page.
fn filter_large_images(boxes: &[(usize, String, BBox)], page_w: u32, page_h: u32) -> Vec<(usize, String, BBox)> {
    if boxes.len() <= 1 {
        return boxes.to_vec();
    }
    let page_area = page_w as f32 * page_h as f32;
    let ratio = if page_w > page_h { 0.93 } else { 0.82 };
    let filtered: Vec<_> = boxes
        .iter()
        .filter(|(_, label, b)| label != "image" || b.area() <= ratio * page_area)
        .cloned()
        .collect();
    if filtered.is_empty() {
        boxes.to_vec()
    } else {
        filtered
    }
}

/// Removes boxes mostly contained in another kept box of a different
/// label, per the configured merge mode, preserving image/seal/chart
/// regions unconditionally.
const PRESERVED_LABELS: [&str; 3] = ["image", "seal", "chart"];

fn apply_containment_filter(candidates: &mut Vec<(usize, String, BBox)>, config: &LayoutConfig) {
    let mut dropped = vec![false; candidates.len()];
    for i in 0..candidates.len() {
        if dropped[i] || PRESERVED_LABELS.contains(&candidates[i].1.as_str()) {
            continue;
        }
        for j in 0..candidates.len() {
            if i == j || dropped[j] || PRESERVED_LABELS.contains(&candidates[j].1.as_str()) {
                continue;
            }
            let Some(rule) = config.merge_bboxes_mode.get(&candidates[i].1) else { continue };
            if !rule.labels.contains(&candidates[j].1) {
                continue;
            }
            let contained = candidates[i].2.intersection_over_own_area(&candidates[j].2) >= 0.8;
            if !contained {
                continue;
            }
            match rule.mode {
                MergeMode::Large => {
                    // `i` (contained) yields to the larger `j`.
                    dropped[i] = true;
                }
                MergeMode::Small => {
                    // the smaller region wins; drop the larger container `j`.
                    if candidates[j].2.area() >= candidates[i].2.area() {
                        dropped[j] = true;
                    }
                }
            }
        }
    }
    let mut kept = Vec::with_capacity(candidates.len());
    for (idx, item) in candidates.drain(..).enumerate() {
        if !dropped[idx] {
            kept.push(item);
        }
    }
    *candidates = kept;
}

/// Greedy same-class/cross-class NMS over inclusive-pixel IoU: same-label
/// pairs suppressed above 0.6 IoU, cross-label pairs only above 0.98 IoU
/// (near-duplicate detections).
fn apply_nms(candidates: &[(usize, String, f32, BBox)]) -> Vec<bool> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| candidates[b].2.partial_cmp(&candidates[a].2).unwrap());
    let mut suppressed = vec![false; candidates.len()];
    for (oi, &i) in order.iter().enumerate() {
        if suppressed[i] {
            continue;
        }
        for &j in &order[oi + 1..] {
            if suppressed[j] {
                continue;
            }
            let iou = candidates[i].3.inclusive_iou(&candidates[j].3);
            let threshold = if candidates[i].1 == candidates[j].1 { 0.6 } else { 0.98 };
            if iou > threshold {
                suppressed[j] = true;
            }
        }
    }
    suppressed
}

/// Full postprocessing pipeline for one page's raw prediction, producing
/// final regions in reading order with `index` re-numbered from 0.
pub fn postprocess(
    prediction: &LayoutPrediction,
    page_w: u32,
    page_h: u32,
    config: &LayoutConfig,
) -> Result<Vec<LayoutRegion>> {
    let (_, _num_queries, mask_h, mask_w) = prediction.out_masks.dims4()?;
    let candidates = score_candidates(&prediction.logits, &prediction.pred_boxes, mask_h, mask_w)?;

    // Step 2/3: absolute boxes, label lookup, and score/threshold gating.
    let mut kept = Vec::new();
    for candidate in candidates {
        let label = config
            .id2label
            .get(&(candidate.class_id as u32))
            .cloned()
            .unwrap_or_else(|| format!("class_{}", candidate.class_id));
        if candidate.score < config.threshold_for(&label) {
            continue;
        }
        let (cx, cy, w, h) = candidate.norm_box;
        let bbox = BBox {
            x1: (cx - w / 2.0) * page_w as f32,
            y1: (cy - h / 2.0) * page_h as f32,
            x2: (cx + w / 2.0) * page_w as f32,
            y2: (cy + h / 2.0) * page_h as f32,
        };
        let bbox = BBox {
            x1: bbox.x1.clamp(0.0, page_w as f32),
            y1: bbox.y1.clamp(0.0, page_h as f32),
            x2: bbox.x2.clamp(0.0, page_w as f32),
            y2: bbox.y2.clamp(0.0, page_h as f32),
        };
        if bbox.is_degenerate() {
            continue;
        }
        kept.push((candidate.selection_index, label, candidate.score, bbox));
    }

    // Step 5: optional NMS.
    if config.layout_nms {
        let suppressed = apply_nms(&kept);
        kept = kept.into_iter().zip(suppressed).filter(|(_, s)| !s).map(|(c, _)| c).collect();
    }

    // Step 6: large-image filter.
    let boxes_only: Vec<(usize, String, BBox)> = kept.iter().map(|(idx, label, _, b)| (*idx, label.clone(), *b)).collect();
    let surviving_indices: std::collections::HashSet<usize> =
        filter_large_images(&boxes_only, page_w, page_h).into_iter().map(|(idx, _, _)| idx).collect();
    kept.retain(|(idx, _, _, _)| surviving_indices.contains(idx));

    // Step 7: containment filter.
    let mut containment_input: Vec<(usize, String, BBox)> =
        kept.iter().map(|(idx, label, _, bbox)| (*idx, label.clone(), *bbox)).collect();
    apply_containment_filter(&mut containment_input, config);
    let surviving_after_containment: std::collections::HashSet<usize> =
        containment_input.iter().map(|(idx, _, _)| *idx).collect();
    kept.retain(|(idx, _, _, _)| surviving_after_containment.contains(idx));

    // Step 8: unclip.
    for entry in &mut kept {
        entry.3 = unclip(&entry.3, config.unclip_ratio, page_w, page_h);
    }

    // Step 9: truncate to integer pixels, drop degenerate boxes.
    kept.retain(|(_, _, _, bbox)| !bbox.is_degenerate());
    for entry in &mut kept {
        entry.3 = BBox {
            x1: entry.3.x1.trunc(),
            y1: entry.3.y1.trunc(),
            x2: entry.3.x2.trunc(),
            y2: entry.3.y2.trunc(),
        };
    }
    kept.retain(|(_, _, _, bbox)| !bbox.is_degenerate());

    // Reading order: raw order-pointer rank over the full 300-query set,
    // independent of which candidates survived filtering.
    let ranks = order_ranks(&prediction.order_logits)?;
    kept.sort_by(|a, b| ranks[a.0].cmp(&ranks[b.0]).then(a.0.cmp(&b.0)));

    tracing::debug!("layout postprocess: {} regions survived filtering", kept.len());

    let mask_data = prediction.out_masks.reshape((prediction.out_masks.dim(1)?, mask_h, mask_w))?.to_vec3::<f32>()?;

    let mut regions = Vec::with_capacity(kept.len());
    for (new_index, (selection_index, label, score, bbox)) in kept.into_iter().enumerate() {
        let order = ranks[selection_index];
        let mask_plane: Vec<f32> = mask_data[selection_index].iter().flatten().copied().collect();
        let polygon = extract_polygon(&mask_plane, mask_h, mask_w, &bbox, page_w, page_h);
        regions.push(LayoutRegion {
            index: new_index,
            task: config.task_for_label(&label),
            label,
            score,
            bbox: normalize_box(&bbox, page_w, page_h),
            polygon,
            order,
        });
    }

    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn prediction_for_two_boxes() -> LayoutPrediction {
        let device = Device::Cpu;
        // Query 0: class 0 high score, large box. Query 1: class 1 high score, large box.
        let logits = Tensor::from_vec(vec![5.0f32, -5.0, -5.0, 5.0], (1, 2, 2), &device).unwrap();
        let boxes = Tensor::from_vec(vec![0.25f32, 0.25, 0.4, 0.4, 0.75, 0.75, 0.4, 0.4], (1, 2, 4), &device).unwrap();
        let order_logits = Tensor::from_vec(vec![0f32, 5.0, -5.0, 0.0], (1, 2, 2), &device).unwrap();
        let out_masks = Tensor::ones((1, 2, 20, 20), DType::F32, &device).unwrap();
        LayoutPrediction { logits, pred_boxes: boxes, order_logits, out_masks }
    }

    #[test]
    fn postprocess_keeps_both_boxes_in_order() {
        let prediction = prediction_for_two_boxes();
        let mut config = LayoutConfig::default();
        config.threshold = 0.01;
        config.layout_nms = false;
        config.id2label.insert(0, "doc_title".to_string());
        config.id2label.insert(1, "text".to_string());

        let regions = postprocess(&prediction, 1000, 1000, &config).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].index, 0);
        assert_eq!(regions[1].index, 1);
        // order_logits favors query 0 before query 1.
        assert!(regions[0].order <= regions[1].order);
    }

    #[test]
    fn postprocess_drops_below_threshold() {
        let prediction = prediction_for_two_boxes();
        let mut config = LayoutConfig::default();
        config.threshold = 0.999;
        let regions = postprocess(&prediction, 1000, 1000, &config).unwrap();
        assert!(regions.is_empty());
    }

    #[test]
    fn extract_polygon_falls_back_on_empty_mask() {
        let bbox = BBox { x1: 10.0, y1: 10.0, x2: 30.0, y2: 30.0 };
        let mask = vec![-10f32; 20 * 20];
        let polygon = extract_polygon(&mask, 20, 20, &bbox, 200, 200);
        assert_eq!(polygon.len(), 4);
    }

    #[test]
    fn unclip_expands_symmetrically_and_clamps() {
        let bbox = BBox { x1: 10.0, y1: 10.0, x2: 20.0, y2: 20.0 };
        let expanded = unclip(&bbox, (2.0, 2.0), 1000, 1000);
        assert!((expanded.width() - 20.0).abs() < 1e-3);
        let edge = BBox { x1: 0.0, y1: 0.0, x2: 10.0, y2: 10.0 };
        let clamped = unclip(&edge, (4.0, 4.0), 1000, 1000);
        assert!(clamped.x1 >= 0.0 && clamped.y1 >= 0.0);
    }

    #[test]
    fn filter_large_images_drops_full_page_box_when_others_remain() {
        let boxes = vec![
            (0, "image".to_string(), BBox { x1: 0.0, y1: 0.0, x2: 1000.0, y2: 1000.0 }),
            (1, "text".to_string(), BBox { x1: 10.0, y1: 10.0, x2: 50.0, y2: 50.0 }),
        ];
        let filtered = filter_large_images(&boxes, 1000, 1000);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].0, 1);
    }

    #[test]
    fn filter_large_images_keeps_large_non_image_label() {
        let boxes = vec![
            (0, "table".to_string(), BBox { x1: 0.0, y1: 0.0, x2: 1000.0, y2: 1000.0 }),
            (1, "text".to_string(), BBox { x1: 10.0, y1: 10.0, x2: 50.0, y2: 50.0 }),
        ];
        let filtered = filter_large_images(&boxes, 1000, 1000);
        assert_eq!(filtered.len(), 2);
    }
}
