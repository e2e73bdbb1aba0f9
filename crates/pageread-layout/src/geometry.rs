//! Pure geometry helpers for contour extraction: largest connected
//! component via 8-connected BFS, convex hull, and Ramer-Douglas-Peucker
//! simplification.

use pageread_core::Point;

/// Largest 8-connected component of `true` cells in a `h x w` boolean
/// grid, returned as a boolean mask of the same size with only that
/// component set.
pub fn largest_connected_component(mask: &[bool], h: usize, w: usize) -> Vec<bool> {
    let mut visited = vec![false; h * w];
    let mut best: Vec<usize> = Vec::new();

    for start in 0..h * w {
        if !mask[start] || visited[start] {
            continue;
        }
        let mut component = Vec::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(start);
        visited[start] = true;
        while let Some(idx) = queue.pop_front() {
            component.push(idx);
            let (y, x) = (idx / w, idx % w);
            for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    if dy == 0 && dx == 0 {
                        continue;
                    }
                    let ny = y as i32 + dy;
                    let nx = x as i32 + dx;
                    if ny < 0 || nx < 0 || ny >= h as i32 || nx >= w as i32 {
                        continue;
                    }
                    let nidx = ny as usize * w + nx as usize;
                    if mask[nidx] && !visited[nidx] {
                        visited[nidx] = true;
                        queue.push_back(nidx);
                    }
                }
            }
        }
        if component.len() > best.len() {
            best = component;
        }
    }

    let mut out = vec![false; h * w];
    for idx in best {
        out[idx] = true;
    }
    out
}

/// Boundary pixels of `mask` (true cells with at least one false or
/// out-of-bounds 4-neighbor).
pub fn boundary_points(mask: &[bool], h: usize, w: usize) -> Vec<Point> {
    let mut points = Vec::new();
    for y in 0..h {
        for x in 0..w {
            if !mask[y * w + x] {
                continue;
            }
            let is_boundary = [(-1i32, 0i32), (1, 0), (0, -1), (0, 1)].iter().any(|&(dy, dx)| {
                let ny = y as i32 + dy;
                let nx = x as i32 + dx;
                ny < 0 || nx < 0 || ny >= h as i32 || nx >= w as i32 || !mask[ny as usize * w + nx as usize]
            });
            if is_boundary {
                points.push(Point { x: x as f32, y: y as f32 });
            }
        }
    }
    points
}

/// Andrew's monotone chain convex hull. Returns points in
/// counter-clockwise order; fewer than 3 input points are returned
/// unchanged.
pub fn convex_hull(points: &[Point]) -> Vec<Point> {
    if points.len() < 3 {
        return points.to_vec();
    }
    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.x.partial_cmp(&b.x).unwrap().then(a.y.partial_cmp(&b.y).unwrap()));
    sorted.dedup_by(|a, b| a.x == b.x && a.y == b.y);
    if sorted.len() < 3 {
        return sorted;
    }

    fn cross(o: &Point, a: &Point, b: &Point) -> f32 {
        (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
    }

    let mut lower = Vec::new();
    for p in &sorted {
        while lower.len() >= 2 && cross(&lower[lower.len() - 2], &lower[lower.len() - 1], p) <= 0.0 {
            lower.pop();
        }
        lower.push(*p);
    }
    let mut upper = Vec::new();
    for p in sorted.iter().rev() {
        while upper.len() >= 2 && cross(&upper[upper.len() - 2], &upper[upper.len() - 1], p) <= 0.0 {
            upper.pop();
        }
        upper.push(*p);
    }
    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

/// Ramer-Douglas-Peucker polyline simplification with absolute-distance
/// tolerance `epsilon`. Treats `points` as a closed ring.
pub fn ramer_douglas_peucker(points: &[Point], epsilon: f32) -> Vec<Point> {
    if points.len() < 3 {
        return points.to_vec();
    }
    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[points.len() - 1] = true;
    rdp_recursive(points, 0, points.len() - 1, epsilon, &mut keep);
    points.iter().zip(keep.iter()).filter(|(_, k)| **k).map(|(p, _)| *p).collect()
}

fn rdp_recursive(points: &[Point], start: usize, end: usize, epsilon: f32, keep: &mut [bool]) {
    if end <= start + 1 {
        return;
    }
    let (mut max_dist, mut max_index) = (0.0f32, start);
    for i in start + 1..end {
        let dist = perpendicular_distance(&points[i], &points[start], &points[end]);
        if dist > max_dist {
            max_dist = dist;
            max_index = i;
        }
    }
    if max_dist > epsilon {
        keep[max_index] = true;
        rdp_recursive(points, start, max_index, epsilon, keep);
        rdp_recursive(points, max_index, end, epsilon, keep);
    }
}

fn perpendicular_distance(point: &Point, line_start: &Point, line_end: &Point) -> f32 {
    let dx = line_end.x - line_start.x;
    let dy = line_end.y - line_start.y;
    let len = (dx * dx + dy * dy).sqrt();
    if len < 1e-6 {
        return ((point.x - line_start.x).powi(2) + (point.y - line_start.y).powi(2)).sqrt();
    }
    ((dy * point.x - dx * point.y + line_end.x * line_start.y - line_end.y * line_start.x).abs()) / len
}

/// Perimeter of the polygon treated as a closed ring, used to scale the
/// RDP epsilon (`0.004 * arc_length`).
pub fn arc_length(points: &[Point]) -> f32 {
    if points.len() < 2 {
        return 0.0;
    }
    let mut total = 0.0;
    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        total += ((b.x - a.x).powi(2) + (b.y - a.y).powi(2)).sqrt();
    }
    total
}

/// Inserts a point along the bisector at each concave vertex whose
/// interior angle is within 1 degree of 45 degrees, at distance
/// `(|v1|+|v2|)/2` from the vertex.
pub fn insert_sharp_angle_vertices(polygon: &[Point]) -> Vec<Point> {
    if polygon.len() < 3 {
        return polygon.to_vec();
    }
    let mut out = Vec::with_capacity(polygon.len() * 2);
    let n = polygon.len();
    for i in 0..n {
        let prev = polygon[(i + n - 1) % n];
        let curr = polygon[i];
        let next = polygon[(i + 1) % n];
        out.push(curr);

        let v1 = Point { x: prev.x - curr.x, y: prev.y - curr.y };
        let v2 = Point { x: next.x - curr.x, y: next.y - curr.y };
        let len1 = (v1.x * v1.x + v1.y * v1.y).sqrt();
        let len2 = (v2.x * v2.x + v2.y * v2.y).sqrt();
        if len1 < 1e-6 || len2 < 1e-6 {
            continue;
        }
        let cos_angle = (v1.x * v2.x + v1.y * v2.y) / (len1 * len2);
        let angle_deg = cos_angle.clamp(-1.0, 1.0).acos().to_degrees();
        if (angle_deg - 45.0).abs() < 1.0 {
            let bisector = Point { x: v1.x / len1 + v2.x / len2, y: v1.y / len1 + v2.y / len2 };
            let bisector_len = (bisector.x * bisector.x + bisector.y * bisector.y).sqrt();
            if bisector_len > 1e-6 {
                let distance = (len1 + len2) / 2.0;
                out.push(Point {
                    x: curr.x + bisector.x / bisector_len * distance,
                    y: curr.y + bisector.y / bisector_len * distance,
                });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn largest_connected_component_picks_bigger_blob() {
        // 4x4 grid: a 2x2 blob at top-left and a single pixel at bottom-right.
        let mut mask = vec![false; 16];
        mask[0] = true;
        mask[1] = true;
        mask[4] = true;
        mask[5] = true;
        mask[15] = true;
        let component = largest_connected_component(&mask, 4, 4);
        assert_eq!(component.iter().filter(|&&v| v).count(), 4);
        assert!(!component[15]);
    }

    #[test]
    fn convex_hull_of_square_is_four_corners() {
        let points = vec![
            Point { x: 0.0, y: 0.0 },
            Point { x: 1.0, y: 0.0 },
            Point { x: 1.0, y: 1.0 },
            Point { x: 0.0, y: 1.0 },
            Point { x: 0.5, y: 0.5 }, // interior point, must be dropped
        ];
        let hull = convex_hull(&points);
        assert_eq!(hull.len(), 4);
    }

    #[test]
    fn rdp_collapses_nearly_collinear_points() {
        let points = vec![
            Point { x: 0.0, y: 0.0 },
            Point { x: 1.0, y: 0.01 },
            Point { x: 2.0, y: 0.0 },
        ];
        let simplified = ramer_douglas_peucker(&points, 1.0);
        assert_eq!(simplified.len(), 2);
    }

    #[test]
    fn rdp_keeps_significant_deviation() {
        let points = vec![
            Point { x: 0.0, y: 0.0 },
            Point { x: 1.0, y: 5.0 },
            Point { x: 2.0, y: 0.0 },
        ];
        let simplified = ramer_douglas_peucker(&points, 0.5);
        assert_eq!(simplified.len(), 3);
    }

    #[test]
    fn arc_length_of_unit_square_is_four() {
        let points = vec![
            Point { x: 0.0, y: 0.0 },
            Point { x: 1.0, y: 0.0 },
            Point { x: 1.0, y: 1.0 },
            Point { x: 0.0, y: 1.0 },
        ];
        assert!((arc_length(&points) - 4.0).abs() < 1e-5);
    }
}
