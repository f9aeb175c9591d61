use serde::{Deserialize, Serialize};

/// 正規化座標の点 (0.0〜1.0, 原点は左上)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Normalized axis-aligned rectangle. `y` grows downward, so `min_y` is the top edge.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NormRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl NormRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Build from edges. Swapped edges are normalized.
    pub fn from_edges(min_x: f32, min_y: f32, max_x: f32, max_y: f32) -> Self {
        let (x0, x1) = if min_x <= max_x { (min_x, max_x) } else { (max_x, min_x) };
        let (y0, y1) = if min_y <= max_y { (min_y, max_y) } else { (max_y, min_y) };
        Self::new(x0, y0, x1 - x0, y1 - y0)
    }

    pub fn min_x(&self) -> f32 {
        self.x
    }

    pub fn max_x(&self) -> f32 {
        self.x + self.width
    }

    pub fn min_y(&self) -> f32 {
        self.y
    }

    pub fn max_y(&self) -> f32 {
        self.y + self.height
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_edges_and_center() {
        let r = NormRect::from_edges(0.45, 0.4, 0.55, 0.6);
        assert!((r.min_x() - 0.45).abs() < 1e-6);
        assert!((r.max_x() - 0.55).abs() < 1e-6);
        assert!((r.max_y() - 0.6).abs() < 1e-6);
        let c = r.center();
        assert!((c.x - 0.5).abs() < 1e-6);
        assert!((c.y - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_from_edges_normalizes_swapped() {
        let r = NormRect::from_edges(0.6, 0.8, 0.2, 0.4);
        assert!((r.min_x() - 0.2).abs() < 1e-6);
        assert!((r.min_y() - 0.4).abs() < 1e-6);
        assert!(r.width > 0.0 && r.height > 0.0);
    }

    #[test]
    fn test_point_distance() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(0.3, 0.4);
        assert!((a.distance(&b) - 0.5).abs() < 1e-6);
    }
}
