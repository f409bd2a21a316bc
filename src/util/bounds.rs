use crate::util::vec2::Vec2;

/// Axis-aligned bounding box in world units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec2,
    pub max: Vec2,
}

impl Aabb {
    #[inline]
    pub fn new(min: Vec2, max: Vec2) -> Self {
        Self { min, max }
    }

    /// Square box of side `2 * half_extent` centered on `center`.
    #[inline]
    pub fn centered(center: Vec2, half_extent: f32) -> Self {
        let half = Vec2::new(half_extent, half_extent);
        Self {
            min: center - half,
            max: center + half,
        }
    }

    #[inline]
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
    }

    #[inline]
    pub fn contains(&self, point: Vec2) -> bool {
        point.x >= self.min.x && point.x <= self.max.x && point.y >= self.min.y && point.y <= self.max.y
    }
}
