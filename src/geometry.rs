use geo::geometry::{Coord, LineString, Polygon, Rect};
use geo::coordinate_position::CoordPos;
use geo::{BoundingRect, CoordinatePosition};
use thiserror::Error;

/// Fewest outline vertices that can enclose an area.
pub const MIN_OUTLINE_POINTS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("outline has {0} points, at least 3 are required")]
    TooFewPoints(usize),

    #[error("outline point {index} ({x}, {y}) is not finite")]
    NonFinite { index: usize, x: f64, y: f64 },
}

/// A detected nucleus, reduced to its center.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct NucleusPoint {
    pub center_x: f64,
    pub center_y: f64,
}

impl NucleusPoint {
    pub fn new(center_x: f64, center_y: f64) -> Self {
        NucleusPoint { center_x, center_y }
    }

    /// Nucleus located at the mean of its boundary points.
    pub fn from_outline(outline: &[(f64, f64)]) -> Self {
        let (x, y) = outline_centroid(outline);
        NucleusPoint::new(x, y)
    }
}

/// A detected cell body boundary, vertices in the order the segmenter traced them.
#[derive(Clone, Debug, PartialEq)]
pub struct CytoplasmPolygon {
    pub outline: Vec<(f64, f64)>,
}

impl CytoplasmPolygon {
    pub fn new(outline: Vec<(f64, f64)>) -> Self {
        CytoplasmPolygon { outline }
    }

    pub fn centroid(&self) -> (f64, f64) {
        outline_centroid(&self.outline)
    }
}

// Unweighted mean of the vertices, not the area centroid. An empty outline
// gives NaN coordinates.
pub fn outline_centroid(outline: &[(f64, f64)]) -> (f64, f64) {
    let mut x = 0.0;
    let mut y = 0.0;
    for v in outline {
        x += v.0;
        y += v.1;
    }
    x /= outline.len() as f64;
    y /= outline.len() as f64;
    (x, y)
}

pub fn validate_outline(outline: &[(f64, f64)]) -> Result<(), GeometryError> {
    if outline.len() < MIN_OUTLINE_POINTS {
        return Err(GeometryError::TooFewPoints(outline.len()));
    }

    for (index, &(x, y)) in outline.iter().enumerate() {
        if !x.is_finite() || !y.is_finite() {
            return Err(GeometryError::NonFinite { index, x, y });
        }
    }

    Ok(())
}

/// Containment test prepared from a single outline.
///
/// The outline is closed implicitly (last vertex joins the first). Interior
/// points are decided by the even-odd rule, so a self-intersecting outline
/// treats doubly-covered regions as outside. Points lying exactly on an edge
/// or vertex are never contained.
pub struct OutlinePath {
    polygon: Polygon<f64>,
    bounds: Rect<f64>,
}

impl OutlinePath {
    pub fn new(outline: &[(f64, f64)]) -> Result<Self, GeometryError> {
        validate_outline(outline)?;

        let polygon = Polygon::new(LineString::from(outline.to_vec()), Vec::new());
        let bounds = polygon
            .bounding_rect()
            .ok_or(GeometryError::TooFewPoints(outline.len()))?;

        Ok(OutlinePath { polygon, bounds })
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        let (min, max) = (self.bounds.min(), self.bounds.max());
        if x <= min.x || x >= max.x || y <= min.y || y >= max.y {
            return false;
        }

        let coord = Coord { x, y };
        if self.polygon.coordinate_position(&coord) == CoordPos::OnBoundary {
            return false;
        }

        even_odd_inside(self.polygon.exterior(), coord)
    }
}

// Cast a ray towards +x and count edge crossings.
fn even_odd_inside(ring: &LineString<f64>, p: Coord<f64>) -> bool {
    let mut inside = false;
    for line in ring.lines() {
        let (a, b) = (line.start, line.end);
        if (a.y > p.y) != (b.y > p.y) {
            let xcross = a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y);
            if p.x < xcross {
                inside = !inside;
            }
        }
    }
    inside
}
