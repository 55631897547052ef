use geo::{Area, BooleanOps, Coord, LineString, Polygon as GeoPolygon};

use crate::error::GeometryError;

/// A point in pixel coordinates, `[x, y]`.
pub type Point = [f64; 2];

const SVG_NS: &str = "http://www.w3.org/2000/svg";

/// Axis-aligned bounding box with inclusive corners `(x1, y1)`–`(x2, y2)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from the COCO `[x, y, w, h]` convention.
    pub fn from_xywh(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self::new(x, y, x + w, y + h)
    }

    /// Tight box around a point set, `None` if the set is empty.
    pub fn from_points(points: &[Point]) -> Option<Self> {
        let first = points.first()?;
        let mut b = Self::new(first[0], first[1], first[0], first[1]);
        for p in &points[1..] {
            b.x1 = b.x1.min(p[0]);
            b.y1 = b.y1.min(p[1]);
            b.x2 = b.x2.max(p[0]);
            b.y2 = b.y2.max(p[1]);
        }
        Some(b)
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    /// COCO `[x, y, w, h]` form.
    pub fn to_xywh(&self) -> [f64; 4] {
        [self.x1, self.y1, self.width(), self.height()]
    }

    /// True if the closed boxes share at least one point.
    pub fn intersects(&self, other: &BBox) -> bool {
        self.x1 <= other.x2 && other.x1 <= self.x2 && self.y1 <= other.y2 && other.y1 <= self.y2
    }
}

/// Simple polygon stored as an open ring.
///
/// The closing point is implicit: constructors strip a trailing copy of the
/// first point and collapse consecutive duplicates.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    points: Vec<Point>,
}

impl Polygon {
    pub fn new(points: Vec<Point>) -> Result<Self, GeometryError> {
        if points.iter().any(|p| !p[0].is_finite() || !p[1].is_finite()) {
            return Err(GeometryError::NonFinite);
        }

        let mut ring: Vec<Point> = Vec::with_capacity(points.len());
        for p in points {
            if ring.last() != Some(&p) {
                ring.push(p);
            }
        }
        while ring.len() > 1 && ring.first() == ring.last() {
            ring.pop();
        }

        if ring.len() < 3 {
            return Err(GeometryError::TooFewPoints(ring.len()));
        }
        Ok(Self { points: ring })
    }

    /// Parse a whitespace-separated `"x,y x,y ..."` list (the SVG `points` syntax).
    pub fn parse_point_list(s: &str) -> Result<Self, GeometryError> {
        let points = s
            .split_whitespace()
            .map(parse_point)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(points)
    }

    /// Parse a list of `"x,y"` strings.
    pub fn from_point_strings<S: AsRef<str>>(items: &[S]) -> Result<Self, GeometryError> {
        let points = items
            .iter()
            .map(|s| parse_point(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(points)
    }

    /// Extract the first `<polygon points="...">` element of an SVG fragment.
    pub fn from_svg(svg: &str) -> Result<Self, GeometryError> {
        let start = svg.find("<polygon").ok_or(GeometryError::MissingPolygon)?;
        let element = &svg[start..];
        let element = &element[..element.find('>').ok_or(GeometryError::MissingPolygon)?];

        let attr = element
            .find("points=")
            .ok_or(GeometryError::MissingPolygon)?;
        let rest = &element[attr + "points=".len()..];
        let quote = rest.chars().next().ok_or(GeometryError::MissingPolygon)?;
        if quote != '"' && quote != '\'' {
            return Err(GeometryError::MissingPolygon);
        }
        let value = &rest[1..];
        let end = value.find(quote).ok_or(GeometryError::MissingPolygon)?;
        Self::parse_point_list(&value[..end])
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The ring with the first point repeated at the end.
    pub fn closed_ring(&self) -> impl Iterator<Item = Point> + '_ {
        self.points.iter().copied().chain(std::iter::once(self.points[0]))
    }

    /// Closed ring as integer `"x,y"` strings.
    pub fn to_point_strings(&self) -> Vec<String> {
        self.closed_ring()
            .map(|p| format!("{},{}", p[0] as i64, p[1] as i64))
            .collect()
    }

    /// SVG fragment holding this polygon as a closed `<polygon>`.
    pub fn to_svg(&self) -> String {
        format!(
            "<svg xmlns=\"{SVG_NS}\"><polygon points=\"{}\" /></svg>",
            self.to_point_strings().join(" ")
        )
    }

    pub fn bbox(&self) -> BBox {
        // Non-empty by construction.
        BBox::from_points(&self.points).unwrap_or(BBox::new(0.0, 0.0, 0.0, 0.0))
    }

    pub fn to_geo(&self) -> GeoPolygon<f64> {
        let coords: Vec<Coord<f64>> = self
            .points
            .iter()
            .map(|p| Coord { x: p[0], y: p[1] })
            .collect();
        GeoPolygon::new(LineString::from(coords), vec![])
    }

    pub fn area(&self) -> f64 {
        self.to_geo().unsigned_area()
    }

    pub fn intersection_area(&self, other: &Polygon) -> f64 {
        intersection_area(&self.to_geo(), &other.to_geo())
    }

    pub fn union_area(&self, other: &Polygon) -> f64 {
        let (a, b) = (self.to_geo(), other.to_geo());
        a.unsigned_area() + b.unsigned_area() - intersection_area(&a, &b)
    }

    pub fn iou(&self, other: &Polygon) -> f64 {
        iou(&self.to_geo(), &other.to_geo())
    }
}

fn parse_point(s: &str) -> Result<Point, GeometryError> {
    let invalid = || GeometryError::InvalidPoint(s.to_string());
    let (x, y) = s.split_once(',').ok_or_else(invalid)?;
    let x: f64 = x.trim().parse().map_err(|_| invalid())?;
    let y: f64 = y.trim().parse().map_err(|_| invalid())?;
    if !x.is_finite() || !y.is_finite() {
        return Err(GeometryError::NonFinite);
    }
    Ok([x, y])
}

pub(crate) fn intersection_area(a: &GeoPolygon<f64>, b: &GeoPolygon<f64>) -> f64 {
    BooleanOps::intersection(a, b).unsigned_area()
}

/// Intersection over union of two polygons, 0 when the union is empty.
pub fn iou(a: &GeoPolygon<f64>, b: &GeoPolygon<f64>) -> f64 {
    iou_with_areas(a, a.unsigned_area(), b, b.unsigned_area())
}

/// [`iou`] with precomputed areas, for callers comparing many pairs.
pub(crate) fn iou_with_areas(a: &GeoPolygon<f64>, area_a: f64, b: &GeoPolygon<f64>, area_b: f64) -> f64 {
    let inter = intersection_area(a, b);
    let union = area_a + area_b - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
