//! Web Annotation Data Model records, limited to the fields the pipeline reads
//! and writes.

use serde::{Deserialize, Serialize};

use crate::error::GeometryError;
use crate::geometry::Polygon;

pub const ANNO_CONTEXT: &str = "http://www.w3.org/ns/anno.jsonld";
pub const IIIF_CONTEXT: &str = "http://iiif.io/api/presentation/3/context.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Motivation {
    #[default]
    Segmenting,
    Textspotting,
}

/// Software agent credited in `generator` fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generator {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Generator {
    pub fn software(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: "Software".to_string(),
            label: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextualBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    pub format: String,
    pub purpose: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator: Option<Generator>,
}

impl TextualBody {
    /// Plain-text `supplementing` body.
    pub fn supplementing(value: impl Into<String>, generator: Option<Generator>) -> Self {
        Self {
            kind: "TextualBody".to_string(),
            value: value.into(),
            format: "text/plain".to_string(),
            purpose: "supplementing".to_string(),
            generator,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Selector {
    SvgSelector { value: String },
    PolygonSelector { points: Vec<String> },
}

impl Selector {
    pub fn svg(polygon: &Polygon) -> Self {
        Selector::SvgSelector {
            value: polygon.to_svg(),
        }
    }

    pub fn polygon(&self) -> Result<Polygon, GeometryError> {
        match self {
            Selector::SvgSelector { value } => Polygon::from_svg(value),
            Selector::PolygonSelector { points } => Polygon::from_point_strings(points),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub source: String,
    pub selector: Selector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator: Option<Generator>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(rename = "@context", default = "anno_context")]
    pub context: String,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub motivation: Motivation,
    #[serde(default)]
    pub body: Vec<TextualBody>,
    pub target: Target,
}

fn anno_context() -> String {
    ANNO_CONTEXT.to_string()
}

impl Annotation {
    pub fn new(
        id: impl Into<String>,
        motivation: Motivation,
        canvas_id: impl Into<String>,
        polygon: &Polygon,
        generator: Option<Generator>,
    ) -> Self {
        Self {
            context: anno_context(),
            id: id.into(),
            kind: "Annotation".to_string(),
            motivation,
            body: Vec::new(),
            target: Target {
                source: canvas_id.into(),
                selector: Selector::svg(polygon),
                generator,
            },
        }
    }

    /// Polygon of the target selector.
    pub fn polygon(&self) -> Result<Polygon, GeometryError> {
        self.target.selector.polygon()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationPage {
    #[serde(rename = "@context", default = "iiif_context")]
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub items: Vec<Annotation>,
}

fn iiif_context() -> String {
    IIIF_CONTEXT.to_string()
}

impl AnnotationPage {
    pub fn new(items: Vec<Annotation>) -> Self {
        Self {
            context: iiif_context(),
            id: None,
            kind: "AnnotationPage".to_string(),
            items,
        }
    }
}

/// Raw detector record kept in the per-tile output, in original-image coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub uuid: String,
    /// `[x, y, w, h]`.
    pub bbox: [f64; 4],
    pub area: f64,
    pub predicted_iou: f32,
    pub stability_score: f32,
    #[serde(default)]
    pub point_coords: Vec<[f64; 2]>,
}

/// Everything produced for one tile. `x`, `y`, `width`, `height` give the
/// tile's extent in original-image pixels; `f` is its scale factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileRecord {
    pub x: u32,
    pub y: u32,
    pub f: f64,
    pub width: u32,
    pub height: u32,
    pub results: Vec<RawRecord>,
    pub annotations: Vec<Annotation>,
}

/// Per-image raw output before deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub image: String,
    pub width: u32,
    pub height: u32,
    pub cutouts: Vec<TileRecord>,
}

impl ImageRecord {
    /// All annotations in tile order, paired with their tile's scale factor.
    pub fn scaled_annotations(&self) -> impl Iterator<Item = (f64, &Annotation)> + '_ {
        self.cutouts
            .iter()
            .flat_map(|c| c.annotations.iter().map(move |a| (c.f, a)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Polygon {
        Polygon::new(vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]]).unwrap()
    }

    #[test]
    fn annotation_json_shape() {
        let a = Annotation::new(
            "abc",
            Motivation::Segmenting,
            "canvas:map1",
            &square(),
            Some(Generator::software("segmentanything")),
        );
        let v = serde_json::to_value(&a).unwrap();
        assert_eq!(v["@context"], ANNO_CONTEXT);
        assert_eq!(v["type"], "Annotation");
        assert_eq!(v["motivation"], "segmenting");
        assert_eq!(v["target"]["source"], "canvas:map1");
        assert_eq!(v["target"]["selector"]["type"], "SvgSelector");
        assert_eq!(v["target"]["generator"]["type"], "Software");
        assert!(v["body"].as_array().unwrap().is_empty());
    }

    #[test]
    fn annotation_round_trips_polygon() {
        let a = Annotation::new("x", Motivation::Textspotting, "c", &square(), None);
        let json = serde_json::to_string(&a).unwrap();
        let back: Annotation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.polygon().unwrap(), square());
        assert_eq!(back.motivation, Motivation::Textspotting);
    }

    #[test]
    fn polygon_selector_is_accepted() {
        let json = r#"{
            "id": "p1",
            "type": "Annotation",
            "motivation": "segmenting",
            "target": {
                "source": "canvas:1",
                "selector": { "type": "PolygonSelector", "points": ["0,0", "4,0", "4,4", "0,0"] }
            }
        }"#;
        let a: Annotation = serde_json::from_str(json).unwrap();
        assert_eq!(a.context, ANNO_CONTEXT);
        assert_eq!(a.polygon().unwrap().len(), 3);
    }

    #[test]
    fn broken_selector_reports_geometry_error() {
        let json = r#"{
            "id": "p1",
            "type": "Annotation",
            "motivation": "segmenting",
            "target": { "source": "c", "selector": { "type": "SvgSelector", "value": "<svg/>" } }
        }"#;
        let a: Annotation = serde_json::from_str(json).unwrap();
        assert_eq!(a.polygon(), Err(GeometryError::MissingPolygon));
    }

    #[test]
    fn scaled_annotations_follow_tile_order() {
        let a = Annotation::new("a", Motivation::Segmenting, "c", &square(), None);
        let b = Annotation::new("b", Motivation::Segmenting, "c", &square(), None);
        let tile = |f: f64, annotations| TileRecord {
            x: 0,
            y: 0,
            f,
            width: 10,
            height: 10,
            results: vec![],
            annotations,
        };
        let record = ImageRecord {
            image: "m.jpg".into(),
            width: 10,
            height: 10,
            cutouts: vec![tile(1.0, vec![a]), tile(0.5, vec![b])],
        };
        let got: Vec<(f64, &str)> = record
            .scaled_annotations()
            .map(|(f, a)| (f, a.id.as_str()))
            .collect();
        assert_eq!(got, vec![(1.0, "a"), (0.5, "b")]);
    }
}
