//! Georeferencing annotations fetched from Allmaps, re-pointed at manifest
//! canvases.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::manifest::{set_target_source, LanguageMap, ManifestError};

pub const ALLMAPS_ANNOTATIONS_URL: &str = "https://annotations.allmaps.org/";

/// One image to fetch georeferencing for.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GeorefEntry {
    pub identifier: String,
    pub iiif_info_url: String,
    pub canvas_id: String,
}

/// Manifest the re-pointed canvases are `partOf`.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestRef {
    pub id: String,
    pub label: Option<LanguageMap>,
}

pub fn page_id(prefix: &str, identifier: &str) -> String {
    format!("{prefix}annotations/georeferencing/{identifier}.json")
}

fn canvas_source(canvas_id: &str, manifest: &ManifestRef) -> Value {
    let mut part_of = json!({ "id": manifest.id, "type": "Manifest" });
    if let Some(label) = &manifest.label {
        part_of["label"] = json!(label);
    }
    json!({ "id": canvas_id, "type": "Canvas", "partOf": part_of })
}

/// Point every annotation of a fetched page at the entry's canvas and give
/// the page its published id.
pub fn retarget_page(
    mut page: Value,
    entry: &GeorefEntry,
    manifest: &ManifestRef,
    prefix: &str,
) -> Result<Value, ManifestError> {
    set_target_source(&mut page, &canvas_source(&entry.canvas_id, manifest))?;
    let Value::Object(fields) = &mut page else {
        return Err(ManifestError::NotAPage);
    };
    fields.insert(
        "id".to_string(),
        Value::String(page_id(prefix, &entry.identifier)),
    );
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> GeorefEntry {
        GeorefEntry {
            identifier: "W37".to_string(),
            iiif_info_url: "https://iiif.example.org/W37/info.json".to_string(),
            canvas_id: "https://example.org/canvas/W37".to_string(),
        }
    }

    fn manifest() -> ManifestRef {
        ManifestRef {
            id: "https://example.org/manifest.json".to_string(),
            label: Some(LanguageMap::from([(
                "en".to_string(),
                vec!["Maps".to_string()],
            )])),
        }
    }

    #[test]
    fn page_id_layout() {
        assert_eq!(
            page_id("https://example.org/site/", "W37"),
            "https://example.org/site/annotations/georeferencing/W37.json"
        );
    }

    #[test]
    fn retarget_fetched_page() {
        let fetched = json!({
            "id": "https://annotations.allmaps.org/maps/abc",
            "type": "AnnotationPage",
            "items": [{
                "type": "Annotation",
                "motivation": "georeferencing",
                "target": {
                    "type": "SpecificResource",
                    "source": {"id": "https://iiif.example.org/W37", "type": "ImageService2"},
                    "selector": {"type": "SvgSelector", "value": "<svg/>"}
                }
            }]
        });
        let page = retarget_page(fetched, &entry(), &manifest(), "https://example.org/site/").unwrap();
        assert_eq!(page["id"], "https://example.org/site/annotations/georeferencing/W37.json");
        assert_eq!(page["type"], "AnnotationPage");
        let source = &page["items"][0]["target"]["source"];
        assert_eq!(source["id"], "https://example.org/canvas/W37");
        assert_eq!(source["type"], "Canvas");
        assert_eq!(source["partOf"]["id"], "https://example.org/manifest.json");
        assert_eq!(source["partOf"]["label"]["en"][0], "Maps");
        assert_eq!(page["items"][0]["target"]["selector"]["type"], "SvgSelector");
    }

    #[test]
    fn non_page_responses_are_rejected() {
        let bodies = [
            json!({"type": "AnnotationPage"}),
            json!({"items": [{"type": "Annotation"}]}),
            json!([1, 2]),
        ];
        for body in bodies {
            assert!(
                retarget_page(body.clone(), &entry(), &manifest(), "https://example.org/").is_err(),
                "{body}"
            );
        }
    }

    #[test]
    fn entries_from_json() {
        let entries: Vec<GeorefEntry> = serde_json::from_str(
            r#"[{"identifier": "W37", "iiif_info_url": "https://iiif.example.org/W37/info.json",
                 "canvas_id": "https://example.org/canvas/W37"}]"#,
        )
        .unwrap();
        assert_eq!(entries, vec![entry()]);
    }
}
