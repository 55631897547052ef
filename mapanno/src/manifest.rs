//! IIIF Presentation 3 manifests and re-pointing annotation pages at the
//! canvases they belong to.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("canvas {0} has no Filename metadata")]
    MissingFilename(String),

    #[error("annotation page has no items array")]
    NotAPage,

    #[error("annotation {0} has no target object")]
    MissingTarget(usize),
}

/// Language map: language code (or `none`) to values.
pub type LanguageMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataEntry {
    pub label: LanguageMap,
    pub value: LanguageMap,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Canvas {
    pub id: String,
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
}

impl Canvas {
    /// First value of the metadata entry labelled `label` in any language.
    pub fn metadata_value(&self, label: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|m| m.label.values().flatten().any(|l| l == label))
            .and_then(|m| m.value.values().flatten().next())
            .map(String::as_str)
    }

    /// Scan name recorded under `Filename`, which names the annotation page.
    pub fn filename(&self) -> Result<&str, ManifestError> {
        self.metadata_value("Filename")
            .ok_or_else(|| ManifestError::MissingFilename(self.id.clone()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub id: String,
    #[serde(default)]
    pub label: Option<LanguageMap>,
    pub items: Vec<Canvas>,
}

impl Manifest {
    pub fn from_json_str(json: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(json)?)
    }
}

fn items_mut(page: &mut Value) -> Result<&mut Vec<Value>, ManifestError> {
    page.get_mut("items")
        .and_then(Value::as_array_mut)
        .ok_or(ManifestError::NotAPage)
}

/// Replace `target.source` of every annotation on the page. Unknown fields
/// are left untouched. Returns the number of annotations updated.
pub fn set_target_source(page: &mut Value, source: &Value) -> Result<usize, ManifestError> {
    let items = items_mut(page)?;
    for (i, item) in items.iter_mut().enumerate() {
        let target = item
            .get_mut("target")
            .and_then(Value::as_object_mut)
            .ok_or(ManifestError::MissingTarget(i))?;
        target.insert("source".to_string(), source.clone());
    }
    Ok(items.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MANIFEST: &str = r#"{
        "@context": "http://iiif.io/api/presentation/3/context.json",
        "id": "https://example.org/manifest.json",
        "type": "Manifest",
        "items": [
            {
                "id": "https://example.org/canvas/1",
                "type": "Canvas",
                "metadata": [
                    {"label": {"en": ["Title"]}, "value": {"none": ["Kaart van Batavia"]}},
                    {"label": {"en": ["Filename"]}, "value": {"none": ["NL-HaNA_4.VEL_1"]}}
                ]
            },
            {"id": "https://example.org/canvas/2", "type": "Canvas"}
        ]
    }"#;

    #[test]
    fn filename_from_metadata() {
        let manifest = Manifest::from_json_str(MANIFEST).unwrap();
        assert_eq!(manifest.items.len(), 2);
        assert_eq!(manifest.items[0].filename().unwrap(), "NL-HaNA_4.VEL_1");
        assert_eq!(
            manifest.items[0].metadata_value("Title"),
            Some("Kaart van Batavia")
        );
        assert!(matches!(
            manifest.items[1].filename(),
            Err(ManifestError::MissingFilename(id)) if id == "https://example.org/canvas/2"
        ));
    }

    #[test]
    fn retarget_keeps_other_fields() {
        let mut page = json!({
            "type": "AnnotationPage",
            "items": [
                {"id": "a", "target": {"source": "old", "selector": {"type": "SvgSelector"}}},
                {"id": "b", "target": {"source": "old"}, "extra": 1}
            ]
        });
        let n = set_target_source(&mut page, &json!("https://example.org/canvas/1")).unwrap();
        assert_eq!(n, 2);
        assert_eq!(page["items"][0]["target"]["source"], "https://example.org/canvas/1");
        assert_eq!(page["items"][0]["target"]["selector"]["type"], "SvgSelector");
        assert_eq!(page["items"][1]["extra"], 1);
    }

    #[test]
    fn retarget_rejects_non_pages() {
        assert!(matches!(
            set_target_source(&mut json!([1, 2]), &json!("c")),
            Err(ManifestError::NotAPage)
        ));
        assert!(matches!(
            set_target_source(&mut json!({"items": [{"id": "a"}]}), &json!("c")),
            Err(ManifestError::MissingTarget(0))
        ));
    }
}
