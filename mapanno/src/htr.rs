//! Merging handwritten-text-recognition output back into text-spotting
//! annotation pages.

use std::collections::HashMap;

use log::debug;
use thiserror::Error;

use crate::annotation::{AnnotationPage, Generator, TextualBody};

pub const LOGHI_GENERATOR_ID: &str = "https://hdl.handle.net/10622/X2JZYY";
pub const LOGHI_GENERATOR_LABEL: &str =
    "GLOBALISE Loghi Handwritten Text Recognition Model - August 2023";

#[derive(Debug, Error, PartialEq)]
pub enum HtrError {
    #[error("line {line}: expected path, confidence and text separated by tabs")]
    MissingField { line: usize },

    #[error("line {line}: invalid confidence '{value}'")]
    InvalidConfidence { line: usize, value: String },
}

/// One line of an HTR `results.tsv`.
#[derive(Debug, Clone, PartialEq)]
pub struct HtrResult {
    /// Annotation id: file stem of the snippet path.
    pub id: String,
    pub confidence: f32,
    /// Recognised text, trimmed; `None` when the recogniser produced nothing.
    pub text: Option<String>,
}

pub fn loghi_generator() -> Generator {
    Generator {
        label: Some(LOGHI_GENERATOR_LABEL.to_string()),
        ..Generator::software(LOGHI_GENERATOR_ID)
    }
}

fn snippet_id(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.strip_suffix(".png").unwrap_or(name)
}

/// Parse `path \t confidence \t text` lines. Blank lines are skipped.
pub fn parse_results(tsv: &str) -> Result<Vec<HtrResult>, HtrError> {
    let mut results = Vec::new();
    for (i, line) in tsv.lines().enumerate() {
        let line_no = i + 1;
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.splitn(3, '\t');
        let (Some(path), Some(confidence)) = (fields.next(), fields.next()) else {
            return Err(HtrError::MissingField { line: line_no });
        };
        let confidence = confidence
            .trim()
            .parse()
            .map_err(|_| HtrError::InvalidConfidence {
                line: line_no,
                value: confidence.to_string(),
            })?;
        let text = fields
            .next()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        results.push(HtrResult {
            id: snippet_id(path.trim()).to_string(),
            confidence,
            text,
        });
    }
    Ok(results)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HtrMerge {
    pub transcribed: usize,
    pub dropped: usize,
}

/// Append a supplementing text body to every annotation with a transcription
/// and drop the rest from the page. The first result for an id wins.
pub fn attach_transcriptions(
    page: &mut AnnotationPage,
    results: &[HtrResult],
    generator: &Generator,
) -> HtrMerge {
    let mut by_id: HashMap<&str, &HtrResult> = HashMap::new();
    for r in results {
        by_id.entry(r.id.as_str()).or_insert(r);
    }

    let before = page.items.len();
    page.items.retain_mut(|annotation| {
        let Some(text) = by_id
            .get(annotation.id.as_str())
            .and_then(|r| r.text.as_deref())
        else {
            return false;
        };
        debug!("{}: {text}", annotation.id);
        annotation
            .body
            .push(TextualBody::supplementing(text, Some(generator.clone())));
        true
    });

    HtrMerge {
        transcribed: page.items.len(),
        dropped: before - page.items.len(),
    }
}
