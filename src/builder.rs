use std::fs;
use std::path::Path;

use crate::document::{take_sections, Document};
use crate::engine::TemplateEngine;
use crate::error::TranspileError;
use crate::filesystem::SourceRoots;
use crate::merge::Level;
use crate::security::{self, SecurityBundle};

pub const SEED_LABEL: &str = "<seed>";

/// Build the four input documents, lowest precedence first:
/// library, project, security, seed.
pub fn build_levels(
    engine: &TemplateEngine,
    roots: &SourceRoots,
    seed_document: &str,
    bundle: &SecurityBundle,
) -> Result<Vec<Level>, TranspileError> {
    debug!("Rendering seed document...");
    let seed = build_virtual(engine, SEED_LABEL, seed_document)?;
    debug!("Rendering security document...");
    let security = security::build(engine, bundle)?;
    debug!("Rendering library fragments...");
    let library = build_root(engine, roots, &roots.library, "library")?;
    debug!("Rendering project fragments...");
    let project = build_root(engine, roots, &roots.project, "project")?;

    Ok(vec![library, project, security, seed])
}

/// A document supplied as text by the caller rather than found on disk.
fn build_virtual(
    engine: &TemplateEngine,
    label: &str,
    source: &str,
) -> Result<Level, TranspileError> {
    let rendered = engine.render(label, source)?;
    let mut raw: Document =
        serde_yaml::from_str(&rendered).map_err(|e| TranspileError::YamlParse {
            source_path: label.to_string(),
            message: e.to_string(),
        })?;
    let sections = take_sections(&mut raw, label)?;
    let mut level = Level {
        label: label.to_string(),
        raw,
        ..Level::default()
    };
    level.maps.absorb(sections, label)?;
    Ok(level)
}

/// Render every structured template under `root` (sorted) and fold the
/// results into one precedence level. Fragment labels are prefixed so
/// errors name the root they came from.
fn build_root(
    engine: &TemplateEngine,
    roots: &SourceRoots,
    root: &Path,
    prefix: &str,
) -> Result<Level, TranspileError> {
    let mut level = Level {
        label: prefix.to_string(),
        raw: Document::Mapping(serde_yaml::Mapping::new()),
        ..Level::default()
    };

    for relative in roots.structured_templates(root)? {
        let label = format!("{}:{}", prefix, relative);
        trace!("Rendering fragment {}", label);
        let source = fs::read_to_string(root.join(&relative))
            .map_err(|e| TranspileError::io(&label, e))?;
        let rendered = engine.render(&label, &source)?;
        let mut fragment: Document =
            serde_yaml::from_str(&rendered).map_err(|e| TranspileError::YamlParse {
                source_path: label.clone(),
                message: e.to_string(),
            })?;
        let sections = take_sections(&mut fragment, &label)?;
        level.maps.absorb(sections, &label)?;
        crate::document::deep_merge(&mut level.raw, fragment);
    }
    Ok(level)
}
