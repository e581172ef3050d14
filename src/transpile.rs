use serde_yaml::Value;

use crate::builder;
use crate::document::Document;
use crate::engine::TemplateEngine;
use crate::environment::{self, Environment};
use crate::error::{TranspileError, Warning};
use crate::filesystem::SourceRoots;
use crate::ignition;
use crate::merge;
use crate::reconciler;
use crate::security::SecurityBundle;

/// Everything one transpile run produces. The merged tree is exposed
/// read-only so collaborators can project fields out of it; warnings
/// ride along without failing the run.
#[derive(Debug)]
pub struct Artifacts {
    pub ignition_json: Vec<u8>,
    pub reconciler_program: String,
    pub merged_tree: Document,
    pub warnings: Vec<Warning>,
}

impl Artifacts {
    /// The `storage.luks[*].clevis` view the virtualization driver
    /// consumes to prepare matching volumes.
    pub fn luks_clevis(&self) -> Vec<&Value> {
        self.merged_tree
            .get("storage")
            .and_then(|s| s.get("luks"))
            .and_then(Value::as_sequence)
            .map(|luks| luks.iter().filter_map(|device| device.get("clevis")).collect())
            .unwrap_or_default()
    }
}

/// Derive both artifacts from the source roots. Pure: identical roots,
/// environment and file bytes give byte-identical output, and a failure
/// at any stage produces no artifact at all.
pub fn transpile(
    resource_id: &str,
    hostname: &str,
    security: &SecurityBundle,
    seed_document: &str,
    roots: &SourceRoots,
    overrides: &Environment,
) -> Result<Artifacts, TranspileError> {
    let mut warnings = Vec::new();

    debug!("Composing environment for {}...", hostname);
    let env = environment::compose(resource_id, hostname, overrides);
    let engine = TemplateEngine::new(roots.searchpath(), env);

    debug!("Building input documents...");
    let levels = builder::build_levels(&engine, roots, seed_document, security)?;

    debug!("Merging {} precedence levels...", levels.len());
    let (raw, mut maps) = merge::merge_levels(levels);

    debug!("Expanding trees and inlining local references...");
    merge::expand_trees(&mut maps, roots)?;
    merge::inline_locals(&mut maps, roots)?;
    merge::second_pass(&mut maps, &engine, &mut warnings)?;

    let (merged_tree, sections) = merge::finish(raw, maps, &mut warnings)?;
    trace!("Merged tree: {:#?}", merged_tree);

    debug!("Emitting Ignition JSON...");
    let ignition_json = ignition::emit(&merged_tree, &sections)?;

    debug!("Emitting reconciler program...");
    let reconciler_program = reconciler::emit(&merged_tree, &sections, roots)?;

    Ok(Artifacts {
        ignition_json,
        reconciler_program,
        merged_tree,
        warnings,
    })
}
