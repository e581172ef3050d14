use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::document::{
    deep_merge, restore_sections, FileContents, FileEntry, Mode, Sections, UnitEntry,
};
use crate::document::Document;
use crate::engine::TemplateEngine;
use crate::error::{TranspileError, Warning};
use crate::filesystem::{ContentKind, SourceRoots};

/// Governed entities of one precedence level, keyed by identity.
/// Within a level a duplicate identity is a conflict; across levels the
/// higher level replaces the lower.
#[derive(Debug, Clone, Default)]
pub struct SectionMaps {
    pub directories: BTreeMap<String, crate::document::DirectoryEntry>,
    pub links: BTreeMap<String, crate::document::LinkEntry>,
    pub files: BTreeMap<String, FileEntry>,
    pub trees: BTreeMap<String, crate::document::TreeEntry>,
    pub units: BTreeMap<String, UnitEntry>,
}

/// One precedence level: its label (for error messages), the raw
/// remainder of its tree, and its governed entities.
#[derive(Debug, Clone, Default)]
pub struct Level {
    pub label: String,
    pub raw: Document,
    pub maps: SectionMaps,
}

impl SectionMaps {
    /// Fold one fragment's sections into this level, refusing duplicate
    /// identities at the same precedence.
    pub fn absorb(&mut self, sections: Sections, source_path: &str) -> Result<(), TranspileError> {
        fn put<T>(
            map: &mut BTreeMap<String, T>,
            key: String,
            value: T,
            identity: &str,
            source_path: &str,
        ) -> Result<(), TranspileError> {
            if map.contains_key(&key) {
                return Err(TranspileError::MergeConflict {
                    source_path: source_path.to_string(),
                    identity: format!("{} {}", identity, key),
                });
            }
            map.insert(key, value);
            Ok(())
        }

        for entry in sections.directories {
            put(
                &mut self.directories,
                entry.path.clone(),
                entry,
                "storage.directories",
                source_path,
            )?;
        }
        for entry in sections.links {
            put(&mut self.links, entry.path.clone(), entry, "storage.links", source_path)?;
        }
        for entry in sections.files {
            put(&mut self.files, entry.path.clone(), entry, "storage.files", source_path)?;
        }
        for entry in sections.trees {
            put(&mut self.trees, entry.path.clone(), entry, "storage.trees", source_path)?;
        }
        for entry in sections.units {
            put(&mut self.units, entry.name.clone(), entry, "systemd.units", source_path)?;
        }
        Ok(())
    }

    /// Replace entities with those of a higher precedence level. Units
    /// keep lower-precedence dropins whose name the winner does not
    /// redefine.
    fn override_with(&mut self, higher: SectionMaps) {
        self.directories.extend(higher.directories);
        self.links.extend(higher.links);
        self.files.extend(higher.files);
        self.trees.extend(higher.trees);
        for (name, mut unit) in higher.units {
            if let Some(lower) = self.units.remove(&name) {
                for dropin in lower.dropins {
                    if !unit.dropins.iter().any(|d| d.name == dropin.name) {
                        unit.dropins.push(dropin);
                    }
                }
            }
            self.units.insert(name, unit);
        }
    }
}

/// Merge the levels lowest-precedence first. The raw remainders deep
/// merge mapping-wise; the governed entities merge by identity.
pub fn merge_levels(levels: Vec<Level>) -> (Document, SectionMaps) {
    let mut levels = levels.into_iter();
    let mut base = levels.next().unwrap_or_default();
    for level in levels {
        trace!("Merging level {} over {}", level.label, base.label);
        deep_merge(&mut base.raw, level.raw);
        base.maps.override_with(level.maps);
    }
    (base.raw, base.maps)
}

/// Replace every tree entry by one file entry per file under its local
/// directory. Paths join lexicographically so the emitted set depends
/// only on directory contents. Explicitly authored file entries keep
/// their path.
pub fn expand_trees(maps: &mut SectionMaps, roots: &SourceRoots) -> Result<(), TranspileError> {
    use std::os::unix::fs::PermissionsExt;

    let trees = std::mem::take(&mut maps.trees);
    for (_, tree) in trees {
        let wanted_by = format!("storage.trees {}", tree.path);
        let dir = roots.resolve_local_dir(&tree.local, &wanted_by)?;
        for relative in crate::filesystem::walk_files(&dir)? {
            let target = format!("{}/{}", tree.path.trim_end_matches('/'), relative);
            if maps.files.contains_key(&target) {
                trace!("Tree {} skips {}: explicit file entry wins", tree.path, target);
                continue;
            }
            let source = dir.join(&relative);
            let metadata =
                std::fs::metadata(&source).map_err(|e| TranspileError::io(&tree.local, e))?;
            let executable = metadata.permissions().mode() & 0o111 != 0;
            maps.files.insert(
                target.clone(),
                FileEntry {
                    path: target,
                    mode: executable.then_some(Mode(0o755)),
                    contents: Some(FileContents {
                        local: Some(format!("{}/{}", tree.local.trim_end_matches('/'), relative)),
                        ..FileContents::default()
                    }),
                    ..FileEntry::default()
                },
            );
        }
    }
    Ok(())
}

/// Load every remaining `local:` reference. Text becomes inline
/// contents; binary becomes a base64 `data:` URI source. Unit and
/// dropin bodies must be text.
pub fn inline_locals(maps: &mut SectionMaps, roots: &SourceRoots) -> Result<(), TranspileError> {
    for file in maps.files.values_mut() {
        let Some(contents) = file.contents.as_mut() else {
            continue;
        };
        if let Some(reference) = contents.local.take() {
            let local = roots.resolve_local(&reference, &file.path)?;
            match local.kind {
                ContentKind::Text => contents.inline = Some(local.text(&file.path)?),
                ContentKind::Binary => {
                    contents.source =
                        Some(format!("data:;base64,{}", BASE64.encode(&local.bytes)));
                }
            }
        }
        if contents.inline.is_some() && contents.source.is_some() {
            return Err(TranspileError::emission(
                &file.path,
                "file entry carries both inline and source contents",
            ));
        }
    }

    for unit in maps.units.values_mut() {
        if let Some(reference) = unit.contents_local.take() {
            let wanted_by = format!("systemd.units {}", unit.name);
            unit.contents = Some(roots.resolve_local(&reference, &wanted_by)?.text(&wanted_by)?);
        }
        for dropin in &mut unit.dropins {
            if let Some(reference) = dropin.contents_local.take() {
                let wanted_by = format!("systemd.units {} dropin {}", unit.name, dropin.name);
                dropin.contents =
                    Some(roots.resolve_local(&reference, &wanted_by)?.text(&wanted_by)?);
            }
        }
    }
    Ok(())
}

/// Whether a template marker means "run the second pass". Two authoring
/// conventions are accepted; anything else warns and is skipped.
fn marker_is_jinja(marker: &str, wanted_by: &str, warnings: &mut Vec<Warning>) -> bool {
    match marker {
        "jinja" | "jinja2" | "template=jinja" => true,
        other => {
            warnings.push(Warning::new(
                wanted_by,
                format!("unrecognized template marker {:?}, contents left verbatim", other),
            ));
            false
        }
    }
}

/// Re-render contents that carry a template marker against the merged
/// environment. Markers never survive into the output.
pub fn second_pass(
    maps: &mut SectionMaps,
    engine: &TemplateEngine,
    warnings: &mut Vec<Warning>,
) -> Result<(), TranspileError> {
    for file in maps.files.values_mut() {
        let Some(contents) = file.contents.as_mut() else {
            continue;
        };
        if let Some(marker) = contents.template.take() {
            if !marker_is_jinja(&marker, &file.path, warnings) {
                continue;
            }
            match contents.inline.take() {
                Some(body) => {
                    let label = format!("{}#contents", file.path);
                    contents.inline = Some(engine.render(&label, &body)?);
                }
                None => warnings.push(Warning::new(
                    &file.path,
                    "template marker on contents without an inline body",
                )),
            }
        }
    }

    for unit in maps.units.values_mut() {
        if let Some(marker) = unit.template.take() {
            let wanted_by = format!("systemd.units {}", unit.name);
            if marker_is_jinja(&marker, &wanted_by, warnings) {
                if let Some(body) = unit.contents.take() {
                    unit.contents = Some(engine.render(&wanted_by, &body)?);
                } else {
                    warnings.push(Warning::new(&wanted_by, "template marker on empty unit body"));
                }
            }
        }
        for dropin in &mut unit.dropins {
            if let Some(marker) = dropin.template.take() {
                let wanted_by = format!("systemd.units {} dropin {}", unit.name, dropin.name);
                if marker_is_jinja(&marker, &wanted_by, warnings) {
                    if let Some(body) = dropin.contents.take() {
                        dropin.contents = Some(engine.render(&wanted_by, &body)?);
                    } else {
                        warnings.push(Warning::new(
                            &wanted_by,
                            "template marker on empty dropin body",
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}

fn ownership_warnings(maps: &SectionMaps, warnings: &mut Vec<Warning>) {
    let mut check = |owner: &Option<crate::document::Ownership>, what: &str| {
        if owner.as_ref().is_some_and(|o| o.carries_both()) {
            warnings.push(Warning::new(
                what,
                "ownership carries both id and name; name wins",
            ));
        }
    };
    for file in maps.files.values() {
        check(&file.user, &file.path);
        check(&file.group, &file.path);
    }
    for dir in maps.directories.values() {
        check(&dir.user, &dir.path);
        check(&dir.group, &dir.path);
    }
    for link in maps.links.values() {
        check(&link.user, &link.path);
        check(&link.group, &link.path);
    }
}

/// Write the processed entities back into the raw tree, producing the
/// merged document and its final, sorted sections.
pub fn finish(
    mut raw: Document,
    maps: SectionMaps,
    warnings: &mut Vec<Warning>,
) -> Result<(Document, Sections), TranspileError> {
    ownership_warnings(&maps, warnings);

    let mut sections = Sections {
        directories: maps.directories.into_values().collect(),
        links: maps.links.into_values().collect(),
        files: maps.files.into_values().collect(),
        trees: maps.trees.into_values().collect(),
        units: maps.units.into_values().collect(),
    };
    for unit in &mut sections.units {
        unit.dropins.sort_by(|a, b| a.name.cmp(&b.name));
    }
    restore_sections(&mut raw, &sections)?;
    Ok((raw, sections))
}
