use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::TranspileError;

/// A parsed source document. Top level is a YAML mapping; the governed
/// entity classes below are pulled out of it for merging and put back,
/// normalized, afterwards. Everything else passes through untouched.
pub type Document = Value;

/// A file mode. Authors write either a YAML integer (taken as the
/// decimal value Ignition expects) or an octal string such as `"0644"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Mode(pub i64);

impl Mode {
    pub fn octal(&self) -> String {
        format!("{:04o}", self.0)
    }
}

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct ModeVisitor;

        impl serde::de::Visitor<'_> for ModeVisitor {
            type Value = Mode;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("an integer or an octal string")
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Mode, E> {
                Ok(Mode(v))
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Mode, E> {
                Ok(Mode(v as i64))
            }

            fn visit_str<E: serde::de::Error>(self, s: &str) -> Result<Mode, E> {
                let digits = s.trim_start_matches("0o");
                i64::from_str_radix(digits, 8)
                    .map(Mode)
                    .map_err(|_| E::custom(format!("invalid octal mode {:?}", s)))
            }
        }

        deserializer.deserialize_any(ModeVisitor)
    }
}

/// File/directory/link ownership; either a numeric id or a name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ownership {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Ownership {
    pub fn carries_both(&self) -> bool {
        self.id.is_some() && self.name.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// The body of a file entry. Before inlining exactly one of `inline`,
/// `source` or `local` is expected; afterwards `local` and `template`
/// are gone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileContents {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty", default)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<Ownership>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<Ownership>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overwrite: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contents: Option<FileContents>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty", default)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<Ownership>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<Ownership>,
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty", default)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkEntry {
    pub path: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hard: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<Ownership>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<Ownership>,
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty", default)]
    pub extra: BTreeMap<String, Value>,
}

/// Shorthand for one file entry per file under a local directory.
/// Fully expanded during the merge; never survives into the output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    pub local: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DropinEntry {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contents_local: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitEntry {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contents_local: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub dropins: Vec<DropinEntry>,
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty", default)]
    pub extra: BTreeMap<String, Value>,
}

/// The governed entity classes of one document, pulled out of the raw
/// tree. Vec order is author order; identity ordering is imposed when
/// the merged set is written back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sections {
    pub directories: Vec<DirectoryEntry>,
    pub links: Vec<LinkEntry>,
    pub files: Vec<FileEntry>,
    pub trees: Vec<TreeEntry>,
    pub units: Vec<UnitEntry>,
}

/// Remove the governed sections from `doc` and parse them. The rest of
/// the tree stays behind for the raw deep-merge.
pub fn take_sections(doc: &mut Document, source_path: &str) -> Result<Sections, TranspileError> {
    let mut sections = Sections::default();
    if doc.is_null() {
        *doc = Value::Mapping(serde_yaml::Mapping::new());
        return Ok(sections);
    }
    let mapping = doc
        .as_mapping_mut()
        .ok_or_else(|| TranspileError::YamlParse {
            source_path: source_path.to_string(),
            message: "document is not a mapping".to_string(),
        })?;

    if let Some(storage) = mapping.get_mut("storage").and_then(Value::as_mapping_mut) {
        sections.directories = take_list(storage, "directories", source_path)?;
        sections.links = take_list(storage, "links", source_path)?;
        sections.files = take_list(storage, "files", source_path)?;
        sections.trees = take_list(storage, "trees", source_path)?;
    }
    if let Some(systemd) = mapping.get_mut("systemd").and_then(Value::as_mapping_mut) {
        sections.units = take_list(systemd, "units", source_path)?;
    }
    Ok(sections)
}

fn take_list<T: serde::de::DeserializeOwned>(
    mapping: &mut serde_yaml::Mapping,
    key: &str,
    source_path: &str,
) -> Result<Vec<T>, TranspileError> {
    match mapping.remove(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_yaml::from_value(value).map_err(|e| TranspileError::YamlParse {
            source_path: source_path.to_string(),
            message: format!("{}: {}", key, e),
        }),
    }
}

/// Write the normalized sections back into the tree, sorted by their
/// identity keys. Trees must be fully expanded by now.
pub fn restore_sections(doc: &mut Document, sections: &Sections) -> Result<(), TranspileError> {
    if !sections.trees.is_empty() {
        return Err(TranspileError::emission(
            "<merged>",
            "tree entries survived expansion",
        ));
    }
    let mapping = doc
        .as_mapping_mut()
        .ok_or_else(|| TranspileError::emission("<merged>", "merged document is not a mapping"))?;

    let mut sorted = sections.clone();
    sorted.directories.sort_by(|a, b| a.path.cmp(&b.path));
    sorted.links.sort_by(|a, b| a.path.cmp(&b.path));
    sorted.files.sort_by(|a, b| a.path.cmp(&b.path));
    sorted.units.sort_by(|a, b| a.name.cmp(&b.name));
    for unit in &mut sorted.units {
        unit.dropins.sort_by(|a, b| a.name.cmp(&b.name));
    }

    let storage = submapping(mapping, "storage");
    insert_list(storage, "directories", &sorted.directories)?;
    insert_list(storage, "links", &sorted.links)?;
    insert_list(storage, "files", &sorted.files)?;
    if storage.is_empty() {
        mapping.remove("storage");
    }
    let systemd = submapping(mapping, "systemd");
    insert_list(systemd, "units", &sorted.units)?;
    if systemd.is_empty() {
        mapping.remove("systemd");
    }
    Ok(())
}

fn submapping<'a>(mapping: &'a mut serde_yaml::Mapping, key: &str) -> &'a mut serde_yaml::Mapping {
    let entry = mapping
        .entry(Value::from(key))
        .or_insert_with(|| Value::Mapping(serde_yaml::Mapping::new()));
    if !entry.is_mapping() {
        *entry = Value::Mapping(serde_yaml::Mapping::new());
    }
    entry.as_mapping_mut().expect("just ensured a mapping")
}

fn insert_list<T: Serialize>(
    mapping: &mut serde_yaml::Mapping,
    key: &str,
    entries: &[T],
) -> Result<(), TranspileError> {
    if entries.is_empty() {
        return Ok(());
    }
    let value = serde_yaml::to_value(entries)
        .map_err(|e| TranspileError::emission("<merged>", e.to_string()))?;
    mapping.insert(Value::from(key), value);
    Ok(())
}

/// Recursive mapping merge; any non-mapping value in `src` replaces the
/// destination wholesale.
pub fn deep_merge(dest: &mut Value, src: Value) {
    match (dest, src) {
        (Value::Mapping(dest_map), Value::Mapping(src_map)) => {
            for (key, value) in src_map {
                match dest_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        dest_map.insert(key, value);
                    }
                }
            }
        }
        (dest_slot, src_value) => {
            *dest_slot = src_value;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mode_accepts_integers_and_octal_strings() {
        let m: Mode = serde_yaml::from_str("420").unwrap();
        assert_eq!(m, Mode(420));
        assert_eq!(m.octal(), "0644");

        let m: Mode = serde_yaml::from_str("\"0600\"").unwrap();
        assert_eq!(m, Mode(384));

        let m: Mode = serde_yaml::from_str("\"0o755\"").unwrap();
        assert_eq!(m, Mode(493));

        assert!(serde_yaml::from_str::<Mode>("\"rwxr-x\"").is_err());
    }

    #[test]
    fn take_and_restore_round_trip() {
        let mut doc: Document = serde_yaml::from_str(
            r#"
ignition:
  version: 3.4.0
storage:
  files:
    - path: /b
      contents:
        inline: two
    - path: /a
      contents:
        inline: one
  luks:
    - name: root
systemd:
  units:
    - name: b.service
      enabled: true
    - name: a.service
      enabled: false
"#,
        )
        .unwrap();

        let sections = take_sections(&mut doc, "<test>").unwrap();
        assert_eq!(sections.files.len(), 2);
        assert_eq!(sections.units.len(), 2);
        // luks stays behind in the raw tree
        assert!(doc["storage"]["luks"].is_sequence());
        assert!(doc["storage"].as_mapping().unwrap().get("files").is_none());

        restore_sections(&mut doc, &sections).unwrap();
        let files = doc["storage"]["files"].as_sequence().unwrap();
        assert_eq!(files[0]["path"], Value::from("/a"));
        assert_eq!(files[1]["path"], Value::from("/b"));
        let units = doc["systemd"]["units"].as_sequence().unwrap();
        assert_eq!(units[0]["name"], Value::from("a.service"));
    }

    #[test]
    fn restore_refuses_unexpanded_trees() {
        let mut doc: Document = serde_yaml::from_str("{}").unwrap();
        let sections = Sections {
            trees: vec![TreeEntry {
                path: "/x".into(),
                local: "fixtures".into(),
            }],
            ..Sections::default()
        };
        assert!(restore_sections(&mut doc, &sections).is_err());
    }

    #[test]
    fn unknown_entry_fields_round_trip() {
        let entries: Vec<FileEntry> = serde_yaml::from_str(
            r#"
- path: /a
  append:
    - inline: extra
"#,
        )
        .unwrap();
        assert!(entries[0].extra.contains_key("append"));
        let back = serde_yaml::to_value(&entries).unwrap();
        assert!(back[0]["append"].is_sequence());
    }

    #[test]
    fn deep_merge_recurses_mappings_only() {
        let mut dest: Value = serde_yaml::from_str("{a: {x: 1, y: 2}, list: [1, 2]}").unwrap();
        let src: Value = serde_yaml::from_str("{a: {y: 3}, list: [9]}").unwrap();
        deep_merge(&mut dest, src);
        assert_eq!(dest["a"]["x"], Value::from(1));
        assert_eq!(dest["a"]["y"], Value::from(3));
        assert_eq!(dest["list"].as_sequence().unwrap().len(), 1);
    }
}
