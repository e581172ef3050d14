use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::{json, Map, Value as Json};
use serde_yaml::Value as Yaml;

use crate::document::{
    DirectoryEntry, Document, FileEntry, LinkEntry, Ownership, Sections, UnitEntry,
};
use crate::error::TranspileError;

/// URL-safe encoding for inline `data:,` bodies: everything but the
/// unreserved characters is percent-encoded.
const DATA_URL: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub fn inline_data_url(body: &str) -> String {
    format!("data:,{}", utf8_percent_encode(body, DATA_URL))
}

/// Emit the Ignition JSON document. Entity categories translate
/// one-to-one; only encodings are normalized. Unknown sections and
/// unknown per-entry fields pass through unchanged.
pub fn emit(tree: &Document, sections: &Sections) -> Result<Vec<u8>, TranspileError> {
    let mut root = match yaml_to_json(tree, "<merged>")? {
        Json::Object(map) => map,
        Json::Null => Map::new(),
        _ => {
            return Err(TranspileError::emission(
                "<merged>",
                "merged document is not a mapping",
            ))
        }
    };

    let mut storage = match root.remove("storage") {
        Some(Json::Object(map)) => map,
        _ => Map::new(),
    };
    storage.remove("directories");
    storage.remove("links");
    storage.remove("files");

    let mut directories: Vec<&DirectoryEntry> = sections.directories.iter().collect();
    directories.sort_by(|a, b| a.path.cmp(&b.path));
    if !directories.is_empty() {
        let rendered: Result<Vec<Json>, _> =
            directories.into_iter().map(directory_to_json).collect();
        storage.insert("directories".into(), Json::Array(rendered?));
    }

    let mut links: Vec<&LinkEntry> = sections.links.iter().collect();
    links.sort_by(|a, b| a.path.cmp(&b.path));
    if !links.is_empty() {
        let rendered: Result<Vec<Json>, _> = links.into_iter().map(link_to_json).collect();
        storage.insert("links".into(), Json::Array(rendered?));
    }

    let mut files: Vec<&FileEntry> = sections.files.iter().collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    if !files.is_empty() {
        let rendered: Result<Vec<Json>, _> = files.into_iter().map(file_to_json).collect();
        storage.insert("files".into(), Json::Array(rendered?));
    }

    if !storage.is_empty() {
        root.insert("storage".into(), Json::Object(storage));
    }

    let mut systemd = match root.remove("systemd") {
        Some(Json::Object(map)) => map,
        _ => Map::new(),
    };
    systemd.remove("units");
    let mut units: Vec<&UnitEntry> = sections.units.iter().collect();
    units.sort_by(|a, b| a.name.cmp(&b.name));
    if !units.is_empty() {
        let rendered: Result<Vec<Json>, _> = units.into_iter().map(unit_to_json).collect();
        systemd.insert("units".into(), Json::Array(rendered?));
    }
    if !systemd.is_empty() {
        root.insert("systemd".into(), Json::Object(systemd));
    }

    serde_json::to_vec(&Json::Object(root))
        .map_err(|e| TranspileError::emission("<ignition>", e.to_string()))
}

fn ownership_to_json(owner: &Ownership) -> Option<Json> {
    // name wins when both are present; the merge already warned
    if let Some(name) = &owner.name {
        Some(json!({ "name": name }))
    } else {
        owner.id.map(|id| json!({ "id": id }))
    }
}

fn extra_fields(
    map: &mut Map<String, Json>,
    extra: &std::collections::BTreeMap<String, Yaml>,
    wanted_by: &str,
) -> Result<(), TranspileError> {
    for (key, value) in extra {
        map.insert(key.clone(), yaml_to_json(value, wanted_by)?);
    }
    Ok(())
}

fn file_to_json(file: &FileEntry) -> Result<Json, TranspileError> {
    let mut map = Map::new();
    map.insert("path".into(), Json::from(file.path.clone()));
    if let Some(mode) = file.mode {
        map.insert("mode".into(), Json::from(mode.0));
    }
    if let Some(user) = file.user.as_ref().and_then(ownership_to_json) {
        map.insert("user".into(), user);
    }
    if let Some(group) = file.group.as_ref().and_then(ownership_to_json) {
        map.insert("group".into(), group);
    }
    if let Some(overwrite) = file.overwrite {
        map.insert("overwrite".into(), Json::from(overwrite));
    }

    if let Some(contents) = &file.contents {
        let mut body = Map::new();
        if let Some(inline) = &contents.inline {
            body.insert("source".into(), Json::from(inline_data_url(inline)));
        } else if let Some(source) = &contents.source {
            body.insert("source".into(), Json::from(source.clone()));
        }
        if let Some(verification) = &file.verification {
            if let Some(hash) = &verification.hash {
                body.insert("verification".into(), json!({ "hash": hash }));
            }
        }
        extra_fields(&mut body, &contents.extra, &file.path)?;
        if contents.local.is_some() || contents.template.is_some() {
            return Err(TranspileError::emission(
                &file.path,
                "unresolved contents reached the emitter",
            ));
        }
        map.insert("contents".into(), Json::Object(body));
    }

    extra_fields(&mut map, &file.extra, &file.path)?;
    Ok(Json::Object(map))
}

fn directory_to_json(dir: &DirectoryEntry) -> Result<Json, TranspileError> {
    let mut map = Map::new();
    map.insert("path".into(), Json::from(dir.path.clone()));
    if let Some(mode) = dir.mode {
        map.insert("mode".into(), Json::from(mode.0));
    }
    if let Some(user) = dir.user.as_ref().and_then(ownership_to_json) {
        map.insert("user".into(), user);
    }
    if let Some(group) = dir.group.as_ref().and_then(ownership_to_json) {
        map.insert("group".into(), group);
    }
    extra_fields(&mut map, &dir.extra, &dir.path)?;
    Ok(Json::Object(map))
}

fn link_to_json(link: &LinkEntry) -> Result<Json, TranspileError> {
    let mut map = Map::new();
    map.insert("path".into(), Json::from(link.path.clone()));
    map.insert("target".into(), Json::from(link.target.clone()));
    if let Some(hard) = link.hard {
        map.insert("hard".into(), Json::from(hard));
    }
    if let Some(user) = link.user.as_ref().and_then(ownership_to_json) {
        map.insert("user".into(), user);
    }
    if let Some(group) = link.group.as_ref().and_then(ownership_to_json) {
        map.insert("group".into(), group);
    }
    extra_fields(&mut map, &link.extra, &link.path)?;
    Ok(Json::Object(map))
}

fn unit_to_json(unit: &UnitEntry) -> Result<Json, TranspileError> {
    let mut map = Map::new();
    map.insert("name".into(), Json::from(unit.name.clone()));
    if let Some(enabled) = unit.enabled {
        map.insert("enabled".into(), Json::from(enabled));
    }
    if let Some(mask) = unit.mask {
        map.insert("mask".into(), Json::from(mask));
    }
    if let Some(contents) = &unit.contents {
        map.insert("contents".into(), Json::from(contents.clone()));
    }
    if !unit.dropins.is_empty() {
        let mut dropins: Vec<&crate::document::DropinEntry> = unit.dropins.iter().collect();
        dropins.sort_by(|a, b| a.name.cmp(&b.name));
        let rendered: Vec<Json> = dropins
            .into_iter()
            .map(|d| {
                let mut entry = Map::new();
                entry.insert("name".into(), Json::from(d.name.clone()));
                if let Some(contents) = &d.contents {
                    entry.insert("contents".into(), Json::from(contents.clone()));
                }
                Json::Object(entry)
            })
            .collect();
        map.insert("dropins".into(), Json::Array(rendered));
    }
    extra_fields(&mut map, &unit.extra, &unit.name)?;
    Ok(Json::Object(map))
}

/// Structural YAML-to-JSON conversion for the passthrough parts of the
/// tree. Mapping keys must be strings; tags are unwrapped.
pub fn yaml_to_json(value: &Yaml, wanted_by: &str) -> Result<Json, TranspileError> {
    Ok(match value {
        Yaml::Null => Json::Null,
        Yaml::Bool(b) => Json::from(*b),
        Yaml::Number(n) => {
            if let Some(i) = n.as_i64() {
                Json::from(i)
            } else if let Some(u) = n.as_u64() {
                Json::from(u)
            } else {
                Json::from(n.as_f64().unwrap_or_default())
            }
        }
        Yaml::String(s) => Json::from(s.clone()),
        Yaml::Sequence(seq) => Json::Array(
            seq.iter()
                .map(|v| yaml_to_json(v, wanted_by))
                .collect::<Result<_, _>>()?,
        ),
        Yaml::Mapping(mapping) => {
            let mut map = Map::new();
            for (key, value) in mapping {
                let key = key.as_str().ok_or_else(|| {
                    TranspileError::emission(wanted_by, "non-string mapping key")
                })?;
                map.insert(key.to_string(), yaml_to_json(value, wanted_by)?);
            }
            Json::Object(map)
        }
        Yaml::Tagged(tagged) => yaml_to_json(&tagged.value, wanted_by)?,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::document::{take_sections, FileContents, Mode};

    fn emit_str(yaml: &str) -> Json {
        let mut tree: Document = serde_yaml::from_str(yaml).unwrap();
        let sections = take_sections(&mut tree, "<test>").unwrap();
        crate::document::restore_sections(&mut tree, &sections).unwrap();
        let bytes = emit(&tree, &sections).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn inline_bodies_become_percent_encoded_data_urls() {
        assert_eq!(inline_data_url("hi"), "data:,hi");
        assert_eq!(inline_data_url("hello world\n"), "data:,hello%20world%0A");
        assert_eq!(inline_data_url("a=b&c"), "data:,a%3Db%26c");
    }

    #[test]
    fn single_inline_file() {
        let out = emit_str(
            "ignition:\n  version: 3.4.0\nstorage:\n  files:\n    - path: /a\n      contents:\n        inline: hi\n",
        );
        assert_eq!(out["ignition"]["version"], "3.4.0");
        let files = out["storage"]["files"].as_array().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0]["contents"]["source"], "data:,hi");
    }

    #[test]
    fn modes_are_decimal_and_ownership_is_an_object() {
        let out = emit_str(
            "storage:\n  files:\n    - path: /a\n      mode: \"0644\"\n      user:\n        name: core\n      group:\n        id: 1000\n",
        );
        let file = &out["storage"]["files"][0];
        assert_eq!(file["mode"], 420);
        assert_eq!(file["user"]["name"], "core");
        assert_eq!(file["group"]["id"], 1000);
    }

    #[test]
    fn name_wins_double_ownership() {
        let out = emit_str(
            "storage:\n  files:\n    - path: /a\n      user:\n        id: 0\n        name: root\n",
        );
        let user = &out["storage"]["files"][0]["user"];
        assert_eq!(user["name"], "root");
        assert!(user.get("id").is_none());
    }

    #[test]
    fn binary_sources_pass_untouched() {
        let sections = Sections {
            files: vec![FileEntry {
                path: "/opt/blob".into(),
                mode: Some(Mode(0o755)),
                contents: Some(FileContents {
                    source: Some("data:;base64,AP9C".into()),
                    ..FileContents::default()
                }),
                ..FileEntry::default()
            }],
            ..Sections::default()
        };
        let tree: Document = serde_yaml::from_str("{}").unwrap();
        let out: Json = serde_json::from_slice(&emit(&tree, &sections).unwrap()).unwrap();
        let file = &out["storage"]["files"][0];
        assert_eq!(file["contents"]["source"], "data:;base64,AP9C");
        assert_eq!(file["mode"], 493);
    }

    #[test]
    fn entries_are_ordered_by_identity() {
        let out = emit_str(
            "storage:\n  files:\n    - path: /z\n    - path: /a\nsystemd:\n  units:\n    - name: b.service\n    - name: a.service\n      dropins:\n        - name: z.conf\n        - name: a.conf\n",
        );
        let files = out["storage"]["files"].as_array().unwrap();
        assert_eq!(files[0]["path"], "/a");
        assert_eq!(files[1]["path"], "/z");
        let units = out["systemd"]["units"].as_array().unwrap();
        assert_eq!(units[0]["name"], "a.service");
        let dropins = units[0]["dropins"].as_array().unwrap();
        assert_eq!(dropins[0]["name"], "a.conf");
    }

    #[test]
    fn unknown_sections_pass_through() {
        let out = emit_str(
            "storage:\n  luks:\n    - name: root\n      clevis:\n        tpm2: true\npasswd:\n  users:\n    - name: core\n",
        );
        assert_eq!(out["storage"]["luks"][0]["clevis"]["tpm2"], true);
        assert_eq!(out["passwd"]["users"][0]["name"], "core");
    }

    #[test]
    fn emitted_json_reparses_identically() {
        let mut tree: Document = serde_yaml::from_str(
            "ignition:\n  version: 3.4.0\nstorage:\n  files:\n    - path: /a\n      mode: 420\n      contents:\n        inline: \"x y\"\n",
        )
        .unwrap();
        let sections = take_sections(&mut tree, "<test>").unwrap();
        crate::document::restore_sections(&mut tree, &sections).unwrap();
        let first = emit(&tree, &sections).unwrap();
        let parsed: Json = serde_json::from_slice(&first).unwrap();
        let second = serde_json::to_vec(&parsed).unwrap();
        assert_eq!(first, second);
    }
}
