//! Emits the reconciler program: a Salt state file the companion
//! runner applies on the host. The runner mock-applies first, then
//! applies for real, reloads systemd, enables/disables from the
//! accumulator lists, and finally restarts every service named in
//! `service_changed.list` that is non-template and has an [Install]
//! section. This module only guarantees the text it emits: every
//! config change lands its service in `service_changed.list`, every
//! flipped enable bit lands in the matching enable/disable list.

use std::fs;

use lazy_static::lazy_static;
use regex::Regex;
use serde_yaml::{Mapping, Value};

use crate::document::{Document, FileEntry, Mode, Ownership, Sections, UnitEntry};
use crate::error::TranspileError;
use crate::filesystem::SourceRoots;

/// Runtime directory the accumulator lists live in; the companion
/// service owns and consumes it.
pub const ACCUMULATOR_ROOT: &str = "/run/update-system-config";

const CHANGED_LIST: &str = "service_changed";
const ENABLED_LIST: &str = "service_enabled";
const DISABLED_LIST: &str = "service_disabled";

/// File targets the execution container must not clobber in its own
/// namespace; the host `/etc` is mounted at `/host_etc` instead.
const REMAPPED: [&str; 3] = ["/etc/hosts", "/etc/hostname", "/etc/resolv.conf"];

lazy_static! {
    /// Canonical service-naming patterns, anchored. First match wins;
    /// group 1 is the service name.
    static ref SERVICE_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"^/etc/systemd/system/([^/]+)\.[^.]+$").unwrap(),
        Regex::new(r"^/etc/systemd/system/([^/]+)\.[^.]+\.d/.+\.conf$").unwrap(),
        Regex::new(r"^/etc/local/environment/([^/]+)\.env$").unwrap(),
        Regex::new(r"^/etc/containers/environment/([^/]+)\.env$").unwrap(),
        Regex::new(r"^/etc/compose/environment/([^/]+)\.env$").unwrap(),
        Regex::new(r"^/etc/containers/systemd/([^/.]+)\..+$").unwrap(),
        Regex::new(r"^/etc/containers/build/([^/]+)/.+$").unwrap(),
        Regex::new(r"^/etc/compose/build/([^/]+)/.+$").unwrap(),
    ];
}

/// The service a path belongs to, per the pattern table.
pub fn service_name_for(path: &str) -> Option<String> {
    SERVICE_PATTERNS
        .iter()
        .find_map(|re| re.captures(path))
        .map(|c| c[1].to_string())
}

fn remap_path(path: &str) -> String {
    if REMAPPED.contains(&path) {
        format!("/host_etc/{}", path.trim_start_matches("/etc/"))
    } else {
        path.to_string()
    }
}

/// One reconciler state under construction: ordered mapping of state
/// IDs to a `module.function` with its argument list.
struct Program {
    states: Mapping,
    appender_seq: usize,
}

fn arg(key: &str, value: Value) -> Value {
    let mut map = Mapping::new();
    map.insert(Value::from(key), value);
    Value::Mapping(map)
}

fn requisite(module: &str, id: &str) -> Value {
    Value::Sequence(vec![arg(module, Value::from(id))])
}

impl Program {
    fn new() -> Self {
        Program {
            states: Mapping::new(),
            appender_seq: 0,
        }
    }

    fn add(
        &mut self,
        id: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Result<(), TranspileError> {
        if self.states.contains_key(id) {
            return Err(TranspileError::emission(
                id,
                "duplicate reconciler state id",
            ));
        }
        let mut body = Mapping::new();
        body.insert(Value::from(function), Value::Sequence(args));
        self.states.insert(Value::from(id), Value::Mapping(body));
        Ok(())
    }

    /// Append `service` to one of the shared lists. A change gate ties
    /// the appender to the state that manages the entity; without one
    /// the append is unconditional.
    fn append_to_list(
        &mut self,
        list: &str,
        service: &str,
        gate: Option<(&str, &str)>,
    ) -> Result<(), TranspileError> {
        self.appender_seq += 1;
        let id = format!("{}--{}--{}", list, service, self.appender_seq);
        let mut args = vec![arg(
            "name",
            Value::from(format!(
                "echo '{}' >> {}/{}.list",
                service, ACCUMULATOR_ROOT, list
            )),
        )];
        if let Some((module, state_id)) = gate {
            args.push(arg("onchanges", requisite(module, state_id)));
        }
        self.add(&id, "cmd.run", args)
    }

    /// Change-gated `service_changed` append for any managed path that
    /// matches the service-naming table.
    fn note_changed(
        &mut self,
        original_path: &str,
        gate_module: &str,
        gate_id: &str,
    ) -> Result<(), TranspileError> {
        if let Some(service) = service_name_for(original_path) {
            self.append_to_list(CHANGED_LIST, &service, Some((gate_module, gate_id)))?;
        }
        Ok(())
    }
}

fn ownership_args(args: &mut Vec<Value>, user: &Option<Ownership>, group: &Option<Ownership>) {
    if let Some(user) = user {
        if let Some(name) = &user.name {
            args.push(arg("user", Value::from(name.clone())));
        } else if let Some(id) = user.id {
            args.push(arg("user", Value::from(id)));
        }
    }
    if let Some(group) = group {
        if let Some(name) = &group.name {
            args.push(arg("group", Value::from(name.clone())));
        } else if let Some(id) = group.id {
            args.push(arg("group", Value::from(id)));
        }
    }
}

fn mode_arg(args: &mut Vec<Value>, mode: &Option<Mode>) {
    if let Some(mode) = mode {
        args.push(arg("mode", Value::from(mode.octal())));
    }
}

fn emit_file(program: &mut Program, file: &FileEntry) -> Result<(), TranspileError> {
    let target = remap_path(&file.path);
    let contents = file.contents.as_ref();
    let inline = contents.and_then(|c| c.inline.as_deref());
    let source = contents.and_then(|c| c.source.as_deref());

    match (inline, source) {
        (_, Some(source)) if source.starts_with("data:") => {
            // binary payload: decode-and-write with a byte-compare guard
            let payload = source
                .rsplit_once("base64,")
                .map(|(_, p)| p)
                .ok_or_else(|| {
                    TranspileError::emission(&file.path, "data: source without base64 payload")
                })?;
            let args = vec![
                arg(
                    "name",
                    Value::from(format!(
                        "echo '{payload}' | base64 -d > '{target}.new' && mv -f '{target}.new' '{target}'"
                    )),
                ),
                arg(
                    "unless",
                    Value::from(format!(
                        "echo '{payload}' | base64 -d | cmp -s - '{target}'"
                    )),
                ),
            ];
            program.add(&target, "cmd.run", args)?;
            program.note_changed(&file.path, "cmd", &target)?;
        }
        (_, Some(source)) => {
            // remote body: cite the URL and its verification hash
            let mut args = vec![
                arg("source", Value::from(source)),
                arg("makedirs", Value::from(true)),
            ];
            if let Some(hash) = file.verification.as_ref().and_then(|v| v.hash.as_deref()) {
                args.push(arg("source_hash", Value::from(hash)));
            }
            mode_arg(&mut args, &file.mode);
            ownership_args(&mut args, &file.user, &file.group);
            program.add(&target, "file.managed", args)?;
            program.note_changed(&file.path, "file", &target)?;
        }
        (inline, None) => {
            let mut args = Vec::new();
            if let Some(body) = inline {
                args.push(arg("contents", Value::from(body)));
            }
            args.push(arg("makedirs", Value::from(true)));
            mode_arg(&mut args, &file.mode);
            ownership_args(&mut args, &file.user, &file.group);
            program.add(&target, "file.managed", args)?;
            program.note_changed(&file.path, "file", &target)?;
        }
    }
    Ok(())
}

fn emit_unit(program: &mut Program, unit: &UnitEntry) -> Result<(), TranspileError> {
    let unit_path = format!("/etc/systemd/system/{}", unit.name);
    let masked = unit.mask == Some(true) && unit.enabled == Some(false);

    if masked {
        let args = vec![
            arg("target", Value::from("/dev/null")),
            arg("force", Value::from(true)),
            arg("makedirs", Value::from(true)),
        ];
        program.add(&unit_path, "file.symlink", args)?;
    } else if let Some(body) = &unit.contents {
        let args = vec![
            arg("contents", Value::from(body.clone())),
            arg("makedirs", Value::from(true)),
        ];
        program.add(&unit_path, "file.managed", args)?;
        program.note_changed(&unit_path, "file", &unit_path)?;
    }

    for dropin in &unit.dropins {
        let dropin_path = format!("/etc/systemd/system/{}.d/{}", unit.name, dropin.name);
        if let Some(body) = &dropin.contents {
            let args = vec![
                arg("contents", Value::from(body.clone())),
                arg("makedirs", Value::from(true)),
            ];
            program.add(&dropin_path, "file.managed", args)?;
            program.note_changed(&dropin_path, "file", &dropin_path)?;
        }
    }

    let service = unit
        .name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(&unit.name);

    match unit.enabled {
        Some(true) => {
            let mut args = vec![
                arg("name", Value::from(unit.name.clone())),
                arg("enable", Value::from(true)),
            ];
            if unit.mask == Some(false) {
                args.push(arg("unmask", Value::from(true)));
            }
            program.add(&format!("{}--running", unit.name), "service.running", args)?;
            program.append_to_list(ENABLED_LIST, service, None)?;
        }
        Some(false) => {
            let args = vec![
                arg("name", Value::from(unit.name.clone())),
                arg("enable", Value::from(false)),
            ];
            program.add(&format!("{}--dead", unit.name), "service.dead", args)?;
            program.append_to_list(DISABLED_LIST, service, None)?;
        }
        None => {}
    }
    Ok(())
}

/// Managed authorized_keys for users the merged tree declares keys for.
fn emit_authorized_keys(program: &mut Program, tree: &Document) -> Result<(), TranspileError> {
    let Some(users) = tree
        .get("passwd")
        .and_then(|p| p.get("users"))
        .and_then(Value::as_sequence)
    else {
        return Ok(());
    };
    for user in users {
        let Some(name) = user.get("name").and_then(Value::as_str) else {
            continue;
        };
        let Some(keys) = user.get("ssh_authorized_keys").and_then(Value::as_sequence) else {
            continue;
        };
        let keys: Vec<&str> = keys.iter().filter_map(Value::as_str).collect();
        if keys.is_empty() {
            continue;
        }
        let home = if name == "root" {
            "/root".to_string()
        } else {
            format!("/home/{}", name)
        };
        let args = vec![
            arg("contents", Value::from(format!("{}\n", keys.join("\n")))),
            arg("makedirs", Value::from(true)),
            arg("mode", Value::from("0600")),
            arg("user", Value::from(name)),
            arg("group", Value::from(name)),
        ];
        program.add(&format!("{}/.ssh/authorized_keys", home), "file.managed", args)?;
    }
    Ok(())
}

/// Emit the reconciler program: the translated subset of the merged
/// tree followed by the project's own fragments, verbatim.
pub fn emit(
    tree: &Document,
    sections: &Sections,
    roots: &SourceRoots,
) -> Result<String, TranspileError> {
    let mut program = Program::new();

    // accumulator files start empty on every run
    program.add(
        ACCUMULATOR_ROOT,
        "file.directory",
        vec![arg("makedirs", Value::from(true))],
    )?;
    for list in [CHANGED_LIST, ENABLED_LIST, DISABLED_LIST] {
        program.add(
            &format!("{}/{}.list", ACCUMULATOR_ROOT, list),
            "file.managed",
            vec![
                arg("contents", Value::from("")),
                arg("replace", Value::from(true)),
            ],
        )?;
    }

    let mut directories: Vec<_> = sections.directories.iter().collect();
    directories.sort_by(|a, b| a.path.cmp(&b.path));
    for dir in directories {
        let mut args = vec![arg("makedirs", Value::from(true))];
        mode_arg(&mut args, &dir.mode);
        ownership_args(&mut args, &dir.user, &dir.group);
        program.add(&dir.path, "file.directory", args)?;
        program.note_changed(&dir.path, "file", &dir.path)?;
    }

    let mut links: Vec<_> = sections.links.iter().collect();
    links.sort_by(|a, b| a.path.cmp(&b.path));
    for link in links {
        let function = if link.hard == Some(true) {
            "file.hardlink"
        } else {
            "file.symlink"
        };
        let mut args = vec![
            arg("target", Value::from(link.target.clone())),
            arg("makedirs", Value::from(true)),
        ];
        ownership_args(&mut args, &link.user, &link.group);
        program.add(&link.path, function, args)?;
        program.note_changed(&link.path, "file", &link.path)?;
    }

    let mut files: Vec<_> = sections.files.iter().collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    for file in files {
        emit_file(&mut program, file)?;
    }

    let mut units: Vec<_> = sections.units.iter().collect();
    units.sort_by(|a, b| a.name.cmp(&b.name));
    for unit in units {
        emit_unit(&mut program, unit)?;
    }

    emit_authorized_keys(&mut program, tree)?;

    let rendered = serde_yaml::to_string(&Value::Mapping(program.states))
        .map_err(|e| TranspileError::emission("<reconciler>", e.to_string()))?;
    let mut out = String::from("# host reconciliation program; generated, do not edit\n");
    out.push_str(&rendered);

    for relative in roots.reconciler_fragments()? {
        let source = roots.project.join(&relative);
        let fragment =
            fs::read_to_string(&source).map_err(|e| TranspileError::io(&relative, e))?;
        out.push_str(&format!("\n# fragment: {}\n", relative));
        out.push_str(&fragment);
        if !fragment.ends_with('\n') {
            out.push('\n');
        }
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::document::take_sections;
    use std::fs;

    fn roots(dir: &tempfile::TempDir) -> SourceRoots {
        let library = dir.path().join("library");
        let project = dir.path().join("project");
        fs::create_dir_all(&library).unwrap();
        fs::create_dir_all(&project).unwrap();
        SourceRoots { library, project }
    }

    fn emit_str(yaml: &str) -> String {
        let dir = tempfile::tempdir().unwrap();
        let roots = roots(&dir);
        emit_parts(yaml, &roots)
    }

    fn emit_parts(yaml: &str, roots: &SourceRoots) -> String {
        let mut tree: Document = serde_yaml::from_str(yaml).unwrap();
        let sections = take_sections(&mut tree, "<test>").unwrap();
        crate::document::restore_sections(&mut tree, &sections).unwrap();
        emit(&tree, &sections, roots).unwrap()
    }

    #[test]
    fn service_names_follow_the_pattern_table() {
        let cases = [
            ("/etc/systemd/system/frontend.service", Some("frontend")),
            ("/etc/systemd/system/frontend.service.d/10-env.conf", Some("frontend")),
            ("/etc/local/environment/backup.env", Some("backup")),
            ("/etc/containers/environment/db.env", Some("db")),
            ("/etc/compose/environment/web.env", Some("web")),
            ("/etc/containers/systemd/frontend.container", Some("frontend")),
            ("/etc/containers/build/api/Containerfile", Some("api")),
            ("/etc/compose/build/site/compose.yml", Some("site")),
            ("/etc/motd", None),
            ("/etc/systemd/system/frontend.service.d/readme", None),
        ];
        for (path, expected) in cases {
            assert_eq!(
                service_name_for(path).as_deref(),
                expected,
                "path {}",
                path
            );
        }
    }

    #[test]
    fn inline_file_becomes_managed_file() {
        let out = emit_str(
            "storage:\n  files:\n    - path: /etc/motd\n      contents:\n        inline: hi\n",
        );
        assert!(out.contains("/etc/motd:\n  file.managed:\n"));
        assert!(out.contains("- contents: hi\n"));
    }

    #[test]
    fn remapped_targets_move_to_host_etc() {
        let out = emit_str(
            "storage:\n  files:\n    - path: /etc/hosts\n      contents:\n        inline: \"127.0.0.1 localhost\"\n    - path: /etc/motd\n      contents:\n        inline: hi\n",
        );
        assert!(out.contains("/host_etc/hosts:\n"));
        assert!(!out.contains("\n/etc/hosts:\n"));
        assert!(out.contains("/etc/motd:\n"));
    }

    #[test]
    fn binary_payload_decodes_with_a_guard() {
        let out = emit_str(
            "storage:\n  files:\n    - path: /opt/blob\n      contents:\n        source: data:;base64,AP9C\n",
        );
        assert!(out.contains("/opt/blob:\n  cmd.run:\n"));
        assert!(out.contains("echo 'AP9C' | base64 -d"));
        assert!(out.contains("unless:"));
        assert!(out.contains("cmp -s"));
    }

    #[test]
    fn url_sources_cite_hash() {
        let out = emit_str(
            "storage:\n  files:\n    - path: /opt/tool\n      verification:\n        hash: sha512-abc\n      contents:\n        source: https://example.org/tool\n",
        );
        assert!(out.contains("- source: https://example.org/tool\n"));
        assert!(out.contains("- source_hash: sha512-abc\n"));
    }

    #[test]
    fn enabled_unit_runs_and_lands_in_enabled_list() {
        let out = emit_str(
            "systemd:\n  units:\n    - name: x.service\n      enabled: true\n      contents: |\n        [Service]\n        ExecStart=/bin/true\n",
        );
        assert!(out.contains("x.service--running:\n  service.running:\n"));
        assert!(out.contains("- enable: true\n"));
        assert!(out.contains("echo 'x' >> /run/update-system-config/service_enabled.list"));
        assert!(out.contains("/etc/systemd/system/x.service:\n  file.managed:\n"));
        // body change feeds the changed list, gated
        assert!(out.contains("echo 'x' >> /run/update-system-config/service_changed.list"));
        assert!(out.contains("onchanges:"));
    }

    #[test]
    fn masked_unit_is_dead_and_symlinked() {
        let out = emit_str(
            "systemd:\n  units:\n    - name: y.service\n      enabled: false\n      mask: true\n",
        );
        assert!(out.contains("y.service--dead:\n  service.dead:\n"));
        assert!(out.contains("/etc/systemd/system/y.service:\n  file.symlink:\n"));
        assert!(out.contains("- target: /dev/null\n"));
        assert!(out.contains("echo 'y' >> /run/update-system-config/service_disabled.list"));
    }

    #[test]
    fn dropins_land_under_the_unit_directory() {
        let out = emit_str(
            "systemd:\n  units:\n    - name: z.service\n      dropins:\n        - name: 10-env.conf\n          contents: |\n            [Service]\n            Environment=A=1\n",
        );
        assert!(out.contains("/etc/systemd/system/z.service.d/10-env.conf:\n  file.managed:\n"));
        assert!(out.contains("echo 'z' >> /run/update-system-config/service_changed.list"));
    }

    #[test]
    fn accumulator_lists_reset_first() {
        let out = emit_str("{}");
        assert!(out.contains("/run/update-system-config:\n  file.directory:\n"));
        for list in ["service_changed", "service_enabled", "service_disabled"] {
            assert!(out.contains(&format!("/run/update-system-config/{}.list:\n", list)));
        }
    }

    #[test]
    fn project_fragments_append_sorted_and_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let roots = roots(&dir);
        fs::write(roots.project.join("20-extra.sls"), "extra_state:\n  test.nop: []\n").unwrap();
        fs::write(roots.project.join("10-first.sls"), "first_state:\n  test.nop: []").unwrap();

        let out = emit_parts("{}", &roots);
        let first = out.find("# fragment: 10-first.sls").unwrap();
        let second = out.find("# fragment: 20-extra.sls").unwrap();
        assert!(first < second);
        assert!(out.contains("first_state:\n  test.nop: []"));
    }

    #[test]
    fn authorized_keys_become_a_managed_file() {
        let out = emit_str(
            "passwd:\n  users:\n    - name: core\n      ssh_authorized_keys:\n        - ssh-ed25519 AAAA a\n        - ssh-rsa BBBB b\n",
        );
        assert!(out.contains("/home/core/.ssh/authorized_keys:\n  file.managed:\n"));
        assert!(out.contains("- mode: '0600'\n"));
        assert!(out.contains("ssh-ed25519 AAAA a"));
    }

    #[test]
    fn build_directories_feed_the_changed_list() {
        let out = emit_str(
            "storage:\n  directories:\n    - path: /etc/containers/build/api/ctx\n    - path: /var/lib/plain\n",
        );
        assert!(out.contains("/etc/containers/build/api/ctx:\n  file.directory:\n"));
        assert!(out.contains("echo 'api' >> /run/update-system-config/service_changed.list"));
        // gated on the directory state actually changing
        assert!(out.contains("onchanges:"));
        // a directory outside the pattern table appends nothing
        assert!(!out.contains("echo 'plain'"));
    }

    #[test]
    fn running_service_carries_no_requisites() {
        let out = emit_str(
            "systemd:\n  units:\n    - name: x.service\n      enabled: true\n      contents: |\n        [Service]\n        ExecStart=/bin/true\n",
        );
        let running = out
            .split("x.service--running:\n")
            .nth(1)
            .and_then(|rest| rest.split("\nservice_").next())
            .unwrap();
        assert!(!running.contains("watch:"));
        assert!(!running.contains("onchanges:"));
    }

    #[test]
    fn hard_links_use_the_hardlink_state() {
        let out = emit_str(
            "storage:\n  links:\n    - path: /etc/alias\n      target: /etc/real\n      hard: true\n",
        );
        assert!(out.contains("/etc/alias:\n  file.hardlink:\n"));
    }
}
