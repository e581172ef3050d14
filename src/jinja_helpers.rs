use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use minijinja::{Environment, Error, ErrorKind};
use regex::RegexBuilder;

/// Register the custom filters and directory functions on a fresh
/// environment. The directory functions capture the searchpath so the
/// engine never consults the current working directory.
pub fn register(env: &mut Environment<'_>, searchpath: &[PathBuf]) {
    env.add_filter("regex_escape", regex_escape);
    env.add_filter("regex_search", regex_search);
    env.add_filter("regex_match", regex_match);
    env.add_filter("regex_replace", regex_replace);
    env.add_filter("cidr2ip", cidr2ip);
    env.add_filter("indent", indent);
    env.add_filter("yaml", yaml);

    let sp = searchpath.to_vec();
    env.add_function("list_files", move |dir: String| list_entries(&sp, &dir, false));
    let sp = searchpath.to_vec();
    env.add_function("list_dirs", move |dir: String| list_entries(&sp, &dir, true));
    let sp = searchpath.to_vec();
    env.add_function("get_file_mode", move |path: String| file_mode(&sp, &path));
    let sp = searchpath.to_vec();
    env.add_function("has_executable_bit", move |path: String| {
        executable_bit(&sp, &path)
    });
}

fn invalid(message: String) -> Error {
    Error::new(ErrorKind::InvalidOperation, message)
}

fn build_regex(
    pattern: &str,
    ignorecase: Option<bool>,
    multiline: Option<bool>,
) -> Result<regex::Regex, Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(ignorecase.unwrap_or(false))
        .multi_line(multiline.unwrap_or(false))
        .build()
        .map_err(|e| invalid(format!("bad regex {:?}: {}", pattern, e)))
}

fn regex_escape(value: String) -> String {
    regex::escape(&value)
}

/// First match of `pattern` in the input, or the empty string.
fn regex_search(
    value: String,
    pattern: String,
    ignorecase: Option<bool>,
    multiline: Option<bool>,
) -> Result<String, Error> {
    let re = build_regex(&pattern, ignorecase, multiline)?;
    Ok(re
        .find(&value)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default())
}

fn regex_match(
    value: String,
    pattern: String,
    ignorecase: Option<bool>,
    multiline: Option<bool>,
) -> Result<bool, Error> {
    let re = build_regex(&pattern, ignorecase, multiline)?;
    Ok(re.is_match(&value))
}

fn regex_replace(
    value: String,
    pattern: String,
    replacement: String,
    ignorecase: Option<bool>,
    multiline: Option<bool>,
) -> Result<String, Error> {
    let re = build_regex(&pattern, ignorecase, multiline)?;
    Ok(re.replace_all(&value, replacement.as_str()).into_owned())
}

/// The n-th address of a CIDR block, counted from the base address with
/// the prefix length stripped. `cidr2ip(0)` on `10.88.0.0/16` is
/// `10.88.0.0`; `cidr2ip(1)` is `10.88.0.1`.
fn cidr2ip(value: String, n: Option<u64>) -> Result<String, Error> {
    let block = cidr::IpCidr::from_str(value.trim())
        .map_err(|e| invalid(format!("bad CIDR {:?}: {}", value, e)))?;
    let offset = n.unwrap_or(0);
    let address = match block.first_address() {
        IpAddr::V4(base) => {
            let base = u32::from(base);
            let n = u32::try_from(offset)
                .ok()
                .and_then(|o| base.checked_add(o))
                .ok_or_else(|| invalid(format!("offset {} overflows {}", offset, value)))?;
            IpAddr::V4(n.into())
        }
        IpAddr::V6(base) => {
            let base = u128::from(base);
            let n = base
                .checked_add(u128::from(offset))
                .ok_or_else(|| invalid(format!("offset {} overflows {}", offset, value)))?;
            IpAddr::V6(n.into())
        }
    };
    Ok(address.to_string())
}

/// Indent every line by `width` spaces. The first line is left alone
/// unless `first` is set, so the filter composes with YAML literal
/// blocks whose opening line carries its own indentation.
fn indent(value: String, width: usize, first: Option<bool>) -> String {
    let prefix = " ".repeat(width);
    let mut out = String::with_capacity(value.len());
    for (i, line) in value.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if !line.is_empty() && (i > 0 || first.unwrap_or(false)) {
            out.push_str(&prefix);
        }
        out.push_str(line);
    }
    out
}

fn yaml(value: minijinja::Value) -> Result<String, Error> {
    let encoded = serde_yaml::to_string(&value)
        .map_err(|e| invalid(format!("cannot encode as YAML: {}", e)))?;
    Ok(encoded.trim_end_matches('\n').to_string())
}

/// Immediate children of `dir` under the first searchpath root that has
/// it, names only, sorted, newline-separated. `dirs` selects
/// subdirectories instead of files.
fn list_entries(searchpath: &[PathBuf], dir: &str, dirs: bool) -> Result<String, Error> {
    for root in searchpath {
        let candidate = root.join(dir);
        if !candidate.is_dir() {
            continue;
        }
        let mut names = Vec::new();
        let entries = std::fs::read_dir(&candidate)
            .map_err(|e| invalid(format!("cannot list {:?}: {}", candidate, e)))?;
        for entry in entries {
            let entry = entry.map_err(|e| invalid(format!("cannot list {:?}: {}", dir, e)))?;
            let path = entry.path();
            if (dirs && path.is_dir()) || (!dirs && path.is_file()) {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        return Ok(names.join("\n"));
    }
    Ok(String::new())
}

fn resolve(searchpath: &[PathBuf], path: &str) -> Option<PathBuf> {
    searchpath
        .iter()
        .map(|root| root.join(path))
        .find(|candidate| candidate.is_file())
}

/// Octal mode string of a file, or empty if absent.
fn file_mode(searchpath: &[PathBuf], path: &str) -> Result<String, Error> {
    use std::os::unix::fs::PermissionsExt;
    match resolve(searchpath, path) {
        Some(found) => {
            let metadata = std::fs::metadata(&found)
                .map_err(|e| invalid(format!("cannot stat {:?}: {}", found, e)))?;
            Ok(format!("{:04o}", metadata.permissions().mode() & 0o7777))
        }
        None => Ok(String::new()),
    }
}

/// The literal `"true"` / `"false"`, or empty if the file is absent.
fn executable_bit(searchpath: &[PathBuf], path: &str) -> Result<String, Error> {
    use std::os::unix::fs::PermissionsExt;
    match resolve(searchpath, path) {
        Some(found) => {
            let metadata = std::fs::metadata(&found)
                .map_err(|e| invalid(format!("cannot stat {:?}: {}", found, e)))?;
            let executable = metadata.permissions().mode() & 0o111 != 0;
            Ok(if executable { "true" } else { "false" }.to_string())
        }
        None => Ok(String::new()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn regex_filters() {
        assert_eq!(regex_escape("a.b*c".into()), r"a\.b\*c");
        assert_eq!(
            regex_search("podman-4.9.4".into(), r"\d+\.\d+".into(), None, None).unwrap(),
            "4.9"
        );
        assert_eq!(
            regex_search("nothing".into(), r"\d".into(), None, None).unwrap(),
            ""
        );
        assert!(regex_match("Frontend".into(), "front".into(), Some(true), None).unwrap());
        assert!(!regex_match("Frontend".into(), "front".into(), None, None).unwrap());
        assert_eq!(
            regex_replace("a-b-c".into(), "-".into(), "_".into(), None, None).unwrap(),
            "a_b_c"
        );
    }

    #[test]
    fn cidr2ip_base_and_offset() {
        assert_eq!(cidr2ip("10.88.0.0/16".into(), None).unwrap(), "10.88.0.0");
        assert_eq!(cidr2ip("10.88.0.0/16".into(), Some(1)).unwrap(), "10.88.0.1");
        assert_eq!(
            cidr2ip("10.87.240.0/24".into(), Some(257)).unwrap(),
            "10.87.241.1"
        );
        assert_eq!(cidr2ip("fd00::/64".into(), Some(2)).unwrap(), "fd00::2");
        assert!(cidr2ip("not-a-cidr".into(), None).is_err());
    }

    #[test]
    fn indent_skips_first_line_by_default() {
        assert_eq!(indent("a\nb\nc".into(), 2, None), "a\n  b\n  c");
        assert_eq!(indent("a\nb".into(), 2, Some(true)), "  a\n  b");
        assert_eq!(indent("a\n\nb".into(), 2, Some(true)), "  a\n\n  b");
    }

    #[test]
    fn yaml_filter_encodes_values() {
        assert_eq!(yaml(minijinja::Value::from("hi")).unwrap(), "hi");
        assert_eq!(yaml(minijinja::Value::from(42)).unwrap(), "42");
        let seq = minijinja::Value::from(vec!["a", "b"]);
        assert_eq!(yaml(seq).unwrap(), "- a\n- b");
    }

    #[test]
    fn directory_functions() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        fs::create_dir(root.join("conf.d")).unwrap();
        fs::create_dir(root.join("conf.d/sub")).unwrap();
        fs::write(root.join("conf.d/b.conf"), "b").unwrap();
        fs::write(root.join("conf.d/a.conf"), "a").unwrap();
        let searchpath = vec![root.clone()];

        assert_eq!(
            list_entries(&searchpath, "conf.d", false).unwrap(),
            "a.conf\nb.conf"
        );
        assert_eq!(list_entries(&searchpath, "conf.d", true).unwrap(), "sub");
        assert_eq!(list_entries(&searchpath, "missing", false).unwrap(), "");
    }

    #[test]
    fn mode_functions() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let script = root.join("run.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let searchpath = vec![root];

        assert_eq!(file_mode(&searchpath, "run.sh").unwrap(), "0755");
        assert_eq!(executable_bit(&searchpath, "run.sh").unwrap(), "true");
        assert_eq!(file_mode(&searchpath, "missing").unwrap(), "");
        assert_eq!(executable_bit(&searchpath, "missing").unwrap(), "");
    }
}
