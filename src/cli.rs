use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_yaml::Value;

use crate::args::{Action, Options};
use crate::environment::Environment;
use crate::filesystem::SourceRoots;
use crate::security::SecurityBundle;
use crate::transpile::transpile;

const DEFAULT_SEED: &str = "ignition:\n  version: 3.4.0\n";

/// Run one transpile from the command-line options and write the
/// requested artifacts. Returns false when nothing was written.
pub fn run(opt: &Options, action: Action) -> Result<bool> {
    let roots = SourceRoots {
        library: opt.library_root.clone(),
        project: opt.project_root.clone(),
    };

    let seed = match &opt.seed {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("read seed document {:?}", path))?,
        None => DEFAULT_SEED.to_string(),
    };

    let security = load_security(&opt.security_dir).context("load security material")?;
    let overrides = match &opt.environment {
        Some(path) => load_overrides(path)
            .with_context(|| format!("load environment overrides {:?}", path))?,
        None => Environment::new(),
    };

    let resource_id = opt.resource_id.as_deref().unwrap_or(&opt.hostname);
    info!("Transpiling configuration for {}...", opt.hostname);
    let artifacts = transpile(resource_id, &opt.hostname, &security, &seed, &roots, &overrides)
        .context("transpile host configuration")?;

    for warning in &artifacts.warnings {
        warn!("{}", warning);
    }

    if matches!(action, Action::Build | Action::Ignition) {
        fs::write(&opt.ignition_out, &artifacts.ignition_json)
            .with_context(|| format!("write {:?}", opt.ignition_out))?;
        info!("Wrote {:?}", opt.ignition_out);
    }
    if matches!(action, Action::Build | Action::Reconciler) {
        fs::write(&opt.reconciler_out, &artifacts.reconciler_program)
            .with_context(|| format!("write {:?}", opt.reconciler_out))?;
        info!("Wrote {:?}", opt.reconciler_out);
    }
    Ok(true)
}

/// Read the conventional file names out of the security directory.
/// Absent files yield empty strings so a development run works without
/// a certificate authority at hand.
fn load_security(dir: &Path) -> Result<SecurityBundle> {
    let read = |name: &str| -> Result<String> {
        let path = dir.join(name);
        if path.is_file() {
            fs::read_to_string(&path).with_context(|| format!("read {:?}", path))
        } else {
            debug!("Security file {:?} absent, using empty content", path);
            Ok(String::new())
        }
    };
    Ok(SecurityBundle {
        root_ca_pem: read("root_ca.crt")?,
        root_bundle_pem: read("root_bundle.crt")?,
        server_cert_pem: read("server.crt")?,
        server_key_pem: read("server.key")?,
        authorized_keys_text: read("authorized_keys")?,
        provision_signer_pub: read("provision_signer.pub")?,
    })
}

fn load_overrides(path: &Path) -> Result<Environment> {
    let text = fs::read_to_string(path).context("read file")?;
    let table: toml::Table = toml::from_str(&text).context("parse TOML")?;
    Ok(table
        .into_iter()
        .map(|(key, value)| (key, toml_to_yaml(value)))
        .collect())
}

fn toml_to_yaml(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::from(s),
        toml::Value::Integer(i) => Value::from(i),
        toml::Value::Float(f) => Value::from(f),
        toml::Value::Boolean(b) => Value::from(b),
        toml::Value::Datetime(dt) => Value::from(dt.to_string()),
        toml::Value::Array(items) => {
            Value::Sequence(items.into_iter().map(toml_to_yaml).collect())
        }
        toml::Value::Table(table) => {
            let mut mapping = serde_yaml::Mapping::new();
            for (key, value) in table {
                mapping.insert(Value::from(key), toml_to_yaml(value));
            }
            Value::Mapping(mapping)
        }
    }
}
