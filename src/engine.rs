use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use lazy_static::lazy_static;
use minijinja::UndefinedBehavior;
use regex::Regex;

use crate::environment::Environment;
use crate::error::TranspileError;
use crate::jinja_helpers;

lazy_static! {
    /// `{% import "relative/path" as name %}` binds the raw file
    /// contents to `name`. Handled before parsing since the stock
    /// construct with the same keyword imports macros, not text.
    static ref IMPORT_DIRECTIVE: Regex = Regex::new(
        r#"\{%-?\s*import\s+"([^"]+)"\s+as\s+([A-Za-z_][A-Za-z0-9_]*)\s*-?%\}\n?"#
    )
    .unwrap();
}

/// Renders one template at a time against the bound environment. Every
/// render builds a fresh engine so state cannot leak between fragments;
/// the only file reads are searchpath lookups for includes, imports and
/// the directory functions.
#[derive(Debug, Clone)]
pub struct TemplateEngine {
    searchpath: Vec<PathBuf>,
    globals: Environment,
}

impl TemplateEngine {
    pub fn new(searchpath: Vec<PathBuf>, globals: Environment) -> Self {
        TemplateEngine { searchpath, globals }
    }

    pub fn globals(&self) -> &Environment {
        &self.globals
    }

    /// Render `source` (named `source_path` for error reporting)
    /// against the bound environment.
    pub fn render(&self, source_path: &str, source: &str) -> Result<String, TranspileError> {
        self.render_with(source_path, source, &Environment::new())
    }

    /// Render with additional values layered over the environment.
    pub fn render_with(
        &self,
        source_path: &str,
        source: &str,
        extra: &Environment,
    ) -> Result<String, TranspileError> {
        let (source, imports) = self.bind_imports(source_path, source)?;

        let mut env = minijinja::Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        jinja_helpers::register(&mut env, &self.searchpath);

        let searchpath = self.searchpath.clone();
        env.set_loader(move |name| {
            for root in &searchpath {
                let candidate = root.join(name);
                if candidate.is_file() {
                    return match fs::read_to_string(&candidate) {
                        Ok(content) => Ok(Some(content)),
                        Err(e) => Err(minijinja::Error::new(
                            minijinja::ErrorKind::InvalidOperation,
                            format!("cannot read include {:?}: {}", candidate, e),
                        )),
                    };
                }
            }
            Ok(None)
        });

        let mut context: Environment = self.globals.clone();
        for (key, value) in extra {
            context.insert(key.clone(), value.clone());
        }
        for (name, contents) in imports {
            context.insert(name, serde_yaml::Value::from(contents));
        }

        env.add_template_owned(source_path.to_string(), source)
            .map_err(|e| template_error(source_path, &e))?;
        let template = env
            .get_template(source_path)
            .map_err(|e| template_error(source_path, &e))?;
        template
            .render(&context)
            .map_err(|e| template_error(source_path, &e))
    }

    /// Strip the import directives out of the source and collect the
    /// bindings they introduce. Imported files are read verbatim, one
    /// level deep.
    fn bind_imports(
        &self,
        source_path: &str,
        source: &str,
    ) -> Result<(String, BTreeMap<String, String>), TranspileError> {
        let mut bindings = BTreeMap::new();
        for capture in IMPORT_DIRECTIVE.captures_iter(source) {
            let reference = &capture[1];
            let name = capture[2].to_string();
            let resolved = self.resolve_import(reference).ok_or_else(|| {
                TranspileError::MissingLocalReference {
                    source_path: source_path.to_string(),
                    reference: reference.to_string(),
                }
            })?;
            let contents =
                fs::read(&resolved).map_err(|e| TranspileError::io(reference, e))?;
            let contents = String::from_utf8(contents).map_err(|e| TranspileError::Encoding {
                source_path: reference.to_string(),
                message: e.to_string(),
            })?;
            trace!("Imported {:?} as {} into {}", reference, name, source_path);
            bindings.insert(name, contents);
        }
        let stripped = IMPORT_DIRECTIVE.replace_all(source, "").into_owned();
        Ok((stripped, bindings))
    }

    fn resolve_import(&self, reference: &str) -> Option<PathBuf> {
        self.searchpath
            .iter()
            .map(|root| root.join(reference))
            .find(|candidate| candidate.is_file())
    }
}

fn template_error(source_path: &str, error: &minijinja::Error) -> TranspileError {
    // minijinja prefixes messages with its own location; keep just the
    // reason and carry the location in structured form.
    TranspileError::Template {
        source_path: source_path.to_string(),
        line: error.line(),
        message: error.to_string(),
    }
}
