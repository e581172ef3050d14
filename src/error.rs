use std::fmt;

use thiserror::Error;

/// Failure modes of the transpile pipeline. Every variant names the
/// fragment (or virtual document such as `<seed>`) it originated from.
#[derive(Debug, Error)]
pub enum TranspileError {
    #[error("template error in {source_path}{}: {message}", fmt_line(.line))]
    Template {
        source_path: String,
        line: Option<usize>,
        message: String,
    },

    #[error("invalid YAML in {source_path}: {message}")]
    YamlParse { source_path: String, message: String },

    #[error("unresolved local reference {reference:?} wanted by {source_path}")]
    MissingLocalReference {
        source_path: String,
        reference: String,
    },

    #[error("conflicting definitions of {identity} within {source_path}")]
    MergeConflict {
        source_path: String,
        identity: String,
    },

    #[error("content of {source_path} is not valid UTF-8: {message}")]
    Encoding { source_path: String, message: String },

    #[error("emission failed for {source_path}: {message}")]
    Emission { source_path: String, message: String },

    #[error("i/o error on {source_path}: {source}")]
    Io {
        source_path: String,
        source: std::io::Error,
    },
}

impl TranspileError {
    pub fn io(source_path: impl Into<String>, source: std::io::Error) -> Self {
        TranspileError::Io {
            source_path: source_path.into(),
            source,
        }
    }

    pub fn emission(source_path: impl Into<String>, message: impl Into<String>) -> Self {
        TranspileError::Emission {
            source_path: source_path.into(),
            message: message.into(),
        }
    }
}

fn fmt_line(line: &Option<usize>) -> String {
    match line {
        Some(line) => format!(" (line {})", line),
        None => String::new(),
    }
}

/// Non-fatal findings collected during a transpile run. They ride along
/// with the artifacts instead of failing the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub source_path: String,
    pub message: String,
}

impl Warning {
    pub fn new(source_path: impl Into<String>, message: impl Into<String>) -> Self {
        Warning {
            source_path: source_path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source_path, self.message)
    }
}
