//! Transpiles a pair of Butane-with-templates source roots into the two
//! artifacts a host needs: an Ignition JSON document for first boot and
//! a reconciler program that brings a running host back in line with
//! the merged configuration.

#[macro_use]
extern crate log;

pub mod args;
pub mod builder;
pub mod cli;
pub mod document;
pub mod engine;
pub mod environment;
pub mod error;
pub mod filesystem;
pub mod ignition;
pub mod jinja_helpers;
pub mod merge;
pub mod reconciler;
pub mod security;
pub mod transpile;

pub use error::{TranspileError, Warning};
pub use filesystem::SourceRoots;
pub use security::SecurityBundle;
pub use transpile::{transpile, Artifacts};
