use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Transpile templated Butane host configuration into Ignition JSON
/// and a reconciler program.
#[derive(Debug, Parser, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Options {
    /// Root of the shared library fragments
    #[arg(short, long, default_value = "library", global = true)]
    pub library_root: PathBuf,

    /// Root of the host-specific project fragments
    #[arg(short, long, default_value = ".", global = true)]
    pub project_root: PathBuf,

    /// Fully-qualified hostname of the target host
    #[arg(short = 'n', long, global = true, default_value = "localhost")]
    pub hostname: String,

    /// Stable identifier of the host in the surrounding orchestration;
    /// defaults to the hostname
    #[arg(long, global = true)]
    pub resource_id: Option<String>,

    /// Seed document declaring the Ignition variant and version;
    /// a minimal one is synthesized when omitted
    #[arg(short, long, global = true)]
    pub seed: Option<PathBuf>,

    /// Directory holding the security material (root_ca.crt,
    /// root_bundle.crt, server.crt, server.key, authorized_keys,
    /// provision_signer.pub); missing files become empty placements
    #[arg(long, default_value = "security", global = true)]
    pub security_dir: PathBuf,

    /// Optional TOML file with environment overrides
    #[arg(short, long, global = true)]
    pub environment: Option<PathBuf>,

    /// Where to write the Ignition JSON
    #[arg(long, default_value = "ignition.json", global = true)]
    pub ignition_out: PathBuf,

    /// Where to write the reconciler program
    #[arg(long, default_value = "host_update.sls", global = true)]
    pub reconciler_out: PathBuf,

    /// Verbosity level - specify up to 3 times to get more detailed output.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbosity: u8,

    /// Quiet - only print errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub action: Option<Action>,
}

#[derive(Debug, Clone, Copy, Subcommand, Default)]
pub enum Action {
    /// Write both artifacts. This is the default subcommand.
    #[default]
    Build,

    /// Write only the Ignition JSON.
    Ignition,

    /// Write only the reconciler program.
    Reconciler,

    /// Generate shell completions
    GenCompletions {
        /// Shell to generate completions for
        #[clap(long)]
        shell: Shell,
    },
}

pub fn get_options() -> Options {
    let mut opt = Options::parse();
    opt.verbosity = std::cmp::min(3, opt.verbosity);
    if opt.resource_id.is_none() {
        opt.resource_id = Some(opt.hostname.clone());
    }
    opt
}
