//! Command-line interface definitions for monci.
//!
//! This module defines the CLI structure using the `clap` crate: every
//! subcommand named in the external CLI contract, plus the global flags
//! shared by all of them (`-I/--imagedir`, `-C/--config`,
//! `--extra-packages-dir`, `-v/--verbose`, `--debug`).

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint};
use clap_complete::Shell;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags shared by every subcommand, controlling how the [`crate::session::Session`]
/// is constructed and how verbose logging is.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Path to the directory that contains container images. Default:
    /// from the configuration file, or `/var/lib/machines`.
    #[arg(short = 'I', long, value_hint = ValueHint::DirPath, global = true)]
    pub imagedir: Option<Utf8PathBuf>,

    /// Path to the monci config file to use. By default, look in a
    /// number of well-known locations.
    #[arg(short = 'C', long, value_hint = ValueHint::FilePath, global = true)]
    pub config: Option<Utf8PathBuf>,

    /// Directory where extra packages, if present, are added to package
    /// sources in containers.
    #[arg(long, value_hint = ValueHint::DirPath, global = true)]
    pub extra_packages_dir: Option<Utf8PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug output.
    #[arg(long, global = true)]
    pub debug: bool,
}

impl GlobalArgs {
    pub fn log_level(&self) -> LogLevel {
        if self.debug {
            LogLevel::Debug
        } else if self.verbose {
            LogLevel::Info
        } else {
            LogLevel::Warn
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List configured/available images.
    Images(ImagesArgs),

    /// List supported distributions.
    Distros(DistrosArgs),

    /// Perform an action on an image's configuration.
    Image(ImageArgs),

    /// Bootstrap (or rebuild) one or more images.
    Bootstrap(BootstrapArgs),

    /// Update one or more images (or every image, if none given).
    Update(UpdateArgs),

    /// Remove one or more images.
    Remove(RemoveArgs),

    /// Deduplicate storage shared across images (btrfs backend only).
    Dedup,

    /// Open an interactive shell in an ephemeral instance of an image.
    Shell(ShellArgs),

    /// Run a command in an ephemeral instance of an image.
    Run(RunArgs),

    /// Run a CI build of a source tree in an image.
    Ci(CiArgs),

    /// Lint a source tree against an image's distro.
    Lint(LintArgs),

    /// Print a source tree's classification as JSON.
    QuerySource(QuerySourceArgs),

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct ImagesArgs {
    /// Output as CSV instead of a table.
    #[arg(long)]
    pub csv: bool,
}

#[derive(Args, Debug)]
pub struct DistrosArgs {
    #[arg(long)]
    pub csv: bool,
}

#[derive(Args, Debug)]
pub struct ImageArgs {
    /// Name of the image to act on.
    pub name: String,

    #[command(subcommand)]
    pub action: ImageAction,
}

#[derive(Subcommand, Debug)]
pub enum ImageAction {
    /// Set (or change) the distro this image bootstraps from.
    Distro { distro: String },
    /// Set (or change) the parent image this image extends.
    Extends { parent: String },
    /// Append a `setup` command to the image's maintenance script.
    Setup { cmd: Vec<String> },
    /// Append packages to the image's `packages` list.
    Install { packages: Vec<String> },
    /// Print the build dependencies of a source tree, for this image's distro.
    BuildDep {
        #[arg(default_value = ".")]
        source: String,
    },
    /// Open the image's configuration file in `$EDITOR`.
    Edit,
    /// Print the image's configuration file to stdout.
    Cat,
    /// Print a structured description of the image (distro chain, packages, versions).
    Describe,
}

#[derive(Args, Debug)]
pub struct BootstrapArgs {
    /// Tear down and recreate the image even if it already exists.
    #[arg(long)]
    pub recreate: bool,
    pub images: Vec<String>,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    pub images: Vec<String>,
}

#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// Also remove the image's configuration, not just its filesystem.
    #[arg(long)]
    pub purge: bool,
    pub images: Vec<String>,
}

/// Bind/workdir/user options shared by `shell` and `run`.
#[derive(Args, Debug, Clone, Default)]
pub struct ContainerActionArgs {
    pub image: String,

    /// Preserve changes made in the container instead of discarding them.
    #[arg(long)]
    pub maintenance: bool,

    /// Bind mount (writable) the given directory as working directory.
    #[arg(short = 'w', long = "workdir", value_hint = ValueHint::DirPath, conflicts_with_all = ["workdir_volatile", "clone"])]
    pub workdir: Option<Utf8PathBuf>,

    /// Bind mount (volatile) the given directory as working directory.
    #[arg(short = 'W', long = "workdir-volatile", value_hint = ValueHint::DirPath, conflicts_with_all = ["workdir", "clone"])]
    pub workdir_volatile: Option<Utf8PathBuf>,

    /// Check out the given repository (local or remote) in the container.
    #[arg(long, conflicts_with_all = ["workdir", "workdir_volatile"])]
    pub clone: Option<String>,

    /// Bind mount, passed as-is to systemd-nspawn; can be given multiple times.
    #[arg(long = "bind", action = clap::ArgAction::Append)]
    pub binds: Vec<String>,

    /// Read-only bind mount; can be given multiple times.
    #[arg(long = "bind-ro", action = clap::ArgAction::Append)]
    pub binds_ro: Vec<String>,

    /// Read-only bind mount with a writable volatile overlay; can be given multiple times.
    #[arg(long = "bind-volatile", action = clap::ArgAction::Append)]
    pub binds_volatile: Vec<String>,

    /// Run as the current (unprivileged) user instead of root.
    #[arg(short = 'u', long, conflicts_with = "root")]
    pub user: bool,

    /// Run as root (useful together with a workdir to still get a root shell).
    #[arg(short = 'r', long)]
    pub root: bool,
}

#[derive(Args, Debug)]
pub struct ShellArgs {
    #[command(flatten)]
    pub container: ContainerActionArgs,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub container: ContainerActionArgs,

    /// Command to run, after `--`.
    #[arg(last = true, required = true)]
    pub cmd: Vec<String>,
}

/// A single `-O key=value` build option override.
#[derive(Debug, Clone)]
pub struct BuildOption {
    pub key: String,
    pub value: String,
}

impl std::str::FromStr for BuildOption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((key, value)) => Ok(BuildOption { key: key.to_string(), value: value.to_string() }),
            None => Err(format!("{s:?}: expected key=value")),
        }
    }
}

#[derive(Args, Debug)]
pub struct CiArgs {
    pub image: String,

    #[arg(default_value = ".")]
    pub source: String,

    /// Directory to collect build artifacts into.
    #[arg(short = 'a', long = "artifacts-dir", value_hint = ValueHint::DirPath)]
    pub artifacts_dir: Option<Utf8PathBuf>,

    /// YAML file with build options.
    #[arg(short = 'B', long = "build-config", value_hint = ValueHint::FilePath)]
    pub build_config: Option<Utf8PathBuf>,

    /// Override a single build option; can be given multiple times.
    #[arg(short = 'O', long = "option", action = clap::ArgAction::Append)]
    pub options: Vec<BuildOption>,

    /// Only prepare the source tree, skip the actual build.
    #[arg(long)]
    pub source_only: bool,

    /// Open an interactive shell after the build, regardless of its outcome.
    #[arg(long)]
    pub shell: bool,

    /// Leave the container running after the build instead of tearing it down.
    #[arg(long)]
    pub linger: bool,

    /// Skip the pkgdb update/upgrade steps, assuming the image is current.
    #[arg(long)]
    pub quick: bool,
}

#[derive(Args, Debug)]
pub struct LintArgs {
    pub image: String,

    #[arg(default_value = ".")]
    pub source: String,
}

#[derive(Args, Debug)]
pub struct QuerySourceArgs {
    pub image: String,

    #[arg(default_value = ".")]
    pub source: String,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Logging verbosity, mapped from [`GlobalArgs::verbose`]/[`GlobalArgs::debug`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

pub fn parse_args() -> Result<Cli> {
    Ok(Cli::parse())
}
