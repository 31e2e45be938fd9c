//! zboot - initramfs builder for root-on-ZFS systems.
//!
//! Resolves kernel modules, collects binaries, libraries and configuration
//! into a staging tree and writes a compressed newc archive with
//! `zboot-init` as `/init`.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use zboot::commands::{self, show::ShowTarget as ShowWhat};
use zboot::config::{
    default_settings_path, parse_features, BuildConfig, EnvOverrides, Settings,
};
use zboot::process;

#[derive(Parser)]
#[command(name = "zboot")]
#[command(about = "Initramfs builder for root-on-ZFS (optionally LUKS) systems")]
#[command(
    after_help = "QUICK START:\n  zboot preflight        Check the build host\n  zboot build            Build an image for the running kernel\n  zboot build -k 6.6.30  Build for another installed kernel\n  zboot list             Show what would be staged"
)]
struct Cli {
    /// Show debug diagnostics (same as RUST_LOG=debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the initramfs image
    Build {
        #[command(flatten)]
        opts: BuildOpts,

        /// Do not run preflight checks first
        #[arg(long)]
        skip_preflight: bool,
    },

    /// Print the module closure for a kernel version
    Resolve {
        #[command(flatten)]
        opts: BuildOpts,

        /// Modules to resolve (default: the configured module list)
        names: Vec<String>,
    },

    /// Collect without writing and list every staged entry
    List {
        #[command(flatten)]
        opts: BuildOpts,
    },

    /// Check the build host
    Preflight {
        #[command(flatten)]
        opts: BuildOpts,

        /// Fail if any checks fail (exit code 1)
        #[arg(long)]
        strict: bool,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowTarget,

        #[command(flatten)]
        opts: BuildOpts,
    },
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Show the effective build configuration
    Config,
    /// Show the effective settings as JSON
    Settings,
}

#[derive(Args, Debug, Default)]
struct BuildOpts {
    /// Kernel version (default: the running kernel)
    #[arg(short, long)]
    kernel: Option<String>,

    /// Comma separated features: zfs, luks, keymap, basic
    #[arg(short, long)]
    features: Option<String>,

    /// Extra module to include (repeatable)
    #[arg(short, long = "module")]
    modules: Vec<String>,

    /// none, gzip[:level] or zstd[:level]
    #[arg(short, long)]
    compression: Option<String>,

    /// Output image path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Directory for the default image name
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Root of the system to collect from
    #[arg(long)]
    host_root: Option<PathBuf>,

    /// zboot-init binary to install as /init
    #[arg(long)]
    init_binary: Option<PathBuf>,

    /// Keymap file to ship instead of dumping the host keymap
    #[arg(long)]
    keymap_file: Option<PathBuf>,

    /// settings.json to use
    #[arg(long)]
    settings: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load .env if present
    dotenvy::dotenv().ok();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Build {
            opts,
            skip_preflight,
        } => {
            let config = load_config(&opts)?;
            commands::cmd_build(&config, skip_preflight)?;
        }

        Commands::Resolve { opts, names } => {
            let config = load_config(&opts)?;
            commands::cmd_resolve(&config, &names)?;
        }

        Commands::List { opts } => {
            let config = load_config(&opts)?;
            commands::cmd_list(&config)?;
        }

        Commands::Preflight { opts, strict } => {
            let config = load_config(&opts)?;
            commands::cmd_preflight(&config, strict)?;
        }

        Commands::Show { what, opts } => {
            let config = load_config(&opts)?;
            let what = match what {
                ShowTarget::Config => ShowWhat::Config,
                ShowTarget::Settings => ShowWhat::Settings,
            };
            commands::cmd_show(what, &config)?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// CLI flags first, then environment, then settings and built-in defaults.
fn load_config(opts: &BuildOpts) -> Result<BuildConfig> {
    let env = EnvOverrides::from_env();

    let settings_path = opts
        .settings
        .clone()
        .or_else(|| env.settings.clone())
        .unwrap_or_else(default_settings_path);
    let settings = Settings::load_or_default(&settings_path)
        .with_context(|| format!("Loading settings from {}", settings_path.display()))?;

    let kernel = match &opts.kernel {
        Some(kernel) => kernel.clone(),
        None => running_kernel()?,
    };

    let mut builder = BuildConfig::builder(kernel).settings(settings);
    if let Some(ref features) = opts.features {
        builder = builder.features(parse_features(features)?);
    }
    for module in &opts.modules {
        builder = builder.module(module.as_str());
    }
    if let Some(ref compression) = opts.compression {
        builder = builder.compression(compression.parse()?);
    }
    if let Some(ref output) = opts.output {
        builder = builder.output(output);
    }
    if let Some(ref dir) = opts.output_dir {
        builder = builder.output_dir(dir);
    }
    if let Some(ref root) = opts.host_root {
        builder = builder.host_root(root);
    }
    if let Some(ref init) = opts.init_binary {
        builder = builder.init_binary(init);
    }
    if let Some(ref keymap) = opts.keymap_file {
        builder = builder.keymap_file(keymap);
    }

    let config = builder.env(&env)?.build()?;
    Ok(config)
}

/// `uname -r`
fn running_kernel() -> Result<String> {
    let result = process::run("uname", ["-r"]).context("Cannot determine the running kernel; pass --kernel")?;
    Ok(result.stdout_trimmed().to_string())
}
