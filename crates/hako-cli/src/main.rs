// crates/hako-cli/src/main.rs

use clap::Parser;
use libhako::cgroup::CgroupLayout;
use libhako::image::BaseImage;
use libhako::rootfs::RootfsMode;
use libhako::{Config, LimitSpec, container};
use log::error;
use std::io::{BufRead, Write};
use std::path::PathBuf;

/// Run an interactive shell inside an isolated container.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON config file; flags below override its values
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Memory ceiling in MiB (0 = kernel default)
    #[arg(long, value_name = "MIB")]
    memory_mb: Option<u64>,

    /// CPU share weight, 1024 = nominal
    #[arg(long)]
    cpu_shares: Option<u64>,

    /// CPU runtime budget in microseconds per 100ms period
    #[arg(long)]
    cpu_quota_us: Option<u64>,

    /// Maximum number of live processes
    #[arg(long)]
    pids_max: Option<u64>,

    /// Rootfs layering mode: overlay, copy or bind
    #[arg(long, value_name = "MODE")]
    mode: Option<RootfsMode>,

    /// Build the base image on first run without prompting
    #[arg(short = 'y', long)]
    assume_yes: bool,
}

fn main() {
    env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .format_module_path(false)
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &cli);
    config.validate()?;

    let image = BaseImage::at(&config.base_image);
    if !image.is_ready() {
        if !cli.assume_yes && !confirm_build(image.root())? {
            println!("Cancelled.");
            return Ok(0);
        }
        image.build()?;
    }

    let layout = CgroupLayout::probe();
    container::run(&config, &layout)
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(mode) = cli.mode {
        config.rootfs_mode = mode;
    }
    let base = config.limits;
    config.limits = LimitSpec::new(
        cli.memory_mb
            .map(|mib| mib * 1024 * 1024)
            .unwrap_or(base.memory_bytes()),
        cli.cpu_shares.unwrap_or(base.cpu_shares()),
        cli.cpu_quota_us.unwrap_or(base.cpu_quota_us()),
        cli.pids_max.unwrap_or(base.pids_max()),
    );
}

/// First-run prompt. A "no" leaves the host untouched.
fn confirm_build(root: &std::path::Path) -> anyhow::Result<bool> {
    print!(
        "No base image found at {}.\n\
         Building it copies a set of host binaries and takes a moment, once.\n\
         Build now? (y/n): ",
        root.display()
    );
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim_start().chars().next(), Some('y' | 'Y')))
}
