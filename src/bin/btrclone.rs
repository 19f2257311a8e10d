use anyhow::Result;
use btrclone::btrfs::Btrfs;
use btrclone::command::{Commander, DryRunCommander, SystemCommander};
use btrclone::orchestrator::{run_clone, CloneOptions};
use btrclone::strategy::StrategyKind;
use btrclone::sys::mount::unshare_mount_namespace;
use clap::{crate_version, Clap};
use human_panic::setup_panic;
use log::*;
use std::path::PathBuf;
use std::rc::Rc;

#[derive(Clap)]
#[clap(version = crate_version!(), author = "rebeagle")]
struct CliOptions {
    /// Mount point of the source filesystem.
    source_mount: PathBuf,

    /// Mount point of the target filesystem.
    target_mount: PathBuf,

    /// Cloning strategy: parent, snapshot, chronological, generation or
    /// bruteforce.
    #[clap(long, default_value = "generation")]
    strategy: StrategyKind,

    /// Keep the top-level snapshot as a subvolume instead of promoting its
    /// contents into the target root.
    #[clap(long)]
    toplevel: bool,

    /// Continue past an identical-uuid or non-empty target, after a ten
    /// second abort window.
    #[clap(long)]
    force: bool,

    /// Print the planned external invocations without executing them.
    #[clap(long)]
    dry_run: bool,

    /// Downgrade transport failures to warnings and keep going.
    #[clap(long)]
    ignore_errors: bool,

    /// Fixed name for the staging directory (random otherwise).
    #[clap(long)]
    snap_base: Option<String>,

    /// Compression level for saved send/receive logs.
    #[clap(long, default_value = "3")]
    log_compresslevel: u32,

    /// Internal: skip mount-namespace unsharing.
    #[clap(long)]
    no_unshare: bool,

    /// Enable debug logs. Use twice to enable trace logs.
    #[clap(short, long, parse(from_occurrences))]
    verbose: i32,
}

fn main() {
    setup_panic!();

    let options: CliOptions = CliOptions::parse();
    let level = match options.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    pretty_env_logger::formatted_builder().filter_level(level).init();

    debug!("Debug verbosity enabled.");
    trace!("Trace verbosity enabled.");

    if let Err(e) = clone(&options) {
        error!("{}", e);
        for cause in e.chain().skip(1) {
            info!("Caused by: {}", cause);
        }
        std::process::exit(1);
    }
}

fn clone(options: &CliOptions) -> Result<()> {
    if !options.no_unshare {
        unshare_mount_namespace()?;
    }

    let runner: Rc<dyn Commander> = if options.dry_run {
        Rc::new(DryRunCommander::new())
    } else {
        Rc::new(SystemCommander)
    };
    let btrfs = Btrfs::new(runner);

    let clone_options = CloneOptions {
        strategy: options.strategy,
        toplevel_promote: !options.toplevel,
        force: options.force,
        ignore_errors: options.ignore_errors,
        snap_base: options.snap_base.clone(),
        save_logs: options.verbose >= 2,
        log_compresslevel: options.log_compresslevel,
    };
    run_clone(
        &btrfs,
        &clone_options,
        &options.source_mount,
        &options.target_mount,
    )
    .map(|_| ())
}
