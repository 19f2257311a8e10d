use crate::bootstrap::bootstrap_root;
use crate::btrfs::{Btrfs, TransportError};
use crate::graph::SubvolumeGraph;
use crate::guard::ReadOnlyGuard;
use crate::model::Subvolume;
use crate::sendlog;
use crate::staging::{ReceiveOutcome, StagingArea};
use crate::strategy::{Selection, Strategy, StrategyKind, TransferSink};
use crate::sys::mount::mount_toplevel;
use anyhow::{anyhow, Context, Result};
use log::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

pub struct CloneOptions {
    pub strategy: StrategyKind,
    /// Promote the received top-level snapshot's contents into the target
    /// root (disabled by `--toplevel`).
    pub toplevel_promote: bool,
    pub force: bool,
    pub ignore_errors: bool,
    pub snap_base: Option<String>,
    /// Save per-transfer send/receive logs into the working directory.
    pub save_logs: bool,
    pub log_compresslevel: u32,
}

#[derive(Debug, Default, PartialEq)]
pub struct CloneSummary {
    pub transferred: usize,
    pub already_present: usize,
    pub ignored_failures: usize,
    pub stranded: usize,
}

/// Fatal unless forced: cloning a filesystem onto itself, or onto a target
/// that already has content. Returns the conflict descriptions to warn
/// about when `force` is set.
fn check_conflicts(
    source_uuid: uuid::Uuid,
    target_uuid: uuid::Uuid,
    target_empty: bool,
    force: bool,
) -> Result<Vec<String>> {
    let mut conflicts = Vec::new();
    if source_uuid == target_uuid {
        conflicts.push(format!(
            "source and target are the same filesystem ({})",
            source_uuid
        ));
    }
    if !target_empty {
        conflicts.push("target filesystem is not empty".to_string());
    }
    if conflicts.is_empty() || force {
        Ok(conflicts)
    } else {
        Err(anyhow!(
            "Refusing to clone: {}. Use --force to override.",
            conflicts.join("; ")
        ))
    }
}

fn directory_is_empty(path: &Path) -> Result<bool> {
    Ok(fs::read_dir(path)
        .context(format!("Failed to read target directory {:?}.", path))?
        .next()
        .is_none())
}

/// Executes the transfers a strategy plans: into the staging area, or
/// directly at the final tree position for the non-staging strategies.
/// Applies the `--ignore-errors` policy and collects the summary.
struct CloneRun {
    btrfs: Btrfs,
    source_mount: PathBuf,
    target_base: PathBuf,
    staging: Option<StagingArea>,
    transferred: Vec<Rc<Subvolume>>,
    ignore_errors: bool,
    save_logs: bool,
    log_compresslevel: u32,
    already_present: usize,
    ignored_failures: usize,
}

impl CloneRun {
    fn receive_direct(&self, subvol: &Rc<Subvolume>, selection: &Selection) -> Result<ReceiveOutcome> {
        let goal = self.target_base.join(&subvol.path);
        if !self.btrfs.is_dry_run() && goal.exists() {
            if directory_is_empty(&goal)? {
                // placeholder directory left behind by top-level promotion
                fs::remove_dir(&goal)
                    .context(format!("Failed to clear placeholder {:?}.", goal))?;
            } else {
                debug!("{:?} already on target; skipping transfer.", subvol.path);
                return Ok(ReceiveOutcome::AlreadyPresent);
            }
        }
        let receive_dir = goal.parent().map(Path::to_path_buf).unwrap_or_else(|| {
            self.target_base.clone()
        });
        let parent_path = selection
            .best
            .as_ref()
            .map(|b| b.fs_path(&self.source_mount));
        let clone_paths: Vec<PathBuf> = selection
            .clone_sources
            .iter()
            .map(|c| c.fs_path(&self.source_mount))
            .collect();
        let log = self.btrfs.send_receive(
            &subvol.fs_path(&self.source_mount),
            &receive_dir,
            parent_path.as_deref(),
            &clone_paths,
        )?;
        if !subvol.ro {
            self.btrfs.set_readonly(&goal, false)?;
        }
        Ok(ReceiveOutcome::Received(log))
    }
}

impl TransferSink for CloneRun {
    fn transfer(&mut self, subvol: &Rc<Subvolume>, selection: &Selection) -> Result<bool> {
        info!(
            "Sending {:?} with parent {:?} and {} clone sources ({}).",
            subvol.path,
            selection.best.as_ref().map(|b| &b.path),
            selection.clone_sources.len(),
            selection.reason
        );
        let outcome = match &self.staging {
            Some(staging) => staging.receive(
                subvol,
                &self.source_mount,
                selection.best.as_deref(),
                &selection.clone_sources,
            ),
            None => self.receive_direct(subvol, selection),
        };
        match outcome {
            Ok(ReceiveOutcome::Received(log)) => {
                if self.save_logs && !log.is_empty() {
                    match sendlog::save_transfer_log(
                        Path::new("."),
                        &subvol.path,
                        &log,
                        self.log_compresslevel,
                    ) {
                        Ok(path) => debug!("Saved transfer log to {:?}.", path),
                        Err(e) => warn!("{:#}", e),
                    }
                }
                self.transferred.push(Rc::clone(subvol));
                Ok(true)
            }
            Ok(ReceiveOutcome::AlreadyPresent) => {
                self.already_present += 1;
                self.transferred.push(Rc::clone(subvol));
                Ok(true)
            }
            Err(e) if e.downcast_ref::<TransportError>().is_some() && self.ignore_errors => {
                warn!("Ignoring failed transfer of {:?}: {:#}", subvol.path, e);
                self.ignored_failures += 1;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// The complete cloning sequence. Guards are declared in acquisition order,
/// so unwinding from any point releases the read-only guard first, then the
/// bootstrap snapshot, then the temporary mounts.
pub fn run_clone(
    btrfs: &Btrfs,
    options: &CloneOptions,
    source_arg: &Path,
    target_arg: &Path,
) -> Result<CloneSummary> {
    let source_mount = mount_toplevel(btrfs, source_arg)?;
    let target_mount = mount_toplevel(btrfs, target_arg)?;

    let conflicts = check_conflicts(
        source_mount.fs_uuid,
        target_mount.fs_uuid,
        directory_is_empty(target_mount.path())?,
        options.force,
    )?;
    if !conflicts.is_empty() {
        for conflict in &conflicts {
            warn!("Forced past conflict: {}.", conflict);
        }
        warn!("Continuing in 10 seconds; interrupt to abort.");
        std::thread::sleep(Duration::from_secs(10));
    }

    let (bootstrap, _snapshot_guard) = bootstrap_root(
        btrfs,
        source_mount.path(),
        target_mount.path(),
        options.toplevel_promote,
    )?;
    if let Some(name) = &bootstrap.kept_snapshot {
        info!("Top-level contents live in subvolume {:?} on the target.", name);
    }

    let subvols: Vec<Subvolume> = btrfs
        .enumerate_subvolumes(source_mount.path())?
        .into_iter()
        .filter(|s| Some(s.uuid) != bootstrap.exclude_uuid)
        .collect();
    info!("Cloning {} subvolumes.", subvols.len());
    let graph = SubvolumeGraph::new(subvols)?;
    let all: Vec<Rc<Subvolume>> = graph.iter().cloned().collect();

    let mut readonly_guard = ReadOnlyGuard::engage(btrfs, source_mount.path(), &all)?;

    let strategy = options.strategy.build();
    debug!("Using the {} strategy.", strategy.name());
    let staging = if strategy.uses_staging() {
        Some(StagingArea::create(
            btrfs,
            &bootstrap.target_base,
            options.snap_base.as_deref(),
        )?)
    } else {
        None
    };

    let mut run = CloneRun {
        btrfs: btrfs.clone(),
        source_mount: source_mount.path().to_path_buf(),
        target_base: bootstrap.target_base.clone(),
        staging,
        transferred: Vec::new(),
        ignore_errors: options.ignore_errors,
        save_logs: options.save_logs,
        log_compresslevel: options.log_compresslevel,
        already_present: 0,
        ignored_failures: 0,
    };
    strategy.execute(&graph, &mut run)?;

    let mut summary = CloneSummary {
        transferred: run.transferred.len() - run.already_present,
        already_present: run.already_present,
        ignored_failures: run.ignored_failures,
        stranded: 0,
    };
    if let Some(staging) = &run.staging {
        let report = staging.commit(&run.transferred);
        summary.stranded = report.stranded.len();
    }

    readonly_guard.release();
    info!(
        "Done: {} transferred, {} already present, {} failures ignored, {} stranded.",
        summary.transferred, summary.already_present, summary.ignored_failures, summary.stranded
    );
    Ok(summary)
}
