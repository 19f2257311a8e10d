use crate::btrfs::Btrfs;
use anyhow::{Context, Result};
use log::*;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Deletes the bootstrap snapshot on the source at scope exit.
pub struct SnapshotGuard {
    btrfs: Btrfs,
    path: PathBuf,
    released: bool,
}

impl SnapshotGuard {
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.btrfs.delete_subvolume(&self.path) {
            warn!("Failed to delete bootstrap snapshot {:?}: {:#}", self.path, e);
        }
    }
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct BootstrapOutcome {
    /// Directory the strategies and the staging area build into: the target
    /// top-level after promotion, or the kept snapshot.
    pub target_base: PathBuf,
    /// UUID of the bootstrap snapshot, to exclude from enumeration.
    pub exclude_uuid: Option<Uuid>,
    /// Name of the kept snapshot when promotion is disabled.
    pub kept_snapshot: Option<String>,
}

/// The filesystem refuses to send the top-of-filesystem directly, so a
/// read-only snapshot of it is created, transferred, and either promoted
/// into the target root or kept as a named subvolume.
pub fn bootstrap_root(
    btrfs: &Btrfs,
    source_root: &Path,
    target_root: &Path,
    promote: bool,
) -> Result<(BootstrapOutcome, SnapshotGuard)> {
    let token = crate::sys::random_token();
    let snapshot_path = source_root.join(&token);
    btrfs
        .create_readonly_snapshot(source_root, &snapshot_path)
        .context("Failed to snapshot the source top-of-filesystem.")?;
    let guard = SnapshotGuard {
        btrfs: btrfs.clone(),
        path: snapshot_path.clone(),
        released: false,
    };

    let exclude_uuid = if btrfs.is_dry_run() {
        None
    } else {
        Some(btrfs.subvolume_show(&snapshot_path)?.uuid)
    };

    btrfs
        .send_receive(&snapshot_path, target_root, None, &[])
        .context("Failed to transfer the top-of-filesystem snapshot.")?;
    let received = target_root.join(&token);
    btrfs.set_readonly(&received, false)?;

    let outcome = if promote {
        if btrfs.is_dry_run() {
            info!("DRY-RUN: skipping top-level promotion.");
        } else {
            promote_contents(btrfs, &received, target_root)
                .context("Failed to promote the top-level snapshot contents.")?;
        }
        BootstrapOutcome {
            target_base: target_root.to_path_buf(),
            exclude_uuid,
            kept_snapshot: None,
        }
    } else {
        info!("Keeping the top-level snapshot as subvolume {:?}.", token);
        BootstrapOutcome {
            target_base: received,
            exclude_uuid,
            kept_snapshot: Some(token),
        }
    };
    Ok((outcome, guard))
}

/// Moves every entry of the received snapshot up into the target root,
/// skipping anything on a different device (a nested mount), then deletes
/// the emptied snapshot.
fn promote_contents(btrfs: &Btrfs, received: &Path, target_root: &Path) -> Result<()> {
    let snapshot_dev = fs::metadata(received)
        .context("Failed to stat the received snapshot.")?
        .dev();
    for entry in fs::read_dir(received).context("Failed to read the received snapshot.")? {
        let entry = entry?;
        let dev = entry
            .path()
            .symlink_metadata()
            .context("Failed to stat a snapshot entry.")?
            .dev();
        if dev != snapshot_dev {
            info!("Skipping {:?}: nested mount.", entry.path());
            continue;
        }
        let goal = target_root.join(entry.file_name());
        fs::rename(entry.path(), &goal)
            .context(format!("Failed to promote {:?} to {:?}.", entry.path(), goal))?;
    }
    btrfs.delete_subvolume(received)
}
