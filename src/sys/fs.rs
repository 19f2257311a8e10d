use crate::model::TOPLEVEL_ID;
use anyhow::{anyhow, bail, Result};
use mnt::{MntOps, MountEntry, MountIter};
use std::path::{Path, PathBuf};

/// What the mount table says about a filesystem argument: where it is
/// mounted and which subvolume of the filesystem that mount exposes.
#[derive(Debug, PartialEq)]
pub struct MountedSubvolume {
    pub mountpoint: PathBuf,
    pub subvol_id: Option<u64>,
    pub subvol_path: Option<String>,
}

impl MountedSubvolume {
    /// True when the mount already exposes the top-of-filesystem, so no
    /// private subvolid mount is needed on top of it. A btrfs mount without
    /// subvolume options is the whole filesystem too.
    pub fn is_toplevel(&self) -> bool {
        match (self.subvol_id, self.subvol_path.as_deref()) {
            (None, None) => true,
            (id, path) => id == Some(TOPLEVEL_ID) || path == Some("/"),
        }
    }
}

/// Resolves a user-supplied mount point against the mount table, requiring
/// an exact mount-point match on a btrfs filesystem. Unparseable table
/// lines are skipped.
pub fn resolve_btrfs_mount(target: &Path) -> Result<MountedSubvolume> {
    let entry = MountIter::new_from_proc()
        .map_err(|e| anyhow!("Failed to read the mount table: {:?}", e))?
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.file == target)
        .ok_or_else(|| anyhow!("{:?} is not a mount point.", target))?;
    classify(entry)
}

fn classify(entry: MountEntry) -> Result<MountedSubvolume> {
    if entry.vfstype != "btrfs" {
        bail!(
            "{:?} is mounted as {}, expected btrfs.",
            entry.file,
            entry.vfstype
        );
    }
    Ok(MountedSubvolume {
        subvol_id: mount_option(&entry, "subvolid").and_then(|v| v.parse().ok()),
        subvol_path: mount_option(&entry, "subvol"),
        mountpoint: entry.file,
    })
}

fn mount_option(entry: &MountEntry, name: &str) -> Option<String> {
    entry.mntops.iter().find_map(|op| match op {
        MntOps::Extra(extra) => {
            let (key, value) = extra.split_once('=')?;
            if key == name {
                Some(value.to_string())
            } else {
                None
            }
        }
        _ => None,
    })
}
