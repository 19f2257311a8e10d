use crate::btrfs::Btrfs;
use crate::sys::fs::resolve_btrfs_mount;
use anyhow::{Context, Result};
use log::*;
use nix::mount::MsFlags;
use nix::sched::CloneFlags;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Detaches this process into a private mount namespace so the temporary
/// top-level mounts never leak into the host's mount table.
pub fn unshare_mount_namespace() -> Result<()> {
    nix::sched::unshare(CloneFlags::CLONE_NEWNS).context("Failed to unshare mount namespace.")?;
    nix::mount::mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .context("Failed to make mount propagation private.")?;
    debug!("Mount namespace unshared.");
    Ok(())
}

/// A top-of-filesystem (subvolid=5) view of one btrfs filesystem. Either a
/// reused user mount or a private temporary mount torn down on drop.
pub struct TopLevelMount {
    btrfs: Btrfs,
    pub fs_uuid: Uuid,
    path: PathBuf,
    owned: bool,
    released: bool,
}

impl TopLevelMount {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(&mut self) {
        if self.released || !self.owned {
            self.released = true;
            return;
        }
        self.released = true;
        let argv: Vec<OsString> = vec![OsString::from("umount"), self.path.clone().into()];
        if let Err(e) = self.btrfs.runner().run(argv) {
            warn!("Failed to unmount {:?}: {}", self.path, e);
            return;
        }
        if let Err(e) = fs::remove_dir(&self.path) {
            warn!("Failed to remove mount directory {:?}: {}", self.path, e);
        }
    }
}

impl Drop for TopLevelMount {
    fn drop(&mut self) {
        self.release();
    }
}

/// Resolves the filesystem behind `user_mount` and produces a top-level
/// mount of it. When the supplied mount point already is the top-level
/// subvolume it is used directly; otherwise the filesystem is mounted with
/// `subvolid=5` under a fresh temporary directory.
pub fn mount_toplevel(btrfs: &Btrfs, user_mount: &Path) -> Result<TopLevelMount> {
    let mount = resolve_btrfs_mount(user_mount)?;
    let fs_uuid = btrfs.filesystem_uuid(user_mount)?;

    if mount.is_toplevel() {
        debug!("{:?} already mounts the top-level subvolume.", user_mount);
        return Ok(TopLevelMount {
            btrfs: btrfs.clone(),
            fs_uuid,
            path: mount.mountpoint,
            owned: false,
            released: false,
        });
    }

    let mount_dir = std::env::temp_dir().join(format!("btrclone-{}", super::random_token()));
    fs::create_dir(&mount_dir).context("Failed to create temporary mount directory.")?;
    let argv: Vec<OsString> = vec![
        OsString::from("mount"),
        OsString::from("-t"),
        OsString::from("btrfs"),
        OsString::from("-o"),
        OsString::from("subvolid=5"),
        OsString::from(format!("UUID={}", fs_uuid)),
        mount_dir.clone().into(),
    ];
    btrfs
        .runner()
        .run(argv)
        .context(format!("Failed to mount filesystem {} top-level.", fs_uuid))?;
    info!("Mounted top-level of {} at {:?}.", fs_uuid, mount_dir);

    Ok(TopLevelMount {
        btrfs: btrfs.clone(),
        fs_uuid,
        path: mount_dir,
        owned: true,
        released: false,
    })
}
