use crate::btrfs::Btrfs;
use crate::model::Subvolume;
use anyhow::Result;
use log::*;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Holds every originally read-write source subvolume read-only for the
/// duration of cloning. Release restores them in reverse order and runs on
/// drop, so unwinding from any inner failure still restores the source.
pub struct ReadOnlyGuard {
    btrfs: Btrfs,
    restore: Vec<PathBuf>,
    released: bool,
}

impl ReadOnlyGuard {
    /// Sets every read-write subvolume read-only. A failure propagates; the
    /// partially engaged guard restores whatever it had flipped already.
    pub fn engage(btrfs: &Btrfs, source_mount: &Path, subvols: &[Rc<Subvolume>]) -> Result<Self> {
        let mut guard = Self {
            btrfs: btrfs.clone(),
            restore: Vec::new(),
            released: false,
        };
        for subvol in subvols.iter().filter(|s| !s.ro) {
            let path = subvol.fs_path(source_mount);
            guard.btrfs.set_readonly(&path, true)?;
            guard.restore.push(path);
        }
        debug!(
            "Read-only guard engaged over {} subvolumes.",
            guard.restore.len()
        );
        Ok(guard)
    }

    /// Reverts the flipped subvolumes to read-write, newest flip first.
    /// Idempotent; individual failures are logged and do not stop the rest.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for path in self.restore.iter().rev() {
            if let Err(e) = self.btrfs.set_readonly(path, false) {
                warn!("Failed to restore read-write on {:?}: {:#}", path, e);
            }
        }
        self.restore.clear();
    }
}

impl Drop for ReadOnlyGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::MockCommander;
    use anyhow::anyhow;
    use std::ffi::OsString;
    use uuid::Uuid;

    fn subvol(path: &str, ro: bool) -> Rc<Subvolume> {
        Rc::new(Subvolume {
            path: PathBuf::from(path),
            id: 256,
            parent_id: 5,
            uuid: Uuid::new_v4(),
            parent_uuid: None,
            gen: 10,
            ogen: 10,
            ro,
        })
    }

    fn expect_flip(
        mock: &mut MockCommander,
        seq: &mut mockall::Sequence,
        path: &'static str,
        value: &'static str,
        result: Result<()>,
    ) {
        mock.expect_run_mutating()
            .withf(move |argv: &Vec<OsString>| {
                argv[4] == OsString::from(path) && argv[6] == OsString::from(value)
            })
            .times(1)
            .in_sequence(seq)
            .returning(move |_| match &result {
                Ok(()) => Ok(String::new()),
                Err(e) => Err(anyhow!("{}", e)),
            });
    }

    #[test]
    fn engage_flips_only_readwrite_and_release_reverses() {
        let mut mock = MockCommander::new();
        let mut seq = mockall::Sequence::new();
        expect_flip(&mut mock, &mut seq, "/mnt/src/a", "true", Ok(()));
        expect_flip(&mut mock, &mut seq, "/mnt/src/b", "true", Ok(()));
        expect_flip(&mut mock, &mut seq, "/mnt/src/b", "false", Ok(()));
        expect_flip(&mut mock, &mut seq, "/mnt/src/a", "false", Ok(()));
        let btrfs = Btrfs::new(Rc::new(mock));

        let subvols = vec![subvol("a", false), subvol("snap", true), subvol("b", false)];
        let mut guard = ReadOnlyGuard::engage(&btrfs, Path::new("/mnt/src"), &subvols).unwrap();
        guard.release();
        // drop after release must not flip anything again
        drop(guard);
    }

    #[test]
    fn drop_releases_without_explicit_call() {
        let mut mock = MockCommander::new();
        let mut seq = mockall::Sequence::new();
        expect_flip(&mut mock, &mut seq, "/mnt/src/a", "true", Ok(()));
        expect_flip(&mut mock, &mut seq, "/mnt/src/a", "false", Ok(()));
        let btrfs = Btrfs::new(Rc::new(mock));

        let subvols = vec![subvol("a", false)];
        let guard = ReadOnlyGuard::engage(&btrfs, Path::new("/mnt/src"), &subvols).unwrap();
        drop(guard);
    }

    #[test]
    fn failed_engage_restores_partial_flips() {
        let mut mock = MockCommander::new();
        let mut seq = mockall::Sequence::new();
        expect_flip(&mut mock, &mut seq, "/mnt/src/a", "true", Ok(()));
        expect_flip(&mut mock, &mut seq, "/mnt/src/b", "true", Err(anyhow!("EPERM")));
        expect_flip(&mut mock, &mut seq, "/mnt/src/a", "false", Ok(()));
        let btrfs = Btrfs::new(Rc::new(mock));

        let subvols = vec![subvol("a", false), subvol("b", false)];
        assert!(ReadOnlyGuard::engage(&btrfs, Path::new("/mnt/src"), &subvols).is_err());
    }

    #[test]
    fn release_continues_past_individual_failures() {
        let mut mock = MockCommander::new();
        let mut seq = mockall::Sequence::new();
        expect_flip(&mut mock, &mut seq, "/mnt/src/a", "true", Ok(()));
        expect_flip(&mut mock, &mut seq, "/mnt/src/b", "true", Ok(()));
        expect_flip(&mut mock, &mut seq, "/mnt/src/b", "false", Err(anyhow!("EPERM")));
        expect_flip(&mut mock, &mut seq, "/mnt/src/a", "false", Ok(()));
        let btrfs = Btrfs::new(Rc::new(mock));

        let subvols = vec![subvol("a", false), subvol("b", false)];
        let mut guard = ReadOnlyGuard::engage(&btrfs, Path::new("/mnt/src"), &subvols).unwrap();
        guard.release();
    }
}
