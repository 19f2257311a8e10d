use crate::btrfs::Btrfs;
use crate::model::{Subvolume, TOPLEVEL_ID};
use anyhow::{Context, Result};
use log::*;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

pub enum ReceiveOutcome {
    /// Transferred; holds the captured send/receive stderr.
    Received(Vec<u8>),
    /// The bucket already held this subvolume (resume or repeated run).
    AlreadyPresent,
}

#[derive(Debug, Default, PartialEq)]
pub struct CommitReport {
    pub moved: usize,
    pub already_present: usize,
    pub stranded: Vec<PathBuf>,
    pub failed: usize,
}

/// Flat temporary directory on the target that decouples transfer order
/// from the identifier tree. Every subvolume is received into a bucket named
/// by its source id; `commit` reassembles the tree afterwards.
pub struct StagingArea {
    btrfs: Btrfs,
    target_root: PathBuf,
    base: PathBuf,
}

impl StagingArea {
    pub fn create(btrfs: &Btrfs, target_root: &Path, name: Option<&str>) -> Result<Self> {
        let name = match name {
            Some(n) => n.to_string(),
            None => crate::sys::random_token(),
        };
        let base = target_root.join(&name);
        if base.exists() {
            info!(
                "Staging directory {:?} already exists; resuming into it.",
                base
            );
        } else if !btrfs.is_dry_run() {
            fs::create_dir(&base).context("Failed to create staging directory.")?;
        }
        debug!("Staging subvolumes under {:?}.", base);
        Ok(Self {
            btrfs: btrfs.clone(),
            target_root: target_root.to_path_buf(),
            base,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn bucket(&self, subvol: &Subvolume) -> PathBuf {
        self.base.join(subvol.id.to_string())
    }

    /// Receives `subvol` into its bucket. Skips the transfer when the bucket
    /// already holds it, so a rerun against a partially populated target
    /// resumes instead of failing.
    pub fn receive(
        &self,
        subvol: &Subvolume,
        source_mount: &Path,
        parent: Option<&Subvolume>,
        clone_sources: &[Rc<Subvolume>],
    ) -> Result<ReceiveOutcome> {
        let bucket = self.bucket(subvol);
        let staged = bucket.join(subvol.basename());
        if staged.exists() {
            debug!("{:?} already staged; skipping transfer.", subvol.path);
            return Ok(ReceiveOutcome::AlreadyPresent);
        }
        if !self.btrfs.is_dry_run() {
            fs::create_dir_all(&bucket).context("Failed to create staging bucket.")?;
        }

        let parent_path = parent.map(|p| p.fs_path(source_mount));
        let clone_paths: Vec<PathBuf> = clone_sources
            .iter()
            .map(|c| c.fs_path(source_mount))
            .collect();
        let log = self
            .btrfs
            .send_receive(
                &subvol.fs_path(source_mount),
                &bucket,
                parent_path.as_deref(),
                &clone_paths,
            )
            .map_err(anyhow::Error::from)?;

        if !subvol.ro {
            self.btrfs.set_readonly(&staged, false)?;
        }
        Ok(ReceiveOutcome::Received(log))
    }

    /// Moves every transferred subvolume from its bucket to its final tree
    /// position, honoring the `parent_id` dependency order, then removes the
    /// staging root. Individual failures strand the subvolume and are
    /// reported, not fatal.
    pub fn commit(&self, transferred: &[Rc<Subvolume>]) -> CommitReport {
        let mut report = CommitReport::default();
        if self.btrfs.is_dry_run() {
            info!("DRY-RUN: skipping staging commit.");
            return report;
        }

        let mut ordered: Vec<&Rc<Subvolume>> = transferred.iter().collect();
        ordered.sort_by_key(|s| (s.parent_id, s.id));

        let mut done: HashSet<u64> = HashSet::new();
        for subvol in ordered {
            if !(subvol.parent_id == TOPLEVEL_ID || done.contains(&subvol.parent_id)) {
                warn!(
                    "Subvolume {:?} stranded in staging: parent id {} was never placed.",
                    subvol.path, subvol.parent_id
                );
                report.stranded.push(subvol.path.clone());
                continue;
            }

            let bucket = self.bucket(subvol);
            let staged = bucket.join(subvol.basename());
            let goal = self.target_root.join(&subvol.path);

            if !staged.exists() {
                if goal.exists() {
                    debug!("{:?} already at its final position.", subvol.path);
                    done.insert(subvol.id);
                    report.already_present += 1;
                } else {
                    error!(
                        "Staging bucket for {:?} vanished; leaving it behind.",
                        subvol.path
                    );
                    report.failed += 1;
                }
                continue;
            }

            match self.place(subvol, &staged, &goal) {
                Ok(()) => {
                    done.insert(subvol.id);
                    report.moved += 1;
                    if let Err(e) = fs::remove_dir(&bucket) {
                        warn!("Failed to remove staging bucket {:?}: {}", bucket, e);
                    }
                }
                Err(e) => {
                    error!("Failed to place {:?}: {:#}", subvol.path, e);
                    report.failed += 1;
                }
            }
        }

        if let Err(e) = fs::remove_dir(&self.base) {
            warn!("Failed to remove staging directory {:?}: {}", self.base, e);
        }
        report
    }

    /// One rename from bucket to final position. Read-only subvolumes are
    /// made writable for the duration of the move; the window closes whether
    /// or not the rename succeeds. `rename(2)` replaces the empty
    /// placeholder directory left behind by top-level promotion.
    fn place(&self, subvol: &Subvolume, staged: &Path, goal: &Path) -> Result<()> {
        if subvol.ro {
            self.btrfs.set_readonly(staged, false)?;
        }
        let moved = fs::rename(staged, goal)
            .context(format!("Failed to move {:?} to {:?}.", staged, goal));
        if subvol.ro {
            let restore_at = if moved.is_ok() { goal } else { staged };
            if let Err(e) = self.btrfs.set_readonly(restore_at, true) {
                warn!(
                    "Failed to restore read-only on {:?} after move: {:#}",
                    restore_at, e
                );
            }
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::MockCommander;
    use std::ffi::OsString;
    use uuid::Uuid;

    fn subvol(id: u64, parent_id: u64, path: &str, ro: bool) -> Rc<Subvolume> {
        Rc::new(Subvolume {
            path: PathBuf::from(path),
            id,
            parent_id,
            uuid: Uuid::new_v4(),
            parent_uuid: None,
            gen: 10,
            ogen: 10,
            ro,
        })
    }

    fn lossy(argv: &[OsString]) -> Vec<String> {
        argv.iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn live_mock() -> MockCommander {
        let mut mock = MockCommander::new();
        mock.expect_is_dry_run().return_const(false);
        mock
    }

    #[test]
    fn receive_creates_bucket_and_flips_readwrite() {
        let target = tempfile::tempdir().unwrap();
        let mut mock = live_mock();
        mock.expect_run_piped()
            .withf(|producer, consumer| {
                lossy(producer) == ["btrfs", "send", "/mnt/src/data"]
                    && lossy(consumer).last().unwrap().ends_with("/260")
            })
            .returning(|_, _| Ok(Vec::new()));
        mock.expect_run_mutating()
            .withf(|argv| {
                let argv = lossy(argv);
                argv[1] == "property" && argv[2] == "set" && argv[5] == "ro" && argv[6] == "false"
            })
            .returning(|_| Ok(String::new()));

        let btrfs = Btrfs::new(Rc::new(mock));
        let staging = StagingArea::create(&btrfs, target.path(), Some("stage")).unwrap();
        let s = subvol(260, 5, "data", false);
        match staging.receive(&s, Path::new("/mnt/src"), None, &[]).unwrap() {
            ReceiveOutcome::Received(_) => {}
            ReceiveOutcome::AlreadyPresent => panic!("expected a transfer"),
        }
        assert!(target.path().join("stage/260").is_dir());
    }

    #[test]
    fn receive_skips_already_staged_subvolume() {
        let target = tempfile::tempdir().unwrap();
        let mock = live_mock();
        // no run_piped expectation: a transfer would panic the mock
        let btrfs = Btrfs::new(Rc::new(mock));
        let staging = StagingArea::create(&btrfs, target.path(), Some("stage")).unwrap();
        fs::create_dir_all(target.path().join("stage/260/data")).unwrap();

        let s = subvol(260, 5, "data", true);
        match staging.receive(&s, Path::new("/mnt/src"), None, &[]).unwrap() {
            ReceiveOutcome::AlreadyPresent => {}
            ReceiveOutcome::Received(_) => panic!("expected a skip"),
        }
    }

    #[test]
    fn commit_places_parents_before_children_and_reports_stranded() {
        let target = tempfile::tempdir().unwrap();
        let mut mock = live_mock();
        mock.expect_run_mutating().returning(|_| Ok(String::new()));
        let btrfs = Btrfs::new(Rc::new(mock));
        let staging = StagingArea::create(&btrfs, target.path(), Some("stage")).unwrap();

        // promotion placeholder for the top-level child
        fs::create_dir(target.path().join("a")).unwrap();
        // staged subvolumes: a (toplevel), a/b (child of a), c (orphan parent)
        fs::create_dir_all(target.path().join("stage/256/a")).unwrap();
        fs::write(target.path().join("stage/256/a/file"), b"x").unwrap();
        fs::create_dir_all(target.path().join("stage/257/b")).unwrap();
        fs::create_dir_all(target.path().join("stage/300/c")).unwrap();

        let subvols = vec![
            subvol(257, 256, "a/b", true),
            subvol(256, 5, "a", false),
            subvol(300, 999, "c", false),
        ];
        let report = staging.commit(&subvols);

        assert_eq!(report.moved, 2);
        assert_eq!(report.stranded, vec![PathBuf::from("c")]);
        assert_eq!(report.failed, 0);
        assert!(target.path().join("a/file").is_file());
        assert!(target.path().join("a/b").is_dir());
        assert!(!target.path().join("stage/256").exists());
        assert!(!target.path().join("stage/257").exists());
        // stranded bucket survives, so the staging root does too
        assert!(target.path().join("stage/300/c").is_dir());
    }

    #[test]
    fn commit_treats_existing_goal_as_success() {
        let target = tempfile::tempdir().unwrap();
        let mut mock = live_mock();
        mock.expect_run_mutating().returning(|_| Ok(String::new()));
        let btrfs = Btrfs::new(Rc::new(mock));
        let staging = StagingArea::create(&btrfs, target.path(), Some("stage")).unwrap();

        // "a" was placed by an earlier run; only its child is still staged
        fs::create_dir(target.path().join("a")).unwrap();
        fs::create_dir_all(target.path().join("stage/257/b")).unwrap();

        let subvols = vec![subvol(256, 5, "a", false), subvol(257, 256, "a/b", false)];
        let report = staging.commit(&subvols);

        assert_eq!(report.already_present, 1);
        assert_eq!(report.moved, 1);
        assert!(report.stranded.is_empty());
        assert!(target.path().join("a/b").is_dir());
        assert!(!target.path().join("stage").exists());
    }

    #[test]
    fn commit_readonly_move_opens_and_closes_the_window() {
        let target = tempfile::tempdir().unwrap();
        let mut mock = live_mock();
        let mut seq = mockall::Sequence::new();
        mock.expect_run_mutating()
            .withf(|argv| {
                let argv = lossy(argv);
                argv[6] == "false" && argv[4].ends_with("stage/256/a")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(String::new()));
        mock.expect_run_mutating()
            .withf(|argv| {
                let argv = lossy(argv);
                argv[6] == "true" && argv[4].ends_with("/a") && !argv[4].contains("stage")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(String::new()));
        let btrfs = Btrfs::new(Rc::new(mock));
        let staging = StagingArea::create(&btrfs, target.path(), Some("stage")).unwrap();
        fs::create_dir_all(target.path().join("stage/256/a")).unwrap();

        let report = staging.commit(&[subvol(256, 5, "a", true)]);
        assert_eq!(report.moved, 1);
    }
}
