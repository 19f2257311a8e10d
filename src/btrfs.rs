use crate::command::Commander;
use crate::model::Subvolume;
use crate::parsing::{envy_pairs, property_value, show_fields};
use anyhow::{anyhow, bail, Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::str::FromStr;
use uuid::Uuid;

/// A sender or receiver process exited non-zero. The orchestrator downgrades
/// this kind to a warning under `--ignore-errors`; every other failure stays
/// fatal.
#[derive(thiserror::Error, Debug)]
#[error("send/receive of {subvol:?} failed")]
pub struct TransportError {
    pub subvol: PathBuf,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

const EXPECTED_LIST_HEADER: [&str; 10] = [
    "ID",
    "gen",
    "cgen",
    "parent",
    "top",
    "level",
    "parent_uuid",
    "received_uuid",
    "uuid",
    "path",
];

fn os(s: impl AsRef<OsStr>) -> OsString {
    s.as_ref().to_os_string()
}

fn btrfs_argv(args: &[&str]) -> Vec<OsString> {
    let mut argv = vec![os("btrfs")];
    argv.extend(args.iter().map(os));
    argv
}

/// All btrfs operations the tool performs, routed through one [`Commander`].
/// Clones share the runner, so scoped guards can carry their own handle.
#[derive(Clone)]
pub struct Btrfs {
    runner: Rc<dyn Commander>,
}

impl Btrfs {
    pub fn new(runner: Rc<dyn Commander>) -> Self {
        Self { runner }
    }

    pub fn is_dry_run(&self) -> bool {
        self.runner.is_dry_run()
    }

    pub fn runner(&self) -> &Rc<dyn Commander> {
        &self.runner
    }

    /// UUID of the filesystem backing `path`, from `btrfs filesystem show`.
    pub fn filesystem_uuid(&self, path: &Path) -> Result<Uuid> {
        let mut argv = btrfs_argv(&["filesystem", "show", "--raw"]);
        argv.push(os(path));
        let output_data = self
            .runner
            .run(argv)
            .context("Failed to run btrfs to get filesystem information.")?;

        lazy_static! {
            static ref RE_UUID: Regex = Regex::new(r"(?m)\buuid:\s+(.*?)\s*$").unwrap();
        }
        RE_UUID
            .captures(&output_data)
            .and_then(|m| m.get(1))
            .ok_or_else(|| anyhow!("No uuid in btrfs filesystem show output."))?
            .as_str()
            .parse()
            .context("Failed to parse filesystem uuid.")
    }

    /// Enumerates every subvolume of the filesystem mounted at `mount`,
    /// including the per-subvolume read-only bit, ordered by `ogen`
    /// ascending. Rows that do not look like subvolume records are skipped;
    /// a record with an unparsable required field fails the enumeration.
    pub fn enumerate_subvolumes(&self, mount: &Path) -> Result<Vec<Subvolume>> {
        let mut argv = btrfs_argv(&["subvolume", "list", "-tupcqR", "--sort=rootid"]);
        argv.push(os(mount));
        let output_data = self
            .runner
            .run(argv)
            .context("Failed to list source subvolumes.")?;

        let mut lines = output_data.lines();
        let header: Vec<&str> = lines
            .next()
            .ok_or_else(|| anyhow!("Empty subvolume list output."))?
            .split_ascii_whitespace()
            .collect();
        if header != EXPECTED_LIST_HEADER {
            bail!("Unexpected subvolume list header: {:?}", header);
        }

        let mut subvols = Vec::new();
        for line in lines {
            let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
            if tokens.len() != 9 || tokens[0].starts_with('-') {
                // header separator, blank line or truncated row
                continue;
            }
            subvols.push(self.parse_list_row(&tokens, mount)?);
        }
        subvols.sort_by_key(|s| s.ogen);
        Ok(subvols)
    }

    fn parse_list_row(&self, tokens: &[&str], mount: &Path) -> Result<Subvolume> {
        let numeric = |i: usize, what: &str| -> Result<u64> {
            tokens[i]
                .parse()
                .context(format!("Subvolume record has invalid {}.", what))
        };
        let path = PathBuf::from(tokens[8]);
        let ro = self.get_readonly(&mount.join(&path))?;
        Ok(Subvolume {
            id: numeric(0, "id")?,
            gen: numeric(1, "generation")?,
            ogen: numeric(2, "creation generation")?,
            parent_id: numeric(3, "parent id")?,
            parent_uuid: match tokens[5] {
                "-" => None,
                s => Some(
                    Uuid::from_str(s).context("Subvolume record has invalid parent uuid.")?,
                ),
            },
            uuid: Uuid::from_str(tokens[7]).context("Subvolume record has invalid uuid.")?,
            path,
            ro,
        })
    }

    /// Detail of one subvolume from `btrfs subvolume show`.
    pub fn subvolume_show(&self, path: &Path) -> Result<SubvolumeDetail> {
        let mut argv = btrfs_argv(&["subvolume", "show", "--raw"]);
        argv.push(os(path));
        let output_data = self
            .runner
            .run(argv)
            .context(format!("Failed to show subvolume {:?}.", path))?;

        envy::from_iter::<_, SubvolumeDetail>(envy_pairs(show_fields(&output_data)))
            .context("Failed loading information from btrfs subvolume show output.")
    }

    pub fn create_readonly_snapshot(&self, source: &Path, target: &Path) -> Result<()> {
        if target.exists() {
            bail!("Path to new snapshot, {:?}, already exists!", target)
        }
        let mut argv = btrfs_argv(&["subvolume", "snapshot", "-r"]);
        argv.push(os(source));
        argv.push(os(target));
        self.runner
            .run_mutating(argv)
            .context(format!("Failed to create btrfs snapshot at {:?}.", target))
            .map(|_| ())
    }

    pub fn delete_subvolume(&self, path: &Path) -> Result<()> {
        let mut argv = btrfs_argv(&["subvolume", "delete"]);
        argv.push(os(path));
        self.runner
            .run_mutating(argv)
            .context(format!("Failed to delete btrfs subvolume at {:?}.", path))
            .map(|_| ())
    }

    pub fn set_readonly(&self, path: &Path, ro: bool) -> Result<()> {
        let mut argv = btrfs_argv(&["property", "set", "-ts"]);
        argv.push(os(path));
        argv.push(os("ro"));
        argv.push(os(if ro { "true" } else { "false" }));
        self.runner
            .run_mutating(argv)
            .context(format!(
                "Failed to set read-only={} on subvolume {:?}.",
                ro, path
            ))
            .map(|_| ())
    }

    pub fn get_readonly(&self, path: &Path) -> Result<bool> {
        let mut argv = btrfs_argv(&["property", "get", "-ts"]);
        argv.push(os(path));
        argv.push(os("ro"));
        let output_data = self
            .runner
            .run(argv)
            .context(format!("Failed to read ro property of {:?}.", path))?;
        match property_value(&output_data, "ro")
            .context(format!("Failed to parse property output for {:?}.", path))?
        {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(anyhow!("Unexpected ro property value {:?}.", other)),
        }
    }

    /// Streams `btrfs send` into `btrfs receive`. `parent` becomes `-p` and
    /// each distinct clone source a `-c` flag, all as source-side paths.
    /// Returns the combined stderr of both processes for log capture.
    pub fn send_receive(
        &self,
        source: &Path,
        target_dir: &Path,
        parent: Option<&Path>,
        clone_sources: &[PathBuf],
    ) -> Result<Vec<u8>, TransportError> {
        let mut send = btrfs_argv(&["send"]);
        let mut seen: HashSet<&Path> = HashSet::new();
        for clone in clone_sources {
            if seen.insert(clone.as_path()) {
                send.push(os("-c"));
                send.push(os(clone));
            }
        }
        if let Some(parent) = parent {
            send.push(os("-p"));
            send.push(os(parent));
        }
        send.push(os(source));

        let mut receive = btrfs_argv(&["receive"]);
        receive.push(os(target_dir));

        self.runner
            .run_piped(send, receive)
            .map_err(|e| TransportError {
                subvol: source.to_path_buf(),
                source: e.into(),
            })
    }
}

/// Parsed `btrfs subvolume show` output.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SubvolumeDetail {
    pub name: String,
    pub uuid: Uuid,
    #[serde(rename = "parent uuid")]
    pub parent_uuid: Option<Uuid>,
    #[serde(rename = "subvolume id")]
    pub id: u64,
    pub generation: u64,
    #[serde(rename = "gen at creation")]
    pub ogen: u64,
    #[serde(rename = "parent id")]
    pub parent_id: u64,
    pub flags: Option<String>,
}

impl SubvolumeDetail {
    pub fn is_readonly(&self) -> bool {
        matches!(&self.flags, Some(f) if f.contains("readonly"))
    }
}
