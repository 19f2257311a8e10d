use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Identifier of the unnameable top-of-filesystem pseudo-subvolume.
pub const TOPLEVEL_ID: u64 = 5;

/// Metadata of one source subvolume, captured at enumeration time and never
/// mutated afterward. The `ro` field records the state at enumeration; the
/// read-only guard tracks its own toggles separately.
#[derive(Debug, Clone, PartialEq)]
pub struct Subvolume {
    pub path: PathBuf,
    pub id: u64,
    pub parent_id: u64,
    pub uuid: Uuid,
    pub parent_uuid: Option<Uuid>,
    pub gen: u64,
    pub ogen: u64,
    pub ro: bool,
}

impl Subvolume {
    /// Effectively untouched since creation, typically a read-only snapshot.
    /// Such subvolumes make exact send references.
    pub fn is_static(&self) -> bool {
        self.gen.saturating_sub(self.ogen) <= 1
    }

    /// Absolute path of this subvolume under the given top-level mount.
    pub fn fs_path(&self, mount: &Path) -> PathBuf {
        mount.join(&self.path)
    }

    /// Final name component of the tree path.
    pub fn basename(&self) -> &std::ffi::OsStr {
        self.path
            .file_name()
            .unwrap_or_else(|| self.path.as_os_str())
    }

    pub fn ogen_key(&self) -> (u64, u64) {
        (self.ogen, self.id)
    }

    pub fn gen_key(&self) -> (u64, u64) {
        (self.gen, self.id)
    }
}
