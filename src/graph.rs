use crate::model::Subvolume;
use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use uuid::Uuid;

/// The enumerated subvolume set indexed by UUID. Queries are lazy linear
/// scans; the sets are small enough that no precomputed child index is
/// worth carrying.
pub struct SubvolumeGraph {
    subvols: Vec<Rc<Subvolume>>,
    by_uuid: HashMap<Uuid, Rc<Subvolume>>,
}

impl SubvolumeGraph {
    pub fn new(subvols: Vec<Subvolume>) -> Result<Self> {
        let subvols: Vec<Rc<Subvolume>> = subvols.into_iter().map(Rc::new).collect();
        let mut by_uuid = HashMap::with_capacity(subvols.len());
        let mut ids = HashSet::with_capacity(subvols.len());
        for subvol in &subvols {
            if by_uuid.insert(subvol.uuid, Rc::clone(subvol)).is_some() {
                bail!("Duplicate subvolume uuid {} in enumeration.", subvol.uuid);
            }
            if !ids.insert(subvol.id) {
                bail!("Duplicate subvolume id {} in enumeration.", subvol.id);
            }
        }
        Ok(Self { subvols, by_uuid })
    }

    pub fn len(&self) -> usize {
        self.subvols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subvols.is_empty()
    }

    /// Subvolumes in enumeration order (`ogen` ascending).
    pub fn iter(&self) -> impl Iterator<Item = &Rc<Subvolume>> {
        self.subvols.iter()
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&Rc<Subvolume>> {
        self.by_uuid.get(uuid)
    }

    /// Walks the snapshot lineage upward, stopping when `parent_uuid` is
    /// absent or points at a subvolume no longer present.
    pub fn parents<'a>(&'a self, subvol: &Subvolume) -> impl Iterator<Item = &'a Rc<Subvolume>> {
        std::iter::successors(
            subvol.parent_uuid.as_ref().and_then(|u| self.get(u)),
            move |cur| cur.parent_uuid.as_ref().and_then(|u| self.get(u)),
        )
    }

    /// Direct snapshots of `uuid`. The uuid itself does not have to be
    /// present, so the children of a deleted origin still enumerate.
    pub fn children<'a>(&'a self, uuid: &Uuid) -> impl Iterator<Item = &'a Rc<Subvolume>> {
        let uuid = *uuid;
        self.subvols
            .iter()
            .filter(move |s| s.parent_uuid == Some(uuid))
    }

    /// Transitive closure of [`children`], depth first.
    pub fn descendants(&self, uuid: &Uuid) -> Vec<Rc<Subvolume>> {
        let mut out = Vec::new();
        let mut stack: Vec<Uuid> = vec![*uuid];
        while let Some(cur) = stack.pop() {
            for child in self.children(&cur) {
                out.push(Rc::clone(child));
                stack.push(child.uuid);
            }
        }
        out
    }

    /// Subvolumes sharing `parent_uuid` with `subvol`, excluding it. A
    /// subvolume without an origin has no siblings.
    pub fn siblings<'a>(
        &'a self,
        subvol: &Subvolume,
    ) -> Box<dyn Iterator<Item = &'a Rc<Subvolume>> + 'a> {
        match subvol.parent_uuid {
            Some(parent_uuid) => {
                let own = subvol.uuid;
                Box::new(
                    self.subvols
                        .iter()
                        .filter(move |s| s.parent_uuid == Some(parent_uuid) && s.uuid != own),
                )
            }
            None => Box::new(std::iter::empty()),
        }
    }

    /// Every lineage-connected subvolume of `subvol`: its oldest present
    /// ancestor plus all descendants of that ancestor's origin key (the
    /// ancestor itself when it has no origin). `subvol` is excluded.
    pub fn relatives(&self, subvol: &Subvolume) -> Vec<Rc<Subvolume>> {
        let oldest = self.parents(subvol).last();
        let (root_key, seed) = match oldest {
            Some(ancestor) => (ancestor.parent_uuid.unwrap_or(ancestor.uuid), Some(ancestor)),
            None => (subvol.parent_uuid.unwrap_or(subvol.uuid), None),
        };

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        if let Some(ancestor) = seed {
            if seen.insert(ancestor.uuid) {
                out.push(Rc::clone(ancestor));
            }
        }
        for relative in self.descendants(&root_key) {
            if relative.uuid != subvol.uuid && seen.insert(relative.uuid) {
                out.push(relative);
            }
        }
        out
    }
}
