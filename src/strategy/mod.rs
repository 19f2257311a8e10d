pub mod bruteforce;
pub mod chronological;
pub mod generation;
pub mod parent;
pub mod snapshot;

use crate::graph::SubvolumeGraph;
use crate::model::Subvolume;
use anyhow::Result;
use std::rc::Rc;
use strum_macros::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum StrategyKind {
    Parent,
    Snapshot,
    Chronological,
    Generation,
    Bruteforce,
}

impl StrategyKind {
    pub fn build(self) -> Box<dyn Strategy> {
        match self {
            StrategyKind::Parent => Box::new(parent::ParentStrategy),
            StrategyKind::Snapshot => Box::new(snapshot::SnapshotStrategy),
            StrategyKind::Chronological => Box::new(chronological::ChronologicalStrategy),
            StrategyKind::Generation => Box::new(generation::GenerationStrategy),
            StrategyKind::Bruteforce => Box::new(bruteforce::BruteforceStrategy),
        }
    }
}

/// The parent and clone sources chosen for one transfer, with the rule that
/// picked them (logged, and invaluable when comparing target disk usage
/// between strategies).
pub struct Selection {
    pub best: Option<Rc<Subvolume>>,
    pub clone_sources: Vec<Rc<Subvolume>>,
    pub reason: &'static str,
}

impl Selection {
    pub fn none(reason: &'static str) -> Self {
        Self {
            best: None,
            clone_sources: Vec::new(),
            reason,
        }
    }

    pub fn of(best: &Rc<Subvolume>, reason: &'static str) -> Self {
        Self {
            best: Some(Rc::clone(best)),
            clone_sources: vec![Rc::clone(best)],
            reason,
        }
    }
}

/// Where strategies deliver their transfers: the orchestrator's clone run in
/// production, a recorder in tests.
pub trait TransferSink {
    /// Performs one transfer. `Ok(true)` means the subvolume is on the
    /// target (freshly received or already present from an earlier run);
    /// `Ok(false)` means the transfer failed but the failure policy
    /// downgraded it. Fatal errors propagate.
    fn transfer(&mut self, subvol: &Rc<Subvolume>, selection: &Selection) -> Result<bool>;
}

/// A cloning strategy: an order over the enumerated subvolumes and a
/// parent/clone-source choice for each, delivered to the sink exactly once
/// per subvolume.
pub trait Strategy {
    fn name(&self) -> &'static str;

    /// Whether transfers go through the flat staging area (and need the
    /// commit pass) or straight to their final tree position.
    fn uses_staging(&self) -> bool;

    fn execute(&self, graph: &SubvolumeGraph, sink: &mut dyn TransferSink) -> Result<()>;
}

/// Subvolumes with no origin, or whose origin is gone. Lineage across a
/// deleted origin is never guessed.
pub(crate) fn lineage_roots(graph: &SubvolumeGraph) -> Vec<Rc<Subvolume>> {
    let mut roots: Vec<Rc<Subvolume>> = graph
        .iter()
        .filter(|s| match s.parent_uuid {
            Some(uuid) => graph.get(&uuid).is_none(),
            None => true,
        })
        .cloned()
        .collect();
    roots.sort_by_key(|s| s.ogen_key());
    roots
}

#[cfg(test)]
pub(crate) mod support {
    use super::*;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use uuid::Uuid;

    pub fn uuid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    pub fn subvol(id: u64, own: u8, parent: Option<u8>, ogen: u64, gen: u64) -> Subvolume {
        Subvolume {
            path: PathBuf::from(format!("sv{}", id)),
            id,
            parent_id: crate::model::TOPLEVEL_ID,
            uuid: uuid(own),
            parent_uuid: parent.map(uuid),
            gen,
            ogen,
            ro: gen == ogen,
        }
    }

    #[derive(Debug, PartialEq)]
    pub struct Record {
        pub id: u64,
        pub best: Option<u64>,
        pub sources: Vec<u64>,
        pub reason: &'static str,
    }

    /// Sink that records each transfer; ids in `fail` report a downgraded
    /// failure instead.
    #[derive(Default)]
    pub struct Recorder {
        pub records: Vec<Record>,
        pub fail: HashSet<u64>,
    }

    impl TransferSink for Recorder {
        fn transfer(&mut self, subvol: &Rc<Subvolume>, selection: &Selection) -> Result<bool> {
            let mut sources: Vec<u64> = selection.clone_sources.iter().map(|s| s.id).collect();
            sources.sort_unstable();
            sources.dedup();
            self.records.push(Record {
                id: subvol.id,
                best: selection.best.as_ref().map(|b| b.id),
                sources,
                reason: selection.reason,
            });
            Ok(!self.fail.contains(&subvol.id))
        }
    }

    pub fn order(recorder: &Recorder) -> Vec<u64> {
        recorder.records.iter().map(|r| r.id).collect()
    }
}
