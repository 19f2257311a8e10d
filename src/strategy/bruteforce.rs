use super::{Selection, Strategy, TransferSink};
use crate::graph::SubvolumeGraph;
use anyhow::Result;
use std::rc::Rc;

/// PARENT's order and placement, but the clone-source set widens to every
/// lineage-connected subvolume older than the one being sent. Maximum
/// extent reuse at the cost of larger send-side working sets.
pub struct BruteforceStrategy;

impl Strategy for BruteforceStrategy {
    fn name(&self) -> &'static str {
        "bruteforce"
    }

    fn uses_staging(&self) -> bool {
        false
    }

    fn execute(&self, graph: &SubvolumeGraph, sink: &mut dyn TransferSink) -> Result<()> {
        let mut ordered: Vec<_> = graph.iter().cloned().collect();
        ordered.sort_by_key(|s| s.ogen_key());
        for subvol in ordered {
            let clone_sources: Vec<Rc<_>> = graph
                .relatives(&subvol)
                .into_iter()
                .filter(|r| r.ogen < subvol.ogen)
                .collect();
            let best = subvol
                .parent_uuid
                .as_ref()
                .and_then(|uuid| graph.get(uuid))
                .cloned();
            let selection = Selection {
                reason: if best.is_some() { "relatives" } else { "root" },
                best,
                clone_sources,
            };
            sink.transfer(&subvol, &selection)?;
        }
        Ok(())
    }
}
