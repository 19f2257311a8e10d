use super::{lineage_roots, Selection, Strategy, TransferSink};
use crate::graph::SubvolumeGraph;
use crate::model::Subvolume;
use anyhow::Result;
use log::*;
use std::rc::Rc;

/// Roots first, then depth-first with children newest-first. Each child is
/// sent against the previously sent sibling (or the node itself), so
/// adjacent-in-generation snapshots of one origin reference each other.
pub struct SnapshotStrategy;

impl SnapshotStrategy {
    fn walk(
        &self,
        graph: &SubvolumeGraph,
        sink: &mut dyn TransferSink,
        node: &Rc<Subvolume>,
    ) -> Result<()> {
        let mut children: Vec<Rc<Subvolume>> = graph.children(&node.uuid).cloned().collect();
        children.sort_by(|a, b| b.ogen_key().cmp(&a.ogen_key()));

        let mut prev = Rc::clone(node);
        for child in children {
            let selection = Selection::of(&prev, "previous snapshot");
            if sink.transfer(&child, &selection)? {
                self.walk(graph, sink, &child)?;
                prev = child;
            } else {
                warn!(
                    "Skipping descendants of {:?}: transfer did not complete.",
                    child.path
                );
            }
        }
        Ok(())
    }
}

impl Strategy for SnapshotStrategy {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn uses_staging(&self) -> bool {
        true
    }

    fn execute(&self, graph: &SubvolumeGraph, sink: &mut dyn TransferSink) -> Result<()> {
        for root in lineage_roots(graph) {
            if sink.transfer(&root, &Selection::none("root"))? {
                self.walk(graph, sink, &root)?;
            } else {
                warn!(
                    "Skipping descendants of {:?}: transfer did not complete.",
                    root.path
                );
            }
        }
        Ok(())
    }
}
