use super::{lineage_roots, Selection, Strategy, TransferSink};
use crate::graph::SubvolumeGraph;
use crate::model::Subvolume;
use anyhow::Result;
use std::rc::Rc;

/// Depth-first like SNAPSHOT, but children walk oldest-first and every node
/// is sent after its subtree. A lineage root therefore lands on the target
/// as a read-write snapshot of its own child, inverting the original
/// parent-of relation.
pub struct ChronologicalStrategy;

impl ChronologicalStrategy {
    /// Sends `node`'s subtree, then `node` itself. Returns the node when its
    /// transfer completed so the caller can chain the next sibling on it.
    fn visit(
        &self,
        graph: &SubvolumeGraph,
        sink: &mut dyn TransferSink,
        node: &Rc<Subvolume>,
        parent: Option<&Rc<Subvolume>>,
    ) -> Result<Option<Rc<Subvolume>>> {
        let mut children: Vec<Rc<Subvolume>> = graph.children(&node.uuid).cloned().collect();
        children.sort_by_key(|c| c.ogen_key());

        let mut prev: Option<Rc<Subvolume>> = None;
        for child in children {
            let inherited = prev.as_ref().or(parent).cloned();
            if let Some(sent) = self.visit(graph, sink, &child, inherited.as_ref())? {
                prev = Some(sent);
            }
        }

        let selection = match (parent, prev.as_ref()) {
            (Some(parent), prev) => {
                let mut clone_sources = vec![Rc::clone(parent)];
                if let Some(prev) = prev {
                    clone_sources.push(Rc::clone(prev));
                }
                Selection {
                    best: Some(Rc::clone(parent)),
                    clone_sources,
                    reason: "previous sibling",
                }
            }
            (None, Some(prev)) => Selection::of(prev, "last child"),
            (None, None) => Selection::none("root"),
        };

        Ok(if sink.transfer(node, &selection)? {
            Some(Rc::clone(node))
        } else {
            None
        })
    }
}

impl Strategy for ChronologicalStrategy {
    fn name(&self) -> &'static str {
        "chronological"
    }

    fn uses_staging(&self) -> bool {
        true
    }

    fn execute(&self, graph: &SubvolumeGraph, sink: &mut dyn TransferSink) -> Result<()> {
        for root in lineage_roots(graph) {
            self.visit(graph, sink, &root, None)?;
        }
        Ok(())
    }
}
