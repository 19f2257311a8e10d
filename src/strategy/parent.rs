use super::{Selection, Strategy, TransferSink};
use crate::graph::SubvolumeGraph;
use anyhow::Result;
use std::rc::Rc;

/// Transfers in `(ogen, id)` order, using the direct origin as parent and
/// the whole ancestor chain as clone sources. The only strategy that keeps
/// the origin lineage intact on the target. Receives straight into the
/// final tree position, so no staging commit runs.
pub struct ParentStrategy;

impl Strategy for ParentStrategy {
    fn name(&self) -> &'static str {
        "parent"
    }

    fn uses_staging(&self) -> bool {
        false
    }

    fn execute(&self, graph: &SubvolumeGraph, sink: &mut dyn TransferSink) -> Result<()> {
        let mut ordered: Vec<_> = graph.iter().cloned().collect();
        ordered.sort_by_key(|s| s.ogen_key());
        for subvol in ordered {
            let ancestors: Vec<Rc<_>> = graph.parents(&subvol).cloned().collect();
            let selection = Selection {
                best: ancestors.first().cloned(),
                reason: if ancestors.is_empty() {
                    "root"
                } else {
                    "origin lineage"
                },
                clone_sources: ancestors,
            };
            sink.transfer(&subvol, &selection)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::support::*;
    use super::*;

    // readme fan-out: current with four read-only snapshots, oldest first
    fn fan() -> SubvolumeGraph {
        crate::graph::SubvolumeGraph::new(vec![
            subvol(256, 1, None, 10, 100),
            subvol(261, 2, Some(1), 20, 20),
            subvol(262, 3, Some(1), 30, 30),
            subvol(263, 4, Some(1), 40, 40),
            subvol(264, 5, Some(1), 50, 50),
        ])
        .unwrap()
    }

    #[test]
    fn fan_sends_origin_first_then_each_snapshot_against_it() {
        let mut recorder = Recorder::default();
        ParentStrategy.execute(&fan(), &mut recorder).unwrap();

        assert_eq!(order(&recorder), vec![256, 261, 262, 263, 264]);
        assert_eq!(recorder.records[0].best, None);
        for record in &recorder.records[1..] {
            assert_eq!(record.best, Some(256));
            assert_eq!(record.sources, vec![256]);
        }
    }

    #[test]
    fn chain_passes_every_ancestor_as_clone_source() {
        let graph = crate::graph::SubvolumeGraph::new(vec![
            subvol(256, 1, None, 10, 100),
            subvol(257, 2, Some(1), 20, 90),
            subvol(258, 3, Some(2), 30, 30),
        ])
        .unwrap();
        let mut recorder = Recorder::default();
        ParentStrategy.execute(&graph, &mut recorder).unwrap();

        let last = recorder.records.last().unwrap();
        assert_eq!(last.id, 258);
        assert_eq!(last.best, Some(257));
        assert_eq!(last.sources, vec![256, 257]);
    }

    #[test]
    fn dangling_origin_is_sent_as_root() {
        let graph =
            crate::graph::SubvolumeGraph::new(vec![subvol(256, 2, Some(9), 20, 20)]).unwrap();
        let mut recorder = Recorder::default();
        ParentStrategy.execute(&graph, &mut recorder).unwrap();
        assert_eq!(recorder.records[0].best, None);
        assert_eq!(recorder.records[0].reason, "root");
    }
}
