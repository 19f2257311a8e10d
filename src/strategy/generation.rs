use super::{Selection, Strategy, TransferSink};
use crate::graph::SubvolumeGraph;
use crate::model::Subvolume;
use anyhow::Result;
use std::collections::HashSet;
use std::rc::Rc;
use uuid::Uuid;

/// Transfers in `(gen, id)` order and picks, for each subvolume, the
/// already-sent relative closest to it in creation time, preferring static
/// references: a non-static reference diverges arbitrarily and misguides
/// the delta.
pub struct GenerationStrategy;

/// Ordered clone-source accumulator; duplicates and the subvolume itself
/// never enter twice.
struct SourceSet {
    items: Vec<Rc<Subvolume>>,
    seen: HashSet<Uuid>,
}

impl SourceSet {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn add(&mut self, subvol: &Rc<Subvolume>) {
        if self.seen.insert(subvol.uuid) {
            self.items.push(Rc::clone(subvol));
        }
    }

    fn into_selection(self, best: Option<&Rc<Subvolume>>, reason: &'static str) -> Selection {
        Selection {
            best: best.map(Rc::clone),
            clone_sources: self.items,
            reason,
        }
    }
}

fn youngest<'a, I: Iterator<Item = &'a Rc<Subvolume>>>(iter: I) -> Option<&'a Rc<Subvolume>> {
    iter.max_by_key(|s| s.ogen_key())
}

fn oldest<'a, I: Iterator<Item = &'a Rc<Subvolume>>>(iter: I) -> Option<&'a Rc<Subvolume>> {
    iter.min_by_key(|s| s.ogen_key())
}

/// The selection rules, evaluated in priority order over the `done` list
/// (most recently sent first). Each candidate joins the clone-source set as
/// it is computed, whether or not it wins.
fn select_best_ancestor(
    graph: &SubvolumeGraph,
    done: &[Rc<Subvolume>],
    subvol: &Subvolume,
) -> Selection {
    let mut sources = SourceSet::new();
    let done_uuids: HashSet<Uuid> = done.iter().map(|d| d.uuid).collect();

    // a static child is an exact image of this subvolume at a later point,
    // the best possible reference
    let children: Vec<&Rc<Subvolume>> = done
        .iter()
        .filter(|c| c.parent_uuid == Some(subvol.uuid))
        .collect();
    if let Some(static_child) = children.iter().copied().find(|c| c.is_static()) {
        sources.add(static_child);
        for child in children.iter().copied().filter(|c| c.ogen > static_child.ogen) {
            sources.add(child);
        }
        return sources.into_selection(Some(static_child), "static child");
    }
    for child in children.iter().copied() {
        sources.add(child);
    }

    let ancestors: Vec<&Rc<Subvolume>> = graph
        .parents(subvol)
        .filter(|a| done_uuids.contains(&a.uuid))
        .collect();
    let mom = ancestors.first().copied();
    let ancestor = ancestors.last().copied();
    if let Some(ancestor) = ancestor {
        sources.add(ancestor);
        let mom = mom.expect("non-empty ancestors have a nearest member");
        if mom.uuid == ancestor.uuid {
            // the canonical snapshot chain: the direct origin is on target
            return sources.into_selection(Some(mom), "mom");
        }
        sources.add(mom);
    }

    let siblings: Vec<&Rc<Subvolume>> = match subvol.parent_uuid {
        Some(parent_uuid) => done
            .iter()
            .filter(|x| x.parent_uuid == Some(parent_uuid) && x.uuid != subvol.uuid)
            .collect(),
        None => Vec::new(),
    };
    if siblings.is_empty() {
        return match ancestor {
            Some(ancestor) => sources.into_selection(Some(ancestor), "ancestor"),
            None => sources.into_selection(None, "orphan"),
        };
    }

    let brothers: Vec<&Rc<Subvolume>> = siblings
        .iter()
        .copied()
        .filter(|b| b.ogen < subvol.ogen)
        .collect();
    let sisters: Vec<&Rc<Subvolume>> = siblings
        .iter()
        .copied()
        .filter(|b| b.ogen >= subvol.ogen)
        .collect();

    let youngest_static_brother = youngest(brothers.iter().copied().filter(|b| b.is_static()));
    let youngest_brother = youngest(brothers.iter().copied().filter(|b| b.gen < subvol.ogen));
    let youngest_brother_ogen = youngest(brothers.iter().copied());
    let oldest_static_sister = oldest(sisters.iter().copied().filter(|s| s.is_static()));
    let oldest_sister = oldest(sisters.iter().copied());
    let oldest_sister_gen = sisters.iter().copied().min_by_key(|s| s.gen_key());

    for candidate in [
        youngest_static_brother,
        youngest_brother,
        youngest_brother_ogen,
        oldest_static_sister,
        oldest_sister,
        oldest_sister_gen,
    ]
    .iter()
    .copied()
    .flatten()
    {
        sources.add(candidate);
    }

    if let Some(brother) = youngest_static_brother {
        return sources.into_selection(Some(brother), "static brother");
    }
    if let Some(sister) = oldest_static_sister {
        return sources.into_selection(Some(sister), "static sister");
    }
    if let Some(brother) = youngest_brother {
        return sources.into_selection(Some(brother), "youngest brother");
    }
    if let Some(ancestor) = ancestor {
        if ancestor.is_static() {
            return sources.into_selection(Some(ancestor), "static ancestor");
        }
    }

    let nicest = [
        ancestor,
        youngest_brother_ogen,
        oldest_sister,
        oldest_sister_gen,
    ]
    .iter()
    .flatten()
    .copied()
    .min_by_key(|x| (x.ogen as i64 - subvol.ogen as i64).abs())
    .map(Rc::clone);
    match nicest {
        Some(relative) => sources.into_selection(Some(&relative), "nicest relative"),
        None => sources.into_selection(None, "no nice relatives"),
    }
}

impl Strategy for GenerationStrategy {
    fn name(&self) -> &'static str {
        "generation"
    }

    fn uses_staging(&self) -> bool {
        true
    }

    fn execute(&self, graph: &SubvolumeGraph, sink: &mut dyn TransferSink) -> Result<()> {
        let mut ordered: Vec<Rc<Subvolume>> = graph.iter().cloned().collect();
        ordered.sort_by_key(|s| s.gen_key());

        // most recently sent first; ascending processing keeps it ordered
        // by descending (gen, id) without re-sorting
        let mut done: Vec<Rc<Subvolume>> = Vec::new();
        for subvol in ordered {
            let selection = select_best_ancestor(graph, &done, &subvol);
            if sink.transfer(&subvol, &selection)? {
                done.insert(0, Rc::clone(&subvol));
            }
        }
        Ok(())
    }
}
