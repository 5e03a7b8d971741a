//! Coupling-graph validation and generation ordering.
//!
//! The coupling constraints form a directed graph over source names. A valid
//! configuration is acyclic with in-degree at most one everywhere: each
//! source's waveform is a function of at most one parent waveform plus the
//! coupling method's own randomness. Ordering uses Kahn's algorithm; ties are
//! broken by source registration order so the generation sequence (and with
//! it the sequence of random draws) is reproducible for a fixed seed.

use crate::coupling::Coupling;
use crate::error::{SimResult, SimulationError};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// A directed coupling constraint: `to` is generated from `from`.
#[derive(Debug, Clone)]
pub struct CouplingEdge {
    pub from: String,
    pub to: String,
    pub method: Coupling,
}

/// One entry of the resolved generation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationStep {
    /// No incoming edge: generate from the source's own waveform spec.
    Independent { name: String },
    /// Exactly one incoming edge: generate from the parent's finished
    /// waveform with the edge at `edge_index`.
    Coupled {
        name: String,
        parent: String,
        edge_index: usize,
    },
}

impl GenerationStep {
    pub fn name(&self) -> &str {
        match self {
            GenerationStep::Independent { name } => name,
            GenerationStep::Coupled { name, .. } => name,
        }
    }
}

/// Resolves the generation order for the given sources (in registration
/// order) under the given coupling edges, or fails on a structural violation.
pub fn resolve_generation_order(
    names: &[String],
    edges: &[CouplingEdge],
) -> SimResult<Vec<GenerationStep>> {
    let index_of: HashMap<&str, usize> = names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    // incoming[i] = the edge feeding node i, children[i] = nodes fed by i.
    let mut incoming: Vec<Option<usize>> = vec![None; names.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); names.len()];

    for (edge_index, edge) in edges.iter().enumerate() {
        let from = *index_of
            .get(edge.from.as_str())
            .ok_or_else(|| SimulationError::UnknownSource {
                name: edge.from.clone(),
            })?;
        let to = *index_of
            .get(edge.to.as_str())
            .ok_or_else(|| SimulationError::UnknownSource {
                name: edge.to.clone(),
            })?;
        if from == to {
            return Err(SimulationError::SelfCoupling {
                name: edge.to.clone(),
            });
        }
        if let Some(existing) = incoming[to] {
            return Err(SimulationError::MultipleParents {
                child: edge.to.clone(),
                first: edges[existing].from.clone(),
                second: edge.from.clone(),
            });
        }
        incoming[to] = Some(edge_index);
        children[from].push(to);
    }

    // Kahn's algorithm; the ready queue is keyed by registration index so the
    // order is stable regardless of map iteration order.
    let mut ready: BinaryHeap<Reverse<usize>> = BinaryHeap::new();
    let mut pending: Vec<bool> = vec![false; names.len()];
    for (i, slot) in incoming.iter().enumerate() {
        match slot {
            None => ready.push(Reverse(i)),
            Some(_) => pending[i] = true,
        }
    }

    let mut order = Vec::with_capacity(names.len());
    while let Some(Reverse(node)) = ready.pop() {
        match incoming[node] {
            None => order.push(GenerationStep::Independent {
                name: names[node].clone(),
            }),
            Some(edge_index) => order.push(GenerationStep::Coupled {
                name: names[node].clone(),
                parent: edges[edge_index].from.clone(),
                edge_index,
            }),
        }
        for &child in &children[node] {
            if pending[child] {
                pending[child] = false;
                ready.push(Reverse(child));
            }
        }
    }

    if order.len() != names.len() {
        // The nodes left waiting are the cyclic set plus anything downstream
        // of it; reporting all of them names at least one node per cycle.
        let members: Vec<String> = pending
            .iter()
            .enumerate()
            .filter(|(_, &stuck)| stuck)
            .map(|(i, _)| names[i].clone())
            .collect();
        return Err(SimulationError::CouplingCycle { members });
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(from: &str, to: &str) -> CouplingEdge {
        CouplingEdge {
            from: from.into(),
            to: to.into(),
            method: Coupling::ConstantPhaseShift { phase_lag: 0.0 },
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn order_of(steps: &[GenerationStep]) -> Vec<&str> {
        steps.iter().map(|s| s.name()).collect()
    }

    #[test]
    fn no_edges_preserves_registration_order() {
        let steps = resolve_generation_order(&names(&["b", "a", "c"]), &[]).unwrap();
        assert_eq!(order_of(&steps), vec!["b", "a", "c"]);
        assert!(steps
            .iter()
            .all(|s| matches!(s, GenerationStep::Independent { .. })));
    }

    #[test]
    fn parents_always_precede_children() {
        let steps = resolve_generation_order(
            &names(&["s3", "s2", "s1"]),
            &[edge("s1", "s2"), edge("s2", "s3")],
        )
        .unwrap();
        assert_eq!(order_of(&steps), vec!["s1", "s2", "s3"]);
        assert!(matches!(
            steps[1],
            GenerationStep::Coupled { ref parent, .. } if parent == "s1"
        ));
    }

    #[test]
    fn fan_out_is_allowed_and_deterministic() {
        let steps = resolve_generation_order(
            &names(&["root", "x", "y", "free"]),
            &[edge("root", "y"), edge("root", "x")],
        )
        .unwrap();
        // Ties break by registration order, not edge order.
        assert_eq!(order_of(&steps), vec!["root", "x", "y", "free"]);
    }

    #[test]
    fn fan_in_is_rejected_with_both_parents_named() {
        let err = resolve_generation_order(
            &names(&["a", "b", "c"]),
            &[edge("a", "c"), edge("b", "c")],
        )
        .unwrap_err();
        assert_eq!(
            err,
            SimulationError::MultipleParents {
                child: "c".into(),
                first: "a".into(),
                second: "b".into(),
            }
        );
    }

    #[test]
    fn self_coupling_is_rejected() {
        let err = resolve_generation_order(&names(&["a"]), &[edge("a", "a")]).unwrap_err();
        assert_eq!(err, SimulationError::SelfCoupling { name: "a".into() });
    }

    #[test]
    fn cycles_are_reported_with_their_members() {
        let err = resolve_generation_order(
            &names(&["a", "b", "c", "d"]),
            &[edge("a", "b"), edge("b", "c"), edge("c", "a")],
        )
        .unwrap_err();
        match err {
            SimulationError::CouplingCycle { members } => {
                assert_eq!(members, vec!["a".to_string(), "b".into(), "c".into()]);
            }
            other => panic!("expected a cycle error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_endpoints_are_rejected() {
        let err = resolve_generation_order(&names(&["a"]), &[edge("a", "ghost")]).unwrap_err();
        assert_eq!(
            err,
            SimulationError::UnknownSource {
                name: "ghost".into()
            }
        );
    }
}
