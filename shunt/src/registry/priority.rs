//! Priority resolution: combine partial ordering hints into one total order.
//!
//! Edges come from three sources with ascending precedence: type-derived
//! comparisons, in-declaration hints, and the `<PREFIX>_SET_ORDER`
//! environment variable. Conflicting edges show up as cycles; cycle breaking
//! repeatedly drops the lowest-precedence edge involved and retries, so the
//! higher-precedence source wins. Remaining ties break `default`-last, then
//! alphabetically.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use super::{Backend, DEFAULT_BACKEND};
use crate::ident::TypeSpec;

/// Where a priority edge came from, in ascending precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum EdgeSource {
    TypeDerived,
    Hint,
    Env,
}

/// Directed edge `hi → lo`: `hi` has higher priority than `lo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Edge {
    pub hi: Arc<str>,
    pub lo: Arc<str>,
    pub source: EdgeSource,
}

/// Builds the edge set for a backend list.
///
/// `set_order` holds `(higher, lower)` pairs from the environment; pairs or
/// hints naming unknown backends contribute nothing.
pub(crate) fn collect_edges(
    backends: &[Arc<Backend>],
    set_order: &[(String, String)],
) -> Vec<Edge> {
    let known: HashMap<&str, &Arc<Backend>> =
        backends.iter().map(|b| (b.name(), b)).collect();

    // Highest-precedence source wins for a repeated (hi, lo) pair.
    let mut edges: BTreeMap<(Arc<str>, Arc<str>), EdgeSource> = BTreeMap::new();
    let mut add = |hi: &Arc<str>, lo: &Arc<str>, source: EdgeSource| {
        if hi == lo {
            return;
        }
        let key = (Arc::clone(hi), Arc::clone(lo));
        let entry = edges.entry(key).or_insert(source);
        if source > *entry {
            *entry = source;
        }
    };

    // Environment pairs; a later opposite pair overrides an earlier one.
    let mut env_pairs: Vec<(Arc<str>, Arc<str>)> = Vec::new();
    for (a, b) in set_order {
        let (Some(hi), Some(lo)) = (known.get(a.as_str()), known.get(b.as_str())) else {
            debug!(hi = %a, lo = %b, "SET_ORDER names unknown backend, ignoring pair");
            continue;
        };
        let hi = Arc::clone(hi.name_arc());
        let lo = Arc::clone(lo.name_arc());
        env_pairs.retain(|(h, l)| !(h == &lo && l == &hi));
        env_pairs.push((hi, lo));
    }
    for (hi, lo) in &env_pairs {
        add(hi, lo, EdgeSource::Env);
    }

    for backend in backends {
        for other in backend.higher_priority_than() {
            if let Some(lo) = known.get(other.as_str()) {
                add(backend.name_arc(), lo.name_arc(), EdgeSource::Hint);
            }
        }
        for other in backend.lower_priority_than() {
            if let Some(hi) = known.get(other.as_str()) {
                add(hi.name_arc(), backend.name_arc(), EdgeSource::Hint);
            }
        }
    }

    // Type-derived: a backend whose primary set is strictly narrower than
    // another's matches more specifically and goes first.
    for (i, a) in backends.iter().enumerate() {
        for b in &backends[i + 1..] {
            if a.is_default() || b.is_default() {
                continue;
            }
            if strictly_narrower(b.primary_specs(), a.primary_specs()) {
                add(b.name_arc(), a.name_arc(), EdgeSource::TypeDerived);
            } else if strictly_narrower(a.primary_specs(), b.primary_specs()) {
                add(a.name_arc(), b.name_arc(), EdgeSource::TypeDerived);
            }
        }
    }

    edges
        .into_iter()
        .map(|((hi, lo), source)| Edge { hi, lo, source })
        .collect()
}

/// Whether `inner` accepts a strict subset of what `outer` accepts.
///
/// Abstract specs are incomparable, so a set containing one is never
/// narrower (and never wider) than anything.
fn strictly_narrower(inner: &[TypeSpec], outer: &[TypeSpec]) -> bool {
    if inner.is_empty() || outer.is_empty() {
        return false;
    }
    covers_all(outer, inner) && !covers_all(inner, outer)
}

fn covers_all(outer: &[TypeSpec], inner: &[TypeSpec]) -> bool {
    inner.iter().all(|i| outer.iter().any(|o| o.covers(i)))
}

/// Produces the base priority order, breaking cycles as needed.
///
/// Never fails: a cyclic edge set degrades to a diagnostic and a total order
/// consistent with the acyclic remainder.
pub(crate) fn resolve_order(names: &[Arc<str>], mut edges: Vec<Edge>) -> Vec<Arc<str>> {
    loop {
        match toposort(names, &edges) {
            Ok(order) => return order,
            Err(cycle) => {
                let dropped = cycle
                    .iter()
                    .min_by_key(|e| (e.source, Arc::clone(&e.hi), Arc::clone(&e.lo)))
                    .cloned()
                    .expect("cycle has at least one edge");
                warn!(
                    hi = %dropped.hi,
                    lo = %dropped.lo,
                    source = ?dropped.source,
                    cycle = %describe_cycle(&cycle),
                    "backends form a priority cycle; dropping the lowest-precedence edge"
                );
                edges.retain(|e| e != &dropped);
            }
        }
    }
}

fn describe_cycle(edges: &[Edge]) -> String {
    edges
        .iter()
        .map(|e| format!("{}>{}", e.hi, e.lo))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Kahn's algorithm with a deterministic ready-set order: anything before
/// `default`, then alphabetical. On a cycle, returns the edges of one cycle
/// among the unplaced nodes.
fn toposort(names: &[Arc<str>], edges: &[Edge]) -> Result<Vec<Arc<str>>, Vec<Edge>> {
    let mut indegree: BTreeMap<&str, usize> = names.iter().map(|n| (&**n, 0)).collect();
    let mut successors: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for edge in edges {
        successors.entry(&edge.hi).or_default().push(&edge.lo);
        if let Some(d) = indegree.get_mut(&*edge.lo) {
            *d += 1;
        }
    }

    let by_name: HashMap<&str, &Arc<str>> = names.iter().map(|n| (&**n, n)).collect();
    let mut ready: BTreeSet<(bool, &str)> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| (*n == DEFAULT_BACKEND, *n))
        .collect();

    let mut order: Vec<Arc<str>> = Vec::with_capacity(names.len());
    while let Some(&(is_default, name)) = ready.iter().next() {
        ready.remove(&(is_default, name));
        order.push(Arc::clone(by_name[name]));
        for lo in successors.get(name).into_iter().flatten() {
            let d = indegree.get_mut(*lo).expect("edge endpoints are known nodes");
            *d -= 1;
            if *d == 0 {
                ready.insert((*lo == DEFAULT_BACKEND, *lo));
            }
        }
        indegree.remove(name);
    }

    if order.len() == names.len() {
        Ok(order)
    } else {
        Err(find_cycle(&indegree, edges))
    }
}

/// Walks predecessor edges among the unplaced nodes until the walk closes a
/// loop, and returns the edges along it.
///
/// Every unplaced node kept a nonzero indegree, so it has at least one
/// unplaced predecessor and the backward walk cannot get stuck.
fn find_cycle(remaining: &BTreeMap<&str, usize>, edges: &[Edge]) -> Vec<Edge> {
    let start = *remaining.keys().next().expect("cycle implies unplaced nodes");

    let mut path: Vec<&str> = vec![start];
    let mut seen: BTreeSet<&str> = [start].into();
    loop {
        let current = *path.last().expect("path never empty");
        let pred = edges
            .iter()
            .find(|e| &*e.lo == current && remaining.contains_key(&*e.hi))
            .map(|e| &*e.hi)
            .expect("unplaced nodes keep an unplaced predecessor");
        if seen.contains(pred) {
            let from = path.iter().position(|n| *n == pred).expect("seen implies on path");
            // path[i + 1] precedes path[i]; pair each node with its
            // successor on the forward cycle.
            let nodes = &path[from..];
            let mut cycle_edges = Vec::new();
            for (i, lo) in nodes.iter().enumerate() {
                let hi = nodes[(i + 1) % nodes.len()];
                if let Some(edge) = edges.iter().find(|e| &*e.hi == hi && &*e.lo == *lo) {
                    cycle_edges.push(edge.clone());
                }
            }
            return cycle_edges;
        }
        seen.insert(pred);
        path.push(pred);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<Arc<str>> {
        list.iter().map(|s| Arc::from(*s)).collect()
    }

    fn edge(hi: &str, lo: &str, source: EdgeSource) -> Edge {
        Edge { hi: Arc::from(hi), lo: Arc::from(lo), source }
    }

    fn order_of(names_in: &[&str], edges: Vec<Edge>) -> Vec<String> {
        resolve_order(&names(names_in), edges)
            .into_iter()
            .map(|n| n.to_string())
            .collect()
    }

    #[test]
    fn ties_break_default_last_then_alphabetic() {
        let order = order_of(&["b2", "default", "a1"], vec![]);
        assert_eq!(order, ["a1", "b2", "default"]);
    }

    #[test]
    fn edges_override_alphabetic_ties() {
        let order = order_of(&["a", "b"], vec![edge("b", "a", EdgeSource::Hint)]);
        assert_eq!(order, ["b", "a"]);
    }

    #[test]
    fn explicit_edge_can_demote_past_default() {
        let order = order_of(
            &["a", "b", "default"],
            vec![edge("default", "b", EdgeSource::Env)],
        );
        assert_eq!(order, ["a", "default", "b"]);
    }

    #[test]
    fn two_cycle_drops_lower_precedence_edge() {
        let order = order_of(
            &["a", "b"],
            vec![
                edge("a", "b", EdgeSource::TypeDerived),
                edge("b", "a", EdgeSource::Env),
            ],
        );
        assert_eq!(order, ["b", "a"], "the environment edge survives");
    }

    #[test]
    fn three_cycle_resolves_to_some_consistent_order() {
        let order = order_of(
            &["a", "b", "c"],
            vec![
                edge("a", "b", EdgeSource::Hint),
                edge("b", "c", EdgeSource::Hint),
                edge("c", "a", EdgeSource::TypeDerived),
            ],
        );
        // The type-derived edge is dropped; the hint chain survives intact.
        assert_eq!(order, ["a", "b", "c"]);
    }

    #[test]
    fn fully_cyclic_hints_still_produce_a_total_order() {
        let order = order_of(
            &["a", "b"],
            vec![
                edge("a", "b", EdgeSource::Hint),
                edge("b", "a", EdgeSource::Hint),
            ],
        );
        assert_eq!(order.len(), 2);
    }
}
