//! C8: balances, reorders, and batches a request's unordered event list
//! (spec §4.8) before it's handed to the transport.

use apptrace_core::{FunctionKind, Phase, SpanId, TraceEvent};
use std::collections::{HashMap, HashSet};

/// Spec §4.8 "Balancing": every `enter` with no matching `exit` gets a
/// synthetic exit appended, `unawaited=true`, depth one less than the
/// enter's.
pub fn balance(events: Vec<TraceEvent>) -> Vec<TraceEvent> {
    let closed: HashSet<SpanId> = events
        .iter()
        .filter(|e| e.is_exit())
        .map(|e| e.span_id)
        .collect();

    let mut out = events;
    let synthetic: Vec<TraceEvent> = out
        .iter()
        .filter(|e| e.is_enter() && !closed.contains(&e.span_id))
        .map(|enter| TraceEvent {
            phase: Phase::Exit,
            t: enter.t,
            name: enter.name.clone(),
            file: enter.file.clone(),
            line: enter.line,
            kind: enter.kind,
            scope_id: enter.scope_id.clone(),
            depth: enter.depth.saturating_sub(1),
            span_id: enter.span_id,
            parent_span_id: enter.parent_span_id,
            args: None,
            result: None,
            error: None,
            threw: false,
            unawaited: true,
        })
        .collect();
    out.extend(synthetic);
    out
}

struct Node {
    enter: TraceEvent,
    exit: Option<TraceEvent>,
    children: Vec<SpanId>,
    first_seen_order: usize,
}

/// Spec §4.8 "Reordering": rebuilds the span tree from parent-id edges and
/// re-serializes it depth-first (enter, recurse into children sorted by
/// first-emission order, exit), rewriting depths to tree depth. Events with
/// no span id pass through untouched, at their original relative position
/// among the other span-less events.
pub fn reorder(events: Vec<TraceEvent>) -> Vec<TraceEvent> {
    let mut nodes: HashMap<SpanId, Node> = HashMap::new();
    let mut roots: Vec<SpanId> = Vec::new();
    let mut spanless: Vec<TraceEvent> = Vec::new();
    let mut order = 0usize;

    for event in events {
        match event.phase {
            Phase::Enter => {
                let id = event.span_id;
                let parent = event.parent_span_id;
                nodes.insert(
                    id,
                    Node {
                        enter: event,
                        exit: None,
                        children: Vec::new(),
                        first_seen_order: order,
                    },
                );
                order += 1;
                match parent {
                    Some(p) if nodes.contains_key(&p) => {
                        nodes.get_mut(&p).unwrap().children.push(id);
                    }
                    _ => roots.push(id),
                }
            }
            Phase::Exit => {
                if let Some(node) = nodes.get_mut(&event.span_id) {
                    node.exit = Some(event);
                } else {
                    spanless.push(event);
                }
            }
        }
    }

    // A parent enter can arrive after a child's enter in raw emission order
    // (scenario 6 in spec §8); re-link any child whose parent was inserted
    // later than it was.
    let all_ids: Vec<SpanId> = nodes.keys().copied().collect();
    for id in all_ids {
        let parent = nodes.get(&id).and_then(|n| n.enter.parent_span_id);
        if let Some(p) = parent {
            if p != id && nodes.contains_key(&p) {
                let already_root = roots.contains(&id);
                let already_child = nodes[&p].children.contains(&id);
                if already_root && !already_child {
                    roots.retain(|r| *r != id);
                    nodes.get_mut(&p).unwrap().children.push(id);
                }
            }
        }
    }

    roots.sort_by_key(|id| nodes[id].first_seen_order);
    // Sort children by first-emission order (span id allocation order is a
    // stable proxy for it, since ids are assigned monotonically on enter).
    let order_of: HashMap<SpanId, usize> = nodes
        .iter()
        .map(|(id, n)| (*id, n.first_seen_order))
        .collect();
    for node in nodes.values_mut() {
        node.children.sort_by_key(|id| order_of.get(id).copied().unwrap_or(usize::MAX));
    }

    let mut out = Vec::new();
    for root in &roots {
        walk(*root, 1, &nodes, &mut out);
    }
    out.extend(spanless);
    out
}

fn walk(id: SpanId, depth: usize, nodes: &HashMap<SpanId, Node>, out: &mut Vec<TraceEvent>) {
    let node = match nodes.get(&id) {
        Some(n) => n,
        None => return,
    };
    let mut enter = node.enter.clone();
    enter.depth = depth;
    out.push(enter);
    for child in &node.children {
        walk(*child, depth + 1, nodes, out);
    }
    if let Some(exit) = &node.exit {
        let mut exit = exit.clone();
        exit.depth = depth;
        out.push(exit);
    }
}

/// Spec §4.8 "Batching": fixed-size chunks, each tagged with
/// `{scope_id, chunk_index, total_chunks}` so the receiver can reconstruct
/// order.
#[derive(Debug, Clone)]
pub struct Batch {
    pub scope_id: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub events: Vec<TraceEvent>,
}

pub fn batch(scope_id: &str, events: Vec<TraceEvent>, chunk_size: usize) -> Vec<Batch> {
    if events.is_empty() {
        return Vec::new();
    }
    let chunk_size = chunk_size.max(1);
    let chunks: Vec<Vec<TraceEvent>> = events
        .chunks(chunk_size)
        .map(|c| c.to_vec())
        .collect();
    let total = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, events)| Batch {
            scope_id: scope_id.to_string(),
            chunk_index: i,
            total_chunks: total,
            events,
        })
        .collect()
}

/// Runs the full assembler pipeline: balance, reorder, batch.
pub fn assemble(scope_id: &str, events: Vec<TraceEvent>, chunk_size: usize) -> Vec<Batch> {
    let balanced = balance(events);
    let reordered = reorder(balanced);
    batch(scope_id, reordered, chunk_size)
}

fn dummy_event(span_id: u64, parent: Option<u64>, phase: Phase, depth: usize) -> TraceEvent {
    TraceEvent {
        phase,
        t: 0,
        name: "f".to_string(),
        file: None,
        line: None,
        kind: FunctionKind::Function,
        scope_id: "s1".to_string(),
        depth,
        span_id: SpanId::from_u64(span_id),
        parent_span_id: parent.map(SpanId::from_u64),
        args: None,
        result: None,
        error: None,
        threw: false,
        unawaited: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balances_missing_exit_with_synthetic_unawaited_exit() {
        let events = vec![dummy_event(1, None, Phase::Enter, 1)];
        let balanced = balance(events);
        assert_eq!(balanced.len(), 2);
        assert!(balanced[1].is_exit());
        assert!(balanced[1].unawaited);
        assert_eq!(balanced[1].depth, 0);
    }

    #[test]
    fn reorders_out_of_order_emission_scenario() {
        // enter A, enter B (child of A), exit B, exit A — arriving with A's
        // exit recorded last despite A entering first: spec §8 scenario 6.
        let events = vec![
            dummy_event(1, None, Phase::Enter, 1),
            dummy_event(2, Some(1), Phase::Enter, 2),
            dummy_event(2, Some(1), Phase::Exit, 2),
            dummy_event(1, None, Phase::Exit, 1),
        ];
        let out = reorder(events);
        let phases_depths: Vec<(bool, usize)> = out.iter().map(|e| (e.is_enter(), e.depth)).collect();
        assert_eq!(
            phases_depths,
            vec![(true, 1), (true, 2), (false, 2), (false, 1)]
        );
    }

    #[test]
    fn batches_into_fixed_size_chunks_with_index_and_total() {
        let events: Vec<TraceEvent> = (0..5)
            .map(|i| dummy_event(i, None, Phase::Enter, 1))
            .collect();
        let batches = batch("scope-1", events, 2);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].events.len(), 2);
        assert_eq!(batches[2].events.len(), 1);
        assert!(batches.iter().all(|b| b.total_chunks == 3));
        assert_eq!(batches[1].chunk_index, 1);
    }

    #[test]
    fn spanless_events_pass_through_untouched() {
        let mut orphan_exit = dummy_event(99, None, Phase::Exit, 1);
        orphan_exit.span_id = SpanId::from_u64(99);
        let out = reorder(vec![orphan_exit]);
        assert_eq!(out.len(), 1);
        assert!(out[0].is_exit());
    }
}
