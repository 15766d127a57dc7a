use crate::analysis::flow::{FlowGraph, SlotId};

/// Orders the slots needed by `outputs` so every dependency appears before its consumer.
///
/// Slots no output depends on are never visited, so dead computation drops out here.
///
/// Depth-first post-order keeps a chain of dependent slots in adjacent registers, which
/// is what `KernelReport::locality` measures.
pub fn sort(graph: &FlowGraph, outputs: &[SlotId]) -> Result<Vec<SlotId>, String> {
    let count = graph.count();
    let mut order = Vec::with_capacity(count);
    let mut state = vec![VisitState::Unseen; count];

    for &out in outputs {
        if out.index() >= count {
            return Err(format!("output slot {} does not exist", out.index()));
        }
        if state[out.index()] == VisitState::Unseen {
            visit(out, graph, &mut state, &mut order)?;
        }
    }

    Ok(order)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Unseen,
    OnStack,
    Done,
}

fn visit(
    slot: SlotId,
    graph: &FlowGraph,
    state: &mut [VisitState],
    order: &mut Vec<SlotId>,
) -> Result<(), String> {
    let i = slot.index();
    match state[i] {
        VisitState::Done => return Ok(()),
        VisitState::OnStack => return Err(format!("Cycle detected through slot {}", i)),
        VisitState::Unseen => state[i] = VisitState::OnStack,
    }
    for &input in graph.get_parents(slot) {
        visit(input, graph, state, order)?;
    }
    state[i] = VisitState::Done;
    order.push(slot);
    Ok(())
}
