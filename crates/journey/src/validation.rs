//! Structural checks a journey graph must pass before activation.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::ValidationError;
use crate::types::{Branch, JourneyDefinition, NodeKind, MAX_DELAY_SECS};

/// Validates the graph invariants of a journey definition.
///
/// Checks run in a fixed order so the first reported error is stable for a
/// given definition.
pub fn validate(definition: &JourneyDefinition) -> Result<(), ValidationError> {
    let mut kinds: HashMap<&str, &NodeKind> = HashMap::with_capacity(definition.nodes.len());
    for node in &definition.nodes {
        if kinds.insert(node.id.as_str(), &node.kind).is_some() {
            return Err(ValidationError::DuplicateNodeId(node.id.clone()));
        }
    }

    for edge in &definition.edges {
        if !kinds.contains_key(edge.source.as_str()) || !kinds.contains_key(edge.target.as_str()) {
            return Err(ValidationError::DanglingEdge {
                from: edge.source.clone(),
                to: edge.target.clone(),
            });
        }
    }

    let entries: Vec<&str> = definition
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Entry))
        .map(|n| n.id.as_str())
        .collect();
    let entry = match entries.as_slice() {
        [] => return Err(ValidationError::MissingEntry),
        [single] => *single,
        many => return Err(ValidationError::MultipleEntries(many.len())),
    };

    for edge in &definition.edges {
        if edge.target == entry {
            return Err(ValidationError::EdgeIntoEntry {
                from: edge.source.clone(),
                to: edge.target.clone(),
            });
        }
    }

    for node in &definition.nodes {
        let outgoing: Vec<_> = definition.outgoing(&node.id).collect();

        if !matches!(node.kind, NodeKind::Condition(_)) {
            if let Some(labelled) = outgoing.iter().find(|e| e.branch.is_some()) {
                return Err(ValidationError::UnexpectedBranchLabel {
                    from: labelled.source.clone(),
                    to: labelled.target.clone(),
                });
            }
        }

        match &node.kind {
            NodeKind::Entry => {
                if outgoing.len() != 1 {
                    return Err(ValidationError::EntryOutgoing(outgoing.len()));
                }
            }
            NodeKind::Message(_) => {
                if outgoing.len() > 1 {
                    return Err(ValidationError::MessageFanOut {
                        node_id: node.id.clone(),
                        count: outgoing.len(),
                    });
                }
            }
            NodeKind::Condition(_) => {
                let trues = outgoing.iter().filter(|e| e.branch == Some(Branch::True)).count();
                let falses = outgoing.iter().filter(|e| e.branch == Some(Branch::False)).count();
                if outgoing.len() != 2 || trues != 1 || falses != 1 {
                    return Err(ValidationError::ConditionBranches(node.id.clone()));
                }
            }
            NodeKind::JourneyRef(reference) => {
                if !outgoing.is_empty() {
                    return Err(ValidationError::OutgoingFromJourneyRef(node.id.clone()));
                }
                if reference.target_journey_id == definition.id {
                    return Err(ValidationError::SelfReference(node.id.clone()));
                }
            }
        }
    }

    check_delays(definition)?;
    check_reachability(definition, entry)?;
    check_zero_delay_cycles(definition)?;

    Ok(())
}

fn check_delays(definition: &JourneyDefinition) -> Result<(), ValidationError> {
    let node_delays = definition.nodes.iter().filter_map(|n| match &n.kind {
        NodeKind::Message(msg) => Some((format!("node {}", n.id), msg.delay_secs)),
        _ => None,
    });
    let edge_delays = definition
        .edges
        .iter()
        .map(|e| (format!("edge {} -> {}", e.source, e.target), e.delay_secs));

    match node_delays
        .chain(edge_delays)
        .find(|(_, secs)| *secs > MAX_DELAY_SECS)
    {
        Some((location, secs)) => Err(ValidationError::DelayOutOfRange {
            location,
            secs,
            max: MAX_DELAY_SECS,
        }),
        None => Ok(()),
    }
}

fn check_reachability(definition: &JourneyDefinition, entry: &str) -> Result<(), ValidationError> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    seen.insert(entry);
    queue.push_back(entry);

    while let Some(current) = queue.pop_front() {
        for edge in definition.outgoing(current) {
            if seen.insert(edge.target.as_str()) {
                queue.push_back(edge.target.as_str());
            }
        }
    }

    match definition.nodes.iter().find(|n| !seen.contains(n.id.as_str())) {
        Some(orphan) => Err(ValidationError::Unreachable(orphan.id.clone())),
        None => Ok(()),
    }
}

/// Rejects loops a run could spin around without ever waiting, which would
/// re-send messages on every tick.
fn check_zero_delay_cycles(definition: &JourneyDefinition) -> Result<(), ValidationError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let mut instant: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &definition.edges {
        let own_delay = definition
            .node(&edge.source)
            .map(|n| n.own_delay())
            .unwrap_or_else(chrono::Duration::zero);
        if edge.delay_secs == 0 && own_delay.is_zero() {
            instant
                .entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
        }
    }

    let mut marks: HashMap<&str, Mark> = definition
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), Mark::Unvisited))
        .collect();

    for node in &definition.nodes {
        if marks.get(node.id.as_str()) != Some(&Mark::Unvisited) {
            continue;
        }
        // Iterative DFS; each frame is (node, index of next child).
        let mut stack: Vec<(&str, usize)> = vec![(node.id.as_str(), 0)];
        marks.insert(node.id.as_str(), Mark::InProgress);

        while let Some((current, child_idx)) = stack.pop() {
            let children = instant.get(current).map(Vec::as_slice).unwrap_or(&[]);
            if let Some(&child) = children.get(child_idx) {
                stack.push((current, child_idx + 1));
                match marks.get(child).copied().unwrap_or(Mark::Done) {
                    Mark::InProgress => {
                        return Err(ValidationError::ZeroDelayCycle(child.to_string()));
                    }
                    Mark::Unvisited => {
                        marks.insert(child, Mark::InProgress);
                        stack.push((child, 0));
                    }
                    Mark::Done => {}
                }
            } else {
                marks.insert(current, Mark::Done);
            }
        }
    }

    Ok(())
}
