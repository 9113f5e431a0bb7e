use egui::Pos2;
use log::debug;

use super::graph::{ConversationGraph, Message, Node, NodeId, NodeKind};
use crate::config::BranchConfig;
use crate::error::{CanvasError, CanvasResult};

/// Caller-supplied pieces of a new branch; everything else is derived from
/// the parent.
#[derive(Clone, Debug, Default)]
pub struct BranchTemplate {
    pub id: NodeId,
    pub title: Option<String>,
    pub system_prompt: Option<String>,
}

impl BranchTemplate {
    pub fn with_id(id: NodeId) -> Self {
        Self { id, ..Default::default() }
    }
}

// First line of the content, cut to `max` characters
pub fn derive_title(content: &str, max: usize) -> String {
    let line = content.trim().lines().next().unwrap_or("").trim();
    if line.is_empty() {
        return "Untitled".to_string();
    }
    if line.chars().count() <= max {
        return line.to_string();
    }
    let mut out: String = line.chars().take(max).collect();
    out.push('…');
    out
}

/// Fork `parent_id` at `message_index`. The returned node is not registered;
/// the caller inserts it into the graph.
pub fn create_branch(
    graph: &ConversationGraph,
    parent_id: NodeId,
    message_index: usize,
    template: BranchTemplate,
    cfg: &BranchConfig,
) -> CanvasResult<Node> {
    let parent = graph.node(parent_id)?;
    let forked = parent.messages.get(message_index).cloned().ok_or_else(|| {
        CanvasError::integrity(format!(
            "message index {} out of range for node {} ({} messages)",
            message_index,
            parent_id,
            parent.messages.len()
        ))
    })?;
    if graph.contains(template.id) {
        return Err(CanvasError::integrity(format!("node id {} already in use", template.id)));
    }

    let sibling_count = graph.sibling_group(parent_id, message_index).len();
    let candidate = Pos2::new(
        parent.x + cfg.horizontal_offset,
        parent.y + message_index as f32 * cfg.message_spacing + sibling_count as f32 * cfg.spacing,
    );
    let occupied: Vec<Pos2> = graph.nodes().map(|n| n.pos()).collect();
    let pos = resolve_overlap(candidate, &occupied, cfg);

    let mut context_messages = graph.context_prefix(parent_id, message_index);
    context_messages.push(forked.clone());

    let title = template
        .title
        .clone()
        .unwrap_or_else(|| derive_title(&forked.content, cfg.title_len));
    debug!("branch {} from node {} at message {} -> ({:.0}, {:.0})", template.id, parent_id, message_index, pos.x, pos.y);

    Ok(Node {
        id: template.id,
        kind: NodeKind::Branch,
        title,
        pinned_title: template.title.is_some(),
        messages: vec![forked],
        parent_id: Some(parent_id),
        parent_message_index: Some(message_index),
        context_messages,
        x: pos.x,
        y: pos.y,
        system_prompt: template.system_prompt.or_else(|| parent.system_prompt.clone()),
        streaming_content: None,
    })
}

/// Shift `candidate` down in half-spacing steps until it is at least the
/// overlap threshold away from every occupied point. Bounded by
/// `max_attempts`; afterwards the node goes one spacing below the lowest
/// occupied point, which is always clear.
pub fn resolve_overlap(candidate: Pos2, occupied: &[Pos2], cfg: &BranchConfig) -> Pos2 {
    let threshold = cfg.overlap_threshold();
    let is_clear = |p: Pos2| occupied.iter().all(|o| o.distance(p) >= threshold);
    let mut p = candidate;
    for _ in 0..cfg.max_attempts {
        if is_clear(p) {
            return p;
        }
        p.y += threshold;
    }
    let lowest = occupied.iter().map(|o| o.y).fold(candidate.y, f32::max);
    debug!("overlap resolution exhausted {} attempts; placing below y={}", cfg.max_attempts, lowest);
    Pos2::new(candidate.x, lowest + cfg.spacing.max(threshold))
}

/// Read-only preview card holding a generated code block.
pub fn create_preview_branch(
    id: NodeId,
    parent_id: NodeId,
    code: &str,
    language: &str,
    position: Pos2,
    message_index: usize,
) -> Node {
    let message = Message::assistant(code);
    Node {
        id,
        kind: NodeKind::Preview,
        title: format!("{} snippet", language),
        pinned_title: true,
        messages: vec![message.clone()],
        parent_id: Some(parent_id),
        parent_message_index: Some(message_index),
        context_messages: vec![message],
        x: position.x,
        y: position.y,
        system_prompt: None,
        streaming_content: None,
    }
}
