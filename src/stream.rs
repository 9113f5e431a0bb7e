use std::collections::HashMap;

use egui::Pos2;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{BranchConfig, NodeGeometry};
use crate::error::{CanvasError, CanvasResult};
use crate::graph_utils::branch::{self, derive_title};
use crate::graph_utils::graph::{ConversationGraph, Message, Node, NodeId, NodeKind, Role};

static FENCE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?s)```([A-Za-z0-9_+#.\-]*)[^\n]*\n(.*?)```").ok());

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeBlock {
    pub language: String,
    pub code: String,
}

/// Fenced code blocks in order of appearance. An unterminated fence is not
/// a block.
pub fn extract_code_blocks(text: &str) -> Vec<CodeBlock> {
    let Some(fence) = FENCE.as_ref() else { return Vec::new() };
    fence
        .captures_iter(text)
        .filter_map(|c| {
            let code = c.get(2)?.as_str().trim().to_string();
            if code.is_empty() {
                return None;
            }
            let language = c.get(1).map(|l| l.as_str()).filter(|l| !l.is_empty()).unwrap_or("text");
            Some(CodeBlock { language: language.to_string(), code })
        })
        .collect()
}

// Previews hold extracted code only
fn ensure_writable(node: &Node) -> CanvasResult<()> {
    if node.kind == NodeKind::Preview {
        return Err(CanvasError::integrity(format!("node {} is a read-only code preview", node.id)));
    }
    Ok(())
}

/// Identifies one generation run on one node. Deltas carrying a ticket that
/// is no longer current are dropped.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct GenerationTicket {
    pub node: NodeId,
    pub seq: u64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct IngestReport {
    pub node: NodeId,
    pub message_index: usize,
    pub title_changed: bool,
    pub previews: Vec<NodeId>,
}

/// Merges batch and streamed generation output into the graph.
#[derive(Debug)]
pub struct StreamIngestor {
    active: HashMap<NodeId, u64>,
    next_seq: u64,
    branch: BranchConfig,
    geometry: NodeGeometry,
}

impl StreamIngestor {
    pub fn new(branch: BranchConfig, geometry: NodeGeometry) -> Self {
        Self { active: HashMap::new(), next_seq: 1, branch, geometry }
    }

    pub fn is_active(&self, node: NodeId) -> bool { self.active.contains_key(&node) }

    pub fn current(&self, node: NodeId) -> Option<GenerationTicket> {
        self.active.get(&node).map(|seq| GenerationTicket { node, seq: *seq })
    }

    fn is_current(&self, t: GenerationTicket) -> bool { self.active.get(&t.node) == Some(&t.seq) }

    /// Append a finished message in one piece.
    pub fn append_message(&mut self, graph: &mut ConversationGraph, node: NodeId, message: Message) -> CanvasResult<IngestReport> {
        self.commit(graph, node, message)
    }

    pub fn begin(&mut self, graph: &mut ConversationGraph, node: NodeId) -> CanvasResult<GenerationTicket> {
        if self.active.contains_key(&node) {
            return Err(CanvasError::GenerationInFlight(node));
        }
        self.start(graph, node)
    }

    /// Supersede whatever is running on `node` and start over.
    pub fn restart(&mut self, graph: &mut ConversationGraph, node: NodeId) -> CanvasResult<GenerationTicket> {
        if let Some(old) = self.active.remove(&node) {
            debug!("generation {} on node {} superseded", old, node);
        }
        self.start(graph, node)
    }

    fn start(&mut self, graph: &mut ConversationGraph, node: NodeId) -> CanvasResult<GenerationTicket> {
        let n = graph.get_mut(node).ok_or(CanvasError::MissingNode(node))?;
        ensure_writable(n)?;
        n.streaming_content = Some(String::new());
        let seq = self.next_seq;
        self.next_seq += 1;
        self.active.insert(node, seq);
        Ok(GenerationTicket { node, seq })
    }

    /// Returns false when the delta was dropped (stale ticket or node gone).
    pub fn push_delta(&mut self, graph: &mut ConversationGraph, ticket: GenerationTicket, text: &str) -> bool {
        if !self.is_current(ticket) {
            return false;
        }
        match graph.get_mut(ticket.node) {
            Some(n) => {
                n.streaming_content.get_or_insert_with(String::new).push_str(text);
                true
            }
            None => {
                self.active.remove(&ticket.node);
                false
            }
        }
    }

    /// Turn the placeholder into an assistant message. A stale ticket
    /// finishes as `UserAbort`.
    pub fn finish(&mut self, graph: &mut ConversationGraph, ticket: GenerationTicket) -> CanvasResult<IngestReport> {
        if !self.is_current(ticket) {
            return Err(CanvasError::UserAbort);
        }
        self.active.remove(&ticket.node);
        let n = graph.get_mut(ticket.node).ok_or(CanvasError::MissingNode(ticket.node))?;
        let text = n.streaming_content.take().unwrap_or_default();
        self.commit(graph, ticket.node, Message::assistant(text))
    }

    pub fn abort(&mut self, graph: &mut ConversationGraph, ticket: GenerationTicket) {
        if self.is_current(ticket) {
            self.active.remove(&ticket.node);
            if let Some(n) = graph.get_mut(ticket.node) {
                n.streaming_content = None;
            }
        }
    }

    /// Drop the partial output; the graph keeps its previous messages.
    pub fn fail(&mut self, graph: &mut ConversationGraph, ticket: GenerationTicket, error: CanvasError) -> CanvasError {
        if self.is_current(ticket) {
            warn!("generation on node {} failed: {}", ticket.node, error);
        }
        self.abort(graph, ticket);
        error
    }

    pub fn forget(&mut self, ids: &[NodeId]) {
        self.active.retain(|node, _| !ids.contains(node));
    }

    fn commit(&mut self, graph: &mut ConversationGraph, node: NodeId, message: Message) -> CanvasResult<IngestReport> {
        let is_assistant = message.role == Role::Assistant;
        let content = message.content.clone();
        let n = graph.get_mut(node).ok_or(CanvasError::MissingNode(node))?;
        ensure_writable(n)?;
        n.messages.push(message.clone());
        n.context_messages.push(message);
        let message_index = n.messages.len() - 1;

        let mut title_changed = false;
        if !n.pinned_title {
            let source = n
                .messages
                .iter()
                .find(|m| m.role == Role::User)
                .or_else(|| n.messages.first())
                .map(|m| m.content.as_str())
                .unwrap_or("");
            let title = derive_title(source, self.branch.title_len);
            if title != n.title {
                n.title = title;
                title_changed = true;
            }
        }
        let origin = n.pos();

        let mut previews = Vec::new();
        if is_assistant {
            for (i, block) in extract_code_blocks(&content).iter().enumerate() {
                let pos = Pos2::new(
                    origin.x + self.geometry.width + self.branch.preview_gap_x,
                    origin.y + (i as f32 + 1.0) * self.branch.preview_step_y,
                );
                let preview = branch::create_preview_branch(graph.next_id(), node, &block.code, &block.language, pos, message_index);
                previews.push(graph.add(preview)?);
            }
        }
        if !previews.is_empty() {
            debug!("node {} produced {} code preview(s)", node, previews.len());
        }
        Ok(IngestReport { node, message_index, title_changed, previews })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_with_and_without_language() {
        let text = "intro\n```rust\nfn main() {}\n```\nmid\n```\nplain\n```\n```py\nunterminated";
        let blocks = extract_code_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0], CodeBlock { language: "rust".into(), code: "fn main() {}".into() });
        assert_eq!(blocks[1].language, "text");
    }

    #[test]
    fn stale_ticket_chunks_are_ignored() {
        let mut g = ConversationGraph::with_main("chat");
        let mut ing = StreamIngestor::new(BranchConfig::default(), NodeGeometry::default());
        let old = ing.begin(&mut g, 1).unwrap();
        assert!(matches!(ing.begin(&mut g, 1), Err(CanvasError::GenerationInFlight(1))));
        assert!(ing.push_delta(&mut g, old, "stale "));
        let fresh = ing.restart(&mut g, 1).unwrap();
        assert!(!ing.push_delta(&mut g, old, "late"));
        assert!(ing.push_delta(&mut g, fresh, "Hello"));
        assert!(ing.push_delta(&mut g, fresh, " world"));
        assert!(matches!(ing.finish(&mut g, old), Err(CanvasError::UserAbort)));
        let report = ing.finish(&mut g, fresh).unwrap();
        let main = g.get(1).unwrap();
        assert_eq!(main.messages[report.message_index].content, "Hello world");
        assert!(main.streaming_content.is_none());
    }
}
