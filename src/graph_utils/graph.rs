use std::collections::{BTreeMap, BTreeSet, HashSet};

use egui::Pos2;
use log::warn;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::error::{CanvasError, CanvasResult};

// Node ids are a monotonic counter; the main node is seeded as 1 by convention.
pub type NodeId = u64;

pub const MAIN_NODE_ID: NodeId = 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: String,
    pub message_id: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            role,
            content: content.into(),
            timestamp,
            message_id: Uuid::now_v7().to_string(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self { Self::new(Role::User, content) }
    pub fn assistant(content: impl Into<String>) -> Self { Self::new(Role::Assistant, content) }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Main,
    Branch,
    Preview,
}

/// One branch of the conversation tree.
///
/// `x`/`y` are canvas coordinates of the card's top-left corner. Field names
/// serialize in camelCase so the persistence backend sees the same shape the
/// web client used.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub title: String,
    // Explicitly set titles are never replaced by derived ones
    #[serde(default)]
    pub pinned_title: bool,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_index: Option<usize>,
    #[serde(default)]
    pub context_messages: Vec<Message>,
    pub x: f32,
    pub y: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_content: Option<String>,
}

impl Node {
    pub fn main(id: NodeId, title: impl Into<String>, pos: Pos2) -> Self {
        Self {
            id,
            kind: NodeKind::Main,
            title: title.into(),
            pinned_title: false,
            messages: Vec::new(),
            parent_id: None,
            parent_message_index: None,
            context_messages: Vec::new(),
            x: pos.x,
            y: pos.y,
            system_prompt: None,
            streaming_content: None,
        }
    }

    pub fn pos(&self) -> Pos2 { Pos2::new(self.x, self.y) }

    pub fn set_pos(&mut self, pos: Pos2) {
        self.x = pos.x;
        self.y = pos.y;
    }

    pub fn is_main(&self) -> bool { self.kind == NodeKind::Main }

    pub fn is_streaming(&self) -> bool { self.streaming_content.is_some() }

    pub fn last_message_index(&self) -> Option<usize> { self.messages.len().checked_sub(1) }
}

/// Partial update applied by `ConversationGraph::update`.
#[derive(Clone, Debug, Default)]
pub struct NodePatch {
    pub title: Option<String>,
    pub position: Option<Pos2>,
    pub system_prompt: Option<Option<String>>,
}

/// Arena of conversation nodes. Parent links are plain ids resolved by lookup.
#[derive(Clone, Debug)]
pub struct ConversationGraph {
    nodes: BTreeMap<NodeId, Node>,
    // Monotonic: never lowered by remove, so ids of deleted nodes are not reissued
    next_id: NodeId,
}

impl Default for ConversationGraph {
    fn default() -> Self { Self::new() }
}

impl ConversationGraph {
    // Instantiate a new, empty graph
    pub fn new() -> Self {
        ConversationGraph { nodes: BTreeMap::new(), next_id: MAIN_NODE_ID }
    }

    // Graph seeded with its main node at the conventional origin
    pub fn with_main(title: impl Into<String>) -> Self {
        let mut g = Self::new();
        g.nodes.insert(MAIN_NODE_ID, Node::main(MAIN_NODE_ID, title, Pos2::new(50.0, 150.0)));
        g.next_id = MAIN_NODE_ID + 1;
        g
    }

    pub fn add(&mut self, node: Node) -> CanvasResult<NodeId> {
        if self.nodes.contains_key(&node.id) {
            return Err(CanvasError::integrity(format!("duplicate node id {}", node.id)));
        }
        match node.kind {
            NodeKind::Main => {
                if node.parent_id.is_some() {
                    return Err(CanvasError::integrity("main node cannot have a parent"));
                }
                if let Some(existing) = self.main_id() {
                    return Err(CanvasError::integrity(format!("main node {} already exists", existing)));
                }
            }
            NodeKind::Branch | NodeKind::Preview => {
                let parent = node
                    .parent_id
                    .ok_or_else(|| CanvasError::integrity(format!("node {} has no parent", node.id)))?;
                if !self.nodes.contains_key(&parent) {
                    return Err(CanvasError::MissingNode(parent));
                }
            }
        }
        let id = node.id;
        self.nodes.insert(id, node);
        self.next_id = self.next_id.max(id + 1);
        Ok(id)
    }

    // Cascade: collect descendants by repeated scans until nothing new joins the set
    pub fn remove(&mut self, id: NodeId) -> CanvasResult<Vec<NodeId>> {
        let node = self.nodes.get(&id).ok_or(CanvasError::MissingNode(id))?;
        if node.is_main() {
            return Err(CanvasError::integrity("the main node cannot be deleted"));
        }
        let mut doomed: BTreeSet<NodeId> = BTreeSet::new();
        doomed.insert(id);
        loop {
            let before = doomed.len();
            for n in self.nodes.values() {
                if let Some(p) = n.parent_id
                    && doomed.contains(&p)
                {
                    doomed.insert(n.id);
                }
            }
            if doomed.len() == before {
                break;
            }
        }
        for d in &doomed {
            self.nodes.remove(d);
        }
        Ok(doomed.into_iter().collect())
    }

    pub fn update(&mut self, id: NodeId, patch: NodePatch) -> CanvasResult<()> {
        let node = self.nodes.get_mut(&id).ok_or(CanvasError::MissingNode(id))?;
        if let Some(title) = patch.title {
            node.title = title;
            node.pinned_title = true;
        }
        if let Some(pos) = patch.position {
            node.set_pos(pos);
        }
        if let Some(prompt) = patch.system_prompt {
            node.system_prompt = prompt;
        }
        Ok(())
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> { self.nodes.get(&id) }
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> { self.nodes.get_mut(&id) }
    pub fn contains(&self, id: NodeId) -> bool { self.nodes.contains_key(&id) }
    pub fn len(&self) -> usize { self.nodes.len() }
    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }
    pub fn nodes(&self) -> impl Iterator<Item = &Node> { self.nodes.values() }
    pub fn ids(&self) -> Vec<NodeId> { self.nodes.keys().copied().collect() }

    pub fn node(&self, id: NodeId) -> CanvasResult<&Node> {
        self.nodes.get(&id).ok_or(CanvasError::MissingNode(id))
    }

    pub fn main_id(&self) -> Option<NodeId> {
        self.nodes.values().find(|n| n.is_main()).map(|n| n.id)
    }

    pub fn next_id(&self) -> NodeId { self.next_id }

    pub fn set_position(&mut self, id: NodeId, pos: Pos2) -> CanvasResult<()> {
        let node = self.nodes.get_mut(&id).ok_or(CanvasError::MissingNode(id))?;
        node.set_pos(pos);
        Ok(())
    }

    // Children ordered top to bottom
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        let mut out: Vec<&Node> = self.nodes.values().filter(|n| n.parent_id == Some(id)).collect();
        out.sort_by(|a, b| a.y.total_cmp(&b.y).then(a.id.cmp(&b.id)));
        out.into_iter().map(|n| n.id).collect()
    }

    /// Every node forked from `parent` at `message_index`, ordered by `y`.
    pub fn sibling_group(&self, parent: NodeId, message_index: usize) -> Vec<NodeId> {
        let mut out: Vec<&Node> = self
            .nodes
            .values()
            .filter(|n| n.parent_id == Some(parent) && n.parent_message_index == Some(message_index))
            .collect();
        out.sort_by(|a, b| a.y.total_cmp(&b.y).then(a.id.cmp(&b.id)));
        out.into_iter().map(|n| n.id).collect()
    }

    /// Nodes sharing this node's fork point, excluding itself. Main has none.
    pub fn siblings(&self, id: NodeId) -> Vec<NodeId> {
        let Some(node) = self.nodes.get(&id) else { return Vec::new() };
        match (node.parent_id, node.parent_message_index) {
            (Some(p), Some(idx)) => self
                .sibling_group(p, idx)
                .into_iter()
                .filter(|s| *s != id)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Root-to-node id list. Stops early (with a warning) if a parent link
    /// revisits an id or dangles.
    pub fn ancestor_chain(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            if !seen.insert(c) {
                warn!("cycle in parent links at node {}", c);
                break;
            }
            let Some(node) = self.nodes.get(&c) else {
                warn!("dangling parent link to node {}", c);
                break;
            };
            chain.push(c);
            cur = node.parent_id;
        }
        chain.reverse();
        chain
    }

    pub fn depth(&self, id: NodeId) -> usize {
        self.ancestor_chain(id).len().saturating_sub(1)
    }

    /// Ancestor history a child forked at `(parent, fork_index)` inherits:
    /// each ancestor's messages up to (and including) the next link's fork point.
    pub fn context_prefix(&self, parent: NodeId, fork_index: usize) -> Vec<Message> {
        let chain = self.ancestor_chain(parent);
        let mut out = Vec::new();
        for (i, aid) in chain.iter().enumerate() {
            let Some(ancestor) = self.nodes.get(aid) else { continue };
            let fork = if i + 1 < chain.len() {
                self.nodes
                    .get(&chain[i + 1])
                    .and_then(|n| n.parent_message_index)
                    .unwrap_or(0)
            } else {
                fork_index
            };
            if ancestor.messages.is_empty() {
                continue;
            }
            let end = fork.min(ancestor.messages.len() - 1);
            out.extend(ancestor.messages[..=end].iter().cloned());
        }
        out
    }

    /// Full prompt transcript for a node, computed by walking parent links.
    pub fn context_for(&self, id: NodeId) -> CanvasResult<Vec<Message>> {
        let node = self.node(id)?;
        match (node.kind, node.parent_id) {
            (NodeKind::Main, _) | (NodeKind::Preview, _) | (_, None) => Ok(node.messages.clone()),
            (NodeKind::Branch, Some(parent)) => {
                let mut ctx = self.context_prefix(parent, node.parent_message_index.unwrap_or(0));
                ctx.extend(node.messages.iter().cloned());
                Ok(ctx)
            }
        }
    }

    pub fn recompute_context(&mut self, id: NodeId) -> CanvasResult<()> {
        let ctx = self.context_for(id)?;
        if let Some(n) = self.nodes.get_mut(&id) {
            n.context_messages = ctx;
        }
        Ok(())
    }

    pub fn verify_context(&self, id: NodeId) -> bool {
        match (self.context_for(id), self.nodes.get(&id)) {
            (Ok(ctx), Some(n)) => ctx == n.context_messages,
            _ => false,
        }
    }

    /// Clamp fork indices that point past a (shortened) parent history and
    /// rebuild context for every node in root-first order. Returns the nodes
    /// whose fork index changed.
    pub fn repair_fork_indices(&mut self) -> Vec<NodeId> {
        let mut repaired = Vec::new();
        let ids = self.ids();
        for id in &ids {
            let Some(node) = self.nodes.get(id) else { continue };
            let (Some(parent), Some(idx)) = (node.parent_id, node.parent_message_index) else { continue };
            let parent_len = self.nodes.get(&parent).map(|p| p.messages.len()).unwrap_or(0);
            let clamped = idx.min(parent_len.saturating_sub(1));
            if clamped != idx {
                warn!("node {} forked at {} but parent {} has {} messages; clamping", id, idx, parent, parent_len);
                if let Some(n) = self.nodes.get_mut(id) {
                    n.parent_message_index = Some(clamped);
                }
                repaired.push(*id);
            }
        }
        let mut order = ids;
        order.sort_by_key(|id| self.depth(*id));
        for id in order {
            let _ = self.recompute_context(id);
        }
        repaired
    }

    // Case-insensitive match on titles and message content
    pub fn search(&self, query: &str) -> Vec<NodeId> {
        let q = query.trim().to_lowercase();
        if q.is_empty() {
            return Vec::new();
        }
        self.nodes
            .values()
            .filter(|n| {
                n.title.to_lowercase().contains(&q)
                    || n.messages.iter().any(|m| m.content.to_lowercase().contains(&q))
            })
            .map(|n| n.id)
            .collect()
    }

    pub fn to_nodes(&self) -> Vec<Node> {
        self.nodes.values().cloned().collect()
    }

    /// Rebuild a graph from persisted nodes, rejecting sets that break the
    /// tree invariants (one main, resolvable parents, no cycles).
    pub fn from_nodes(nodes: Vec<Node>) -> CanvasResult<Self> {
        let mut g = Self::new();
        for n in nodes {
            if g.nodes.insert(n.id, n).is_some() {
                return Err(CanvasError::integrity("duplicate node id in persisted graph"));
            }
        }
        g.next_id = g.nodes.keys().next_back().map(|id| id + 1).unwrap_or(MAIN_NODE_ID);
        let mains = g.nodes.values().filter(|n| n.is_main()).count();
        if mains != 1 {
            return Err(CanvasError::integrity(format!("expected exactly one main node, found {}", mains)));
        }
        let root = g.main_id().unwrap_or(MAIN_NODE_ID);
        for n in g.nodes.values() {
            if n.is_main() {
                continue;
            }
            match n.parent_id {
                Some(p) if g.nodes.contains_key(&p) => {}
                Some(p) => return Err(CanvasError::MissingNode(p)),
                None => return Err(CanvasError::integrity(format!("node {} has no parent", n.id))),
            }
            if g.ancestor_chain(n.id).first() != Some(&root) {
                return Err(CanvasError::integrity(format!("node {} is not reachable from main", n.id)));
            }
        }
        Ok(g)
    }
}
