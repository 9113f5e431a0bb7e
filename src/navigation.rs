use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::graph_utils::graph::{ConversationGraph, Node, NodeId};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub node: NodeId,
    pub message_index: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" | "u" => Ok(Direction::Up),
            "down" | "d" => Ok(Direction::Down),
            "left" | "l" => Ok(Direction::Left),
            "right" | "r" => Ok(Direction::Right),
            other => Err(format!("unknown direction '{}'", other)),
        }
    }
}

/// Keyboard cursor over the conversation tree. Reads the graph, never
/// mutates it; a move that has no target leaves the cursor alone.
#[derive(Clone, Debug, Default)]
pub struct Navigator {
    cursor: Option<Cursor>,
    // Next child to visit per (node, direction)
    round_robin: HashMap<(NodeId, Direction), usize>,
}

impl Navigator {
    pub fn new() -> Self { Self::default() }

    pub fn cursor(&self) -> Option<Cursor> { self.cursor }

    pub fn select(&mut self, graph: &ConversationGraph, node: NodeId, last_message: bool) -> Option<Cursor> {
        let n = graph.get(node)?;
        let message_index = if last_message { n.last_message_index().unwrap_or(0) } else { 0 };
        let c = Cursor { node, message_index };
        self.cursor = Some(c);
        Some(c)
    }

    pub fn set_cursor(&mut self, graph: &ConversationGraph, cursor: Cursor) -> Option<Cursor> {
        let n = graph.get(cursor.node)?;
        let c = Cursor { node: cursor.node, message_index: clamp_index(n, cursor.message_index) };
        self.cursor = Some(c);
        Some(c)
    }

    pub fn clear(&mut self) {
        self.cursor = None;
    }

    /// Drop state for deleted nodes.
    pub fn forget(&mut self, ids: &[NodeId]) {
        if let Some(c) = self.cursor
            && ids.contains(&c.node)
        {
            self.cursor = None;
        }
        self.round_robin.retain(|(node, _), _| !ids.contains(node));
    }

    pub fn navigate(&mut self, graph: &ConversationGraph, dir: Direction) -> Option<Cursor> {
        let cur = self.cursor?;
        let node = graph.get(cur.node)?;
        let next = match dir {
            Direction::Up => self.vertical(graph, node, cur, true),
            Direction::Down => self.vertical(graph, node, cur, false),
            Direction::Left => self.horizontal(graph, node, false),
            Direction::Right => self.horizontal(graph, node, true),
        }?;
        self.cursor = Some(next);
        Some(next)
    }

    fn vertical(&self, graph: &ConversationGraph, node: &Node, cur: Cursor, up: bool) -> Option<Cursor> {
        let idx = clamp_index(node, cur.message_index);
        if up && idx > 0 {
            return Some(Cursor { node: node.id, message_index: idx - 1 });
        }
        if !up && idx + 1 < node.messages.len() {
            return Some(Cursor { node: node.id, message_index: idx + 1 });
        }
        // Edge of this card: hop to the nearest sibling on that side
        let siblings: Vec<&Node> = graph.siblings(node.id).into_iter().filter_map(|id| graph.get(id)).collect();
        let target = if up {
            siblings
                .iter()
                .filter(|s| s.y < node.y || (s.y == node.y && s.id < node.id))
                .max_by(|a, b| a.y.total_cmp(&b.y).then(a.id.cmp(&b.id)))
        } else {
            siblings
                .iter()
                .filter(|s| s.y > node.y || (s.y == node.y && s.id > node.id))
                .min_by(|a, b| a.y.total_cmp(&b.y).then(a.id.cmp(&b.id)))
        }?;
        let message_index = if up { target.last_message_index().unwrap_or(0) } else { 0 };
        Some(Cursor { node: target.id, message_index })
    }

    fn horizontal(&mut self, graph: &ConversationGraph, node: &Node, right: bool) -> Option<Cursor> {
        let on_side = |x: f32| if right { x > node.x } else { x < node.x };

        if let Some(parent) = node.parent_id.and_then(|p| graph.get(p))
            && on_side(parent.x)
        {
            let idx = clamp_index(parent, node.parent_message_index.unwrap_or(0));
            return Some(Cursor { node: parent.id, message_index: idx });
        }

        let children: Vec<NodeId> = graph
            .children(node.id)
            .into_iter()
            .filter(|c| graph.get(*c).map(|n| on_side(n.x)).unwrap_or(false))
            .collect();
        if children.is_empty() {
            return None;
        }
        let dir = if right { Direction::Right } else { Direction::Left };
        let slot = self.round_robin.entry((node.id, dir)).or_insert(0);
        let pick = children[*slot % children.len()];
        *slot = (*slot + 1) % children.len();
        Some(Cursor { node: pick, message_index: 0 })
    }
}

fn clamp_index(node: &Node, idx: usize) -> usize {
    idx.min(node.last_message_index().unwrap_or(0))
}
