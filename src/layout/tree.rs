use std::collections::{HashMap, HashSet};

use egui::{Pos2, Rect, Vec2};
use log::debug;

use crate::config::{LayoutConfig, NodeGeometry};
use crate::graph_utils::graph::{ConversationGraph, NodeId};

/// Deterministic tree-stack placement.
///
/// Column is the node's depth below main; row is its fork message index plus
/// a padding step per earlier sibling at the same fork point. Returns the
/// bounding box of the laid-out cards, or `None` for a graph without a main
/// node.
pub fn apply_tree_layout(
    graph: &mut ConversationGraph,
    cfg: &LayoutConfig,
    geometry: &NodeGeometry,
    expanded: &HashSet<NodeId>,
) -> Option<Rect> {
    let targets = compute_tree_positions(graph, cfg)?;
    let mut bounds: Option<Rect> = None;
    for (id, pos) in &targets {
        if let Some(node) = graph.get_mut(*id) {
            node.set_pos(*pos);
            let r = geometry.rect(node, expanded.contains(id));
            bounds = Some(match bounds {
                Some(b) => b.union(r),
                None => r,
            });
        }
    }
    debug!("tree layout placed {} nodes", targets.len());
    bounds
}

/// Target positions without touching the graph.
pub fn compute_tree_positions(graph: &ConversationGraph, cfg: &LayoutConfig) -> Option<HashMap<NodeId, Pos2>> {
    let main = graph.main_id()?;

    // Rank within each fork point by creation order (id)
    let mut groups: HashMap<(NodeId, usize), Vec<NodeId>> = HashMap::new();
    for n in graph.nodes() {
        if let (Some(p), Some(i)) = (n.parent_id, n.parent_message_index) {
            groups.entry((p, i)).or_default().push(n.id);
        }
    }
    let mut sibling_rank: HashMap<NodeId, usize> = HashMap::new();
    for ids in groups.values_mut() {
        ids.sort();
        for (rank, id) in ids.iter().enumerate() {
            sibling_rank.insert(*id, rank);
        }
    }

    let mut out: HashMap<NodeId, Pos2> = HashMap::new();
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut stack: Vec<(NodeId, usize)> = vec![(main, 0)];
    while let Some((id, depth)) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let Some(node) = graph.get(id) else { continue };
        let x = cfg.initial_offset_x + depth as f32 * cfg.level_spacing;
        let y = match node.parent_message_index {
            None => cfg.initial_offset_y,
            Some(idx) => {
                let rank = sibling_rank.get(&id).copied().unwrap_or(0);
                cfg.initial_offset_y + idx as f32 * cfg.message_spacing + rank as f32 * cfg.branch_padding
            }
        };
        out.insert(id, Pos2::new(x, y));
        let mut children = graph.children(id);
        children.sort();
        // Reverse so the lowest id is visited first
        for child in children.into_iter().rev() {
            stack.push((child, depth + 1));
        }
    }
    Some(out)
}

/// Scale and translate that fit `bounds` into `fraction` of the viewport and
/// center it. Never zooms in past 1:1.
pub fn fit_transform(bounds: Rect, viewport: Vec2, fraction: f32) -> (f32, Vec2) {
    let w = bounds.width().max(1.0);
    let h = bounds.height().max(1.0);
    let scale = (viewport.x * fraction / w).min(viewport.y * fraction / h).min(1.0);
    let translate = viewport * 0.5 - bounds.center().to_vec2() * scale;
    (scale, translate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_never_zooms_in_and_centers() {
        let bounds = Rect::from_min_size(Pos2::new(50.0, 150.0), Vec2::new(100.0, 100.0));
        let (scale, t) = fit_transform(bounds, Vec2::new(1000.0, 800.0), 0.8);
        assert_eq!(scale, 1.0);
        let center = bounds.center().to_vec2() * scale + t;
        assert!((center - Vec2::new(500.0, 400.0)).length() < 1e-3);

        let big = Rect::from_min_size(Pos2::ZERO, Vec2::new(4000.0, 1000.0));
        let (scale, _) = fit_transform(big, Vec2::new(1000.0, 800.0), 0.8);
        assert!((scale - 0.2).abs() < 1e-6);
    }
}
