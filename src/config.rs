//! Tunables for the canvas engine.
//!
//! Everything here is passed explicitly into the layout, viewport and
//! branching code; nothing reads ambient globals.

use egui::{Pos2, Rect, Vec2};
use serde::{Deserialize, Serialize};

use crate::graph_utils::graph::Node;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanvasConfig {
    pub branch: BranchConfig,
    pub layout: LayoutConfig,
    pub viewport: ViewportConfig,
    pub geometry: NodeGeometry,
    pub star: StarConfig,
    pub island: IslandConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchConfig {
    pub horizontal_offset: f32,
    pub message_spacing: f32,
    // Sibling stacking distance; half of it is the overlap threshold
    pub spacing: f32,
    pub max_attempts: usize,
    pub title_len: usize,
    // Where code previews land relative to the originating card
    pub preview_gap_x: f32,
    pub preview_step_y: f32,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            horizontal_offset: 400.0,
            message_spacing: 120.0,
            spacing: 200.0,
            max_attempts: 64,
            title_len: 30,
            preview_gap_x: 80.0,
            preview_step_y: 160.0,
        }
    }
}

impl BranchConfig {
    pub fn overlap_threshold(&self) -> f32 { self.spacing * 0.5 }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub initial_offset_x: f32,
    pub initial_offset_y: f32,
    pub level_spacing: f32,
    pub message_spacing: f32,
    pub branch_padding: f32,
    // Fraction of the viewport the fitted structure may occupy
    pub fit_fraction: f32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            initial_offset_x: 50.0,
            initial_offset_y: 150.0,
            level_spacing: 400.0,
            message_spacing: 120.0,
            branch_padding: 200.0,
            fit_fraction: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewportConfig {
    pub pan_sensitivity: f32,
    pub animation_ms: u64,
    pub tree_min_scale: f32,
    pub tree_max_scale: f32,
    pub topic_min_scale: f32,
    pub topic_max_scale: f32,
    pub focus_scale: f32,
    pub fit_padding: f32,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            pan_sensitivity: 1.0,
            animation_ms: 450,
            tree_min_scale: 0.1,
            tree_max_scale: 4.0,
            topic_min_scale: 0.3,
            topic_max_scale: 2.5,
            focus_scale: 1.0,
            fit_padding: 40.0,
        }
    }
}

/// Card dimensions in canvas units, used for hit testing, bounding boxes and
/// centering on a focused message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeGeometry {
    pub width: f32,
    pub header_height: f32,
    pub message_height: f32,
}

impl Default for NodeGeometry {
    fn default() -> Self {
        Self { width: 320.0, header_height: 44.0, message_height: 56.0 }
    }
}

impl NodeGeometry {
    pub fn size(&self, node: &Node, expanded: bool) -> Vec2 {
        let rows = if expanded { node.messages.len().max(1) } else { 1 };
        Vec2::new(self.width, self.header_height + rows as f32 * self.message_height)
    }

    pub fn rect(&self, node: &Node, expanded: bool) -> Rect {
        Rect::from_min_size(node.pos(), self.size(node, expanded))
    }

    // Canvas point at the middle of message row `index` of an expanded card
    pub fn message_anchor(&self, node: &Node, index: usize) -> Pos2 {
        Pos2::new(
            node.x + self.width * 0.5,
            node.y + self.header_height + (index as f32 + 0.5) * self.message_height,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StarConfig {
    pub points: usize,
    pub radius: f32,
    pub inner_ratio: f32,
    pub jitter_angle: f32,
    pub jitter_radius: f32,
    pub link_distance: f32,
    pub link_strength: f32,
    pub topic_repulsion: f32,
    pub leaf_repulsion: f32,
    pub topic_radius: f32,
    pub leaf_radius: f32,
    pub wander: f32,
    pub damping: f32,
}

impl Default for StarConfig {
    fn default() -> Self {
        Self {
            points: 5,
            radius: 300.0,
            inner_ratio: 0.45,
            jitter_angle: 0.35,
            jitter_radius: 80.0,
            link_distance: 90.0,
            link_strength: 0.6,
            topic_repulsion: 2400.0,
            leaf_repulsion: 300.0,
            topic_radius: 26.0,
            leaf_radius: 7.0,
            wander: 6.0,
            damping: 4.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IslandConfig {
    pub glyph_width: f32,
    pub row_height: f32,
    pub padding: f32,
    pub branch_badge_width: f32,
    pub repulsion: f32,
    pub center_pull: f32,
    pub damping: f32,
    pub settle_threshold: f32,
    pub max_ticks: usize,
}

impl Default for IslandConfig {
    fn default() -> Self {
        Self {
            glyph_width: 7.0,
            row_height: 18.0,
            padding: 16.0,
            branch_badge_width: 24.0,
            repulsion: 0.8,
            center_pull: 0.6,
            damping: 5.0,
            settle_threshold: 0.5,
            max_ticks: 2000,
        }
    }
}
