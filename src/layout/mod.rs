pub mod force;
pub mod topics;
pub mod tree;

use egui::{Pos2, Rect, Vec2};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use force::Simulation;
use topics::TopicScene;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutMode {
    #[default]
    Tree,
    Star,
    Island,
}

impl LayoutMode {
    pub fn is_topic_map(self) -> bool { !matches!(self, LayoutMode::Tree) }

    pub fn label(self) -> &'static str {
        match self {
            LayoutMode::Tree => "tree",
            LayoutMode::Star => "star",
            LayoutMode::Island => "island",
        }
    }
}

impl std::str::FromStr for LayoutMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tree" => Ok(LayoutMode::Tree),
            "star" => Ok(LayoutMode::Star),
            "island" | "islands" => Ok(LayoutMode::Island),
            other => Err(format!("unknown layout mode '{}'", other)),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub moved: bool,
    // Ask the viewport for a one-shot fit
    pub needs_fit: bool,
}

// Non-converging simulations are fitted once they have had this long to spread
const WARMUP_TICKS: usize = 90;

struct LayoutTask {
    sim: Box<dyn Simulation>,
    token: CancellationToken,
    ticks: usize,
}

/// Owns the running topic-map simulation as a cancellable repeating task
/// driven by the frame loop.
pub struct LayoutDriver {
    mode: LayoutMode,
    task: Option<LayoutTask>,
    fitted: bool,
}

impl Default for LayoutDriver {
    fn default() -> Self { Self::new() }
}

impl LayoutDriver {
    pub fn new() -> Self {
        Self { mode: LayoutMode::Tree, task: None, fitted: false }
    }

    pub fn mode(&self) -> LayoutMode { self.mode }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.token.is_cancelled()).unwrap_or(false)
    }

    /// Replace whatever is running. The returned token cancels this task only.
    pub fn start(&mut self, mode: LayoutMode, sim: Box<dyn Simulation>) -> CancellationToken {
        self.cancel();
        let token = CancellationToken::new();
        debug!("layout task started: {} ({} scene nodes)", mode.label(), sim.scene().nodes.len());
        self.task = Some(LayoutTask { sim, token: token.clone(), ticks: 0 });
        self.mode = mode;
        self.fitted = false;
        token
    }

    /// Tree mode has no running task; switching to it stops any simulation.
    pub fn set_tree(&mut self) {
        self.cancel();
        self.mode = LayoutMode::Tree;
        self.fitted = false;
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.token.cancel();
            debug!("layout task cancelled after {} ticks", task.ticks);
        }
    }

    pub fn tick(&mut self, dt: f32) -> TickReport {
        let Some(task) = self.task.as_mut() else { return TickReport::default() };
        if task.token.is_cancelled() {
            self.task = None;
            return TickReport::default();
        }
        let moved = task.sim.tick(dt);
        task.ticks += 1;
        let stable = if task.sim.converges() { !moved } else { task.ticks >= WARMUP_TICKS };
        let needs_fit = !self.fitted && stable;
        if needs_fit {
            self.fitted = true;
        }
        TickReport { moved, needs_fit }
    }

    /// Request a fresh fit on the next tick and wake a settled simulation.
    pub fn recenter(&mut self) -> Option<Rect> {
        self.fitted = false;
        let task = self.task.as_mut()?;
        task.sim.reheat();
        task.sim.bounds()
    }

    pub fn scene(&self) -> Option<&TopicScene> { self.task.as_ref().map(|t| t.sim.scene()) }

    pub fn bounds(&self) -> Option<Rect> { self.task.as_ref().and_then(|t| t.sim.bounds()) }

    // Topmost scene node under a canvas point
    pub fn hit_test(&self, canvas: Pos2) -> Option<usize> {
        let scene = self.scene()?;
        scene.nodes.iter().enumerate().rev().find(|(_, n)| n.rect().contains(canvas)).map(|(i, _)| i)
    }

    pub fn pin(&mut self, index: usize) { self.set_pinned(index, true) }

    pub fn unpin(&mut self, index: usize) {
        self.set_pinned(index, false);
        if let Some(task) = self.task.as_mut() {
            task.sim.reheat();
        }
    }

    fn set_pinned(&mut self, index: usize, pinned: bool) {
        if let Some(node) = self.task.as_mut().and_then(|t| t.sim.scene_mut().nodes.get_mut(index)) {
            node.pinned = pinned;
            node.vel = Vec2::ZERO;
        }
    }

    /// Drag deltas are the only position source for a pinned scene node.
    pub fn drag(&mut self, index: usize, delta: Vec2) {
        if let Some(node) = self.task.as_mut().and_then(|t| t.sim.scene_mut().nodes.get_mut(index)) {
            node.pinned = true;
            node.pos += delta;
        }
    }
}

impl Drop for LayoutDriver {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StarConfig;
    use crate::layout::force::StarSimulation;
    use crate::layout::topics::{SceneNode, SceneNodeKind};

    fn one_point_scene() -> TopicScene {
        TopicScene {
            nodes: vec![SceneNode {
                label: "chat".into(),
                kind: SceneNodeKind::Conversation { cluster: 0, branched: false },
                pos: Pos2::new(10.0, 10.0),
                vel: Vec2::ZERO,
                radius: 5.0,
                size: Vec2::splat(10.0),
                pinned: false,
            }],
            links: vec![],
        }
    }

    #[test]
    fn starting_a_new_mode_cancels_the_previous_task() {
        let mut driver = LayoutDriver::new();
        let first = driver.start(LayoutMode::Star, Box::new(StarSimulation::with_seed(one_point_scene(), StarConfig::default(), 1)));
        let second = driver.start(LayoutMode::Star, Box::new(StarSimulation::with_seed(one_point_scene(), StarConfig::default(), 2)));
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        driver.set_tree();
        assert!(second.is_cancelled());
        assert!(!driver.tick(0.016).moved);
    }

    #[test]
    fn star_fits_once_after_warmup_and_pinned_node_holds() {
        let mut driver = LayoutDriver::new();
        driver.start(LayoutMode::Star, Box::new(StarSimulation::with_seed(one_point_scene(), StarConfig::default(), 3)));
        driver.drag(0, Vec2::new(5.0, 0.0));
        let fits = (0..200).filter(|_| driver.tick(0.016).needs_fit).count();
        assert_eq!(fits, 1);
        assert_eq!(driver.scene().map(|s| s.nodes[0].pos), Some(Pos2::new(15.0, 10.0)));
    }
}
