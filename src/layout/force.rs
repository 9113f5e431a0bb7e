use egui::{Pos2, Rect, Vec2};
use rand::SeedableRng;
use rand::rngs::StdRng;

use super::topics::{SceneNode, TopicScene, jitter};
use crate::config::{IslandConfig, StarConfig};

// Integration clamps shared by both simulations
const MAX_SPEED: f32 = 600.0;
const MAX_STEP: f32 = 8.0;
const MIN_DIST: f32 = 1.0;

/// A force simulation stepped by the frame loop.
pub trait Simulation: Send {
    /// Advance one step; returns whether anything is still moving.
    fn tick(&mut self, dt: f32) -> bool;
    fn scene(&self) -> &TopicScene;
    fn scene_mut(&mut self) -> &mut TopicScene;
    /// Convergent simulations stop reporting motion once they settle.
    fn converges(&self) -> bool;
    /// Restart motion after an external change (drag release, resize).
    fn reheat(&mut self) {}

    fn bounds(&self) -> Option<Rect> { self.scene().bounds() }
}

// Damped unit-mass integration shared by both simulations; returns max speed
fn integrate(nodes: &mut [SceneNode], forces: &[Vec2], damping: f32, dt: f32) -> f32 {
    let mut fastest = 0.0f32;
    for (node, f) in nodes.iter_mut().zip(forces) {
        if node.pinned {
            node.vel = Vec2::ZERO;
            continue;
        }
        let a = *f - node.vel * damping;
        node.vel += a * dt;
        let speed = node.vel.length();
        if speed > MAX_SPEED {
            node.vel *= MAX_SPEED / speed;
        }
        let mut step = node.vel * dt;
        let len = step.length();
        if len > MAX_STEP {
            step *= MAX_STEP / len;
        }
        node.pos += step;
        fastest = fastest.max(node.vel.length());
    }
    fastest
}

fn separation(a: Pos2, b: Pos2) -> (Vec2, f32) {
    let d = b - a;
    let dist = d.length().max(MIN_DIST);
    (d / dist, dist)
}

/// Radial topic map. Never settles: a weak per-axis random force keeps the
/// conversation points drifting around their topic.
pub struct StarSimulation {
    scene: TopicScene,
    cfg: StarConfig,
    rng: StdRng,
}

impl StarSimulation {
    pub fn new(scene: TopicScene, cfg: StarConfig) -> Self {
        Self { scene, cfg, rng: StdRng::from_entropy() }
    }

    pub fn with_seed(scene: TopicScene, cfg: StarConfig, seed: u64) -> Self {
        Self { scene, cfg, rng: StdRng::seed_from_u64(seed) }
    }
}

impl Simulation for StarSimulation {
    fn tick(&mut self, dt: f32) -> bool {
        let n = self.scene.nodes.len();
        let mut forces = vec![Vec2::ZERO; n];
        let cfg = &self.cfg;

        // Links pull conversations toward their topic at the preferred distance
        for &(t, c) in &self.scene.links {
            let (Some(tp), Some(cp)) = (self.scene.nodes.get(t), self.scene.nodes.get(c)) else { continue };
            let (dir, dist) = separation(tp.pos, cp.pos);
            let f = dir * (cfg.link_strength * (dist - cfg.link_distance));
            forces[t] += f;
            forces[c] -= f;
        }

        // Inverse-distance repulsion, stronger around topics; cut off far away
        let cutoff = cfg.link_distance * 4.0;
        for i in 0..n {
            for j in (i + 1)..n {
                let (a, b) = (&self.scene.nodes[i], &self.scene.nodes[j]);
                let (dir, dist) = separation(a.pos, b.pos);
                if dist > cutoff {
                    continue;
                }
                let strength = if a.is_topic() || b.is_topic() { cfg.topic_repulsion } else { cfg.leaf_repulsion };
                let mut f = dir * (strength / dist);
                // Collision: hard push while the discs overlap
                let min_gap = a.radius + b.radius;
                if dist < min_gap {
                    f += dir * ((min_gap - dist) * 20.0);
                }
                forces[i] -= f;
                forces[j] += f;
            }
        }

        for f in forces.iter_mut() {
            f.x += jitter(&mut self.rng, cfg.wander);
            f.y += jitter(&mut self.rng, cfg.wander);
        }

        integrate(&mut self.scene.nodes, &forces, cfg.damping, dt);
        true
    }

    fn scene(&self) -> &TopicScene { &self.scene }
    fn scene_mut(&mut self) -> &mut TopicScene { &mut self.scene }
    fn converges(&self) -> bool { false }
}

/// Clustered-rectangle topic map: islands push apart, drift toward the
/// centre and stop once velocities decay below the settle threshold.
pub struct IslandSimulation {
    scene: TopicScene,
    cfg: IslandConfig,
    center: Pos2,
    ticks: usize,
    settled: bool,
}

impl IslandSimulation {
    pub fn new(scene: TopicScene, cfg: IslandConfig, center: Pos2) -> Self {
        Self { scene, cfg, center, ticks: 0, settled: false }
    }

    pub fn is_settled(&self) -> bool { self.settled }

    pub fn ticks(&self) -> usize { self.ticks }
}

impl Simulation for IslandSimulation {
    fn tick(&mut self, dt: f32) -> bool {
        if self.settled {
            return false;
        }
        let n = self.scene.nodes.len();
        let mut forces = vec![Vec2::ZERO; n];
        let cfg = &self.cfg;

        for i in 0..n {
            for j in (i + 1)..n {
                let (a, b) = (&self.scene.nodes[i], &self.scene.nodes[j]);
                let (dir, dist) = separation(a.pos, b.pos);
                // Comfortable spacing grows with both islands' diagonals
                let diag = (a.size.length() + b.size.length()) * 0.5;
                let wanted = diag + cfg.padding;
                if dist < wanted {
                    let f = dir * (cfg.repulsion * diag * (wanted - dist) / wanted);
                    forces[i] -= f;
                    forces[j] += f;
                }
            }
        }
        for (node, f) in self.scene.nodes.iter().zip(forces.iter_mut()) {
            *f += (self.center - node.pos) * cfg.center_pull;
        }

        let fastest = integrate(&mut self.scene.nodes, &forces, cfg.damping, dt);
        self.ticks += 1;
        if fastest < cfg.settle_threshold || self.ticks >= cfg.max_ticks {
            self.settled = true;
            for node in &mut self.scene.nodes {
                node.vel = Vec2::ZERO;
            }
        }
        !self.settled
    }

    fn scene(&self) -> &TopicScene { &self.scene }
    fn scene_mut(&mut self) -> &mut TopicScene { &mut self.scene }
    fn converges(&self) -> bool { true }

    fn reheat(&mut self) {
        self.settled = false;
        self.ticks = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::topics::SceneNodeKind;

    fn island(label: &str, pos: Pos2) -> SceneNode {
        SceneNode {
            label: label.into(),
            kind: SceneNodeKind::Topic { cluster: 0, conversations: vec![] },
            pos,
            vel: Vec2::ZERO,
            radius: 40.0,
            size: Vec2::new(120.0, 60.0),
            pinned: false,
        }
    }

    #[test]
    fn islands_separate_and_settle() {
        let scene = TopicScene {
            nodes: vec![island("a", Pos2::new(0.0, 0.0)), island("b", Pos2::new(5.0, 0.0))],
            links: vec![],
        };
        let mut sim = IslandSimulation::new(scene, IslandConfig::default(), Pos2::ZERO);
        let mut steps = 0;
        while sim.tick(1.0 / 60.0) {
            steps += 1;
            assert!(steps <= IslandConfig::default().max_ticks);
        }
        assert!(sim.is_settled());
        assert!(!sim.tick(1.0 / 60.0), "settled simulation stays quiet");
        let a = sim.scene().nodes[0].pos;
        let b = sim.scene().nodes[1].pos;
        assert!(a.distance(b) > 5.0, "islands pushed apart");
    }

    #[test]
    fn star_keeps_moving_and_respects_pins() {
        let mut scene = TopicScene::default();
        scene.nodes.push(SceneNode {
            label: "topic".into(),
            kind: SceneNodeKind::Topic { cluster: 0, conversations: vec![1] },
            pos: Pos2::new(100.0, 0.0),
            vel: Vec2::ZERO,
            radius: 20.0,
            size: Vec2::splat(40.0),
            pinned: true,
        });
        scene.nodes.push(SceneNode {
            label: "chat".into(),
            kind: SceneNodeKind::Conversation { cluster: 0, branched: false },
            pos: Pos2::new(300.0, 0.0),
            vel: Vec2::ZERO,
            radius: 5.0,
            size: Vec2::splat(10.0),
            pinned: false,
        });
        scene.links.push((0, 1));
        let mut sim = StarSimulation::with_seed(scene, StarConfig::default(), 7);
        for _ in 0..500 {
            assert!(sim.tick(1.0 / 60.0));
        }
        assert_eq!(sim.scene().nodes[0].pos, Pos2::new(100.0, 0.0));
        let d = sim.scene().nodes[0].pos.distance(sim.scene().nodes[1].pos);
        assert!(d < 200.0, "link pulled the conversation in (d={})", d);
    }

    #[test]
    fn negative_jitter_settings_are_tolerated() {
        let mut rng = StdRng::seed_from_u64(3);
        for amount in [-12.0, 0.0, f32::NAN, f32::INFINITY] {
            let j = jitter(&mut rng, amount);
            assert!(j.abs() <= 12.0, "{} from {}", j, amount);
        }

        let cfg = StarConfig { wander: -5.0, ..StarConfig::default() };
        let mut scene = TopicScene::default();
        scene.nodes.push(island("lone", Pos2::ZERO));
        let mut sim = StarSimulation::with_seed(scene, cfg, 1);
        assert!(sim.tick(1.0 / 60.0));
        assert!(sim.scene().nodes[0].pos.x.is_finite());
    }
}
