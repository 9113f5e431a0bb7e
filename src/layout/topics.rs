//! Topic-map scenes built from the analytics payload.
//!
//! A scene is its own small arena of topic and conversation nodes; the
//! force simulations in `layout::force` only ever touch `pos`/`vel`.

use std::collections::{BTreeMap, HashSet};
use std::f32::consts::{PI, TAU};

use egui::{Pos2, Rect, Vec2};
use rand::Rng;

use crate::config::{IslandConfig, StarConfig};
use crate::services::analytics::VisualizationData;

#[derive(Clone, Debug, PartialEq)]
pub enum SceneNodeKind {
    Topic { cluster: i64, conversations: Vec<usize> },
    Conversation { cluster: i64, branched: bool },
}

#[derive(Clone, Debug)]
pub struct SceneNode {
    pub label: String,
    pub kind: SceneNodeKind,
    pub pos: Pos2,
    pub vel: Vec2,
    // Collision radius (star) or half-extent (islands)
    pub radius: f32,
    pub size: Vec2,
    // Topic anchors in star mode and dragged nodes ignore simulation forces
    pub pinned: bool,
}

impl SceneNode {
    pub fn is_topic(&self) -> bool { matches!(self.kind, SceneNodeKind::Topic { .. }) }

    pub fn rect(&self) -> Rect { Rect::from_center_size(self.pos, self.size) }
}

#[derive(Clone, Debug, Default)]
pub struct TopicScene {
    pub nodes: Vec<SceneNode>,
    // (topic index, conversation index)
    pub links: Vec<(usize, usize)>,
}

struct TopicGroup {
    cluster: i64,
    label: String,
    members: Vec<usize>,
}

fn group_topics(data: &VisualizationData) -> Vec<TopicGroup> {
    let mut by_cluster: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (i, c) in data.clusters.iter().enumerate() {
        by_cluster.entry(*c).or_default().push(i);
    }
    by_cluster
        .into_iter()
        .map(|(cluster, members)| {
            let label = data
                .topics
                .get(&cluster.to_string())
                .map(|t| t.topic.clone())
                .unwrap_or_else(|| if cluster < 0 { "Unclustered".to_string() } else { format!("Topic {}", cluster) });
            TopicGroup { cluster, label, members }
        })
        .collect()
}

/// Uniform offset in `[-amount, amount]`. Negative amounts count by magnitude;
/// non-finite or zero amounts give no offset.
pub fn jitter<R: Rng>(rng: &mut R, amount: f32) -> f32 {
    let a = amount.abs();
    if a.is_finite() && a > 0.0 { rng.gen_range(-a..=a) } else { 0.0 }
}

/// Angle and radius of slot `i` on a star polygon with `points` tips.
/// Tips come first, then the inner vertices; further topics wrap onto a
/// larger copy of the star.
pub fn star_slot(i: usize, points: usize, radius: f32, inner_ratio: f32) -> (f32, f32) {
    let points = points.max(2);
    let ring = i / (2 * points);
    let k = i % (2 * points);
    let (vertex, inner) = if k < points { (2 * k, false) } else { (2 * (k - points) + 1, true) };
    let angle = vertex as f32 * PI / points as f32 - PI / 2.0;
    let base = if inner { radius * inner_ratio } else { radius };
    (angle, base * (1.0 + ring as f32 * 0.6))
}

impl TopicScene {
    /// Star scene: topics pinned at the star's vertices, conversations
    /// scattered around their topic's angle.
    pub fn star<R: Rng>(data: &VisualizationData, cfg: &StarConfig, rng: &mut R) -> Self {
        let branched: HashSet<&str> = data.chats_with_reflections.iter().map(|s| s.as_str()).collect();
        let mut scene = TopicScene::default();
        for (i, group) in group_topics(data).into_iter().enumerate() {
            let (angle, r) = star_slot(i, cfg.points, cfg.radius, cfg.inner_ratio);
            let topic_idx = scene.nodes.len();
            scene.nodes.push(SceneNode {
                label: group.label,
                kind: SceneNodeKind::Topic { cluster: group.cluster, conversations: group.members.clone() },
                pos: Pos2::new(r * angle.cos(), r * angle.sin()),
                vel: Vec2::ZERO,
                radius: cfg.topic_radius,
                size: Vec2::splat(cfg.topic_radius * 2.0),
                pinned: true,
            });
            for m in group.members {
                let a = angle + jitter(rng, cfg.jitter_angle);
                let rr = (r + jitter(rng, cfg.jitter_radius)).max(cfg.topic_radius);
                let title = data.titles.get(m).cloned().unwrap_or_default();
                let is_branched = branched.contains(title.as_str());
                let idx = scene.nodes.len();
                scene.nodes.push(SceneNode {
                    label: title,
                    kind: SceneNodeKind::Conversation { cluster: group.cluster, branched: is_branched },
                    pos: Pos2::new(rr * a.cos(), rr * a.sin()),
                    vel: Vec2::ZERO,
                    radius: cfg.leaf_radius,
                    size: Vec2::splat(cfg.leaf_radius * 2.0),
                    pinned: false,
                });
                scene.links.push((topic_idx, idx));
            }
        }
        scene
    }

    /// Island scene: one rectangle per topic listing its conversations,
    /// seeded at the mean embedding position of its members.
    pub fn islands(data: &VisualizationData, cfg: &IslandConfig, center: Pos2) -> Self {
        let branched: HashSet<&str> = data.chats_with_reflections.iter().map(|s| s.as_str()).collect();
        let groups = group_topics(data);
        let n = groups.len().max(1) as f32;
        let mut scene = TopicScene::default();
        for (i, group) in groups.into_iter().enumerate() {
            let longest = group
                .members
                .iter()
                .filter_map(|m| data.titles.get(*m))
                .map(|t| t.chars().count())
                .chain(std::iter::once(group.label.chars().count()))
                .max()
                .unwrap_or(0);
            let badges = group
                .members
                .iter()
                .filter(|m| data.titles.get(**m).map(|t| branched.contains(t.as_str())).unwrap_or(false))
                .count();
            let width = longest as f32 * cfg.glyph_width
                + cfg.padding * 2.0
                + if badges > 0 { cfg.branch_badge_width } else { 0.0 };
            let rows = group.members.len() + 1;
            let height = rows as f32 * cfg.row_height + cfg.padding * 2.0;

            let mean = mean_point(&data.points, &group.members);
            // Spread on a ring when the payload carries no usable coordinates
            let pos = match mean {
                Some(p) => center + p.to_vec2(),
                None => {
                    let a = i as f32 * TAU / n;
                    center + Vec2::new(a.cos(), a.sin()) * 200.0
                }
            };
            scene.nodes.push(SceneNode {
                label: group.label,
                kind: SceneNodeKind::Topic { cluster: group.cluster, conversations: group.members },
                pos,
                vel: Vec2::ZERO,
                radius: width.max(height) * 0.5,
                size: Vec2::new(width, height),
                pinned: false,
            });
        }
        scene
    }

    pub fn bounds(&self) -> Option<Rect> {
        self.nodes.iter().map(|n| n.rect()).reduce(|a, b| a.union(b))
    }

    // Case-insensitive label filter; topics match if any member matches
    pub fn matching(&self, query: &str, titles: &[String]) -> Vec<usize> {
        let q = query.trim().to_lowercase();
        if q.is_empty() {
            return Vec::new();
        }
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| {
                n.label.to_lowercase().contains(&q)
                    || match &n.kind {
                        SceneNodeKind::Topic { conversations, .. } => conversations
                            .iter()
                            .filter_map(|c| titles.get(*c))
                            .any(|t| t.to_lowercase().contains(&q)),
                        SceneNodeKind::Conversation { .. } => false,
                    }
            })
            .map(|(i, _)| i)
            .collect()
    }
}

fn mean_point(points: &[[f32; 2]], members: &[usize]) -> Option<Pos2> {
    let picked: Vec<&[f32; 2]> = members.iter().filter_map(|m| points.get(*m)).collect();
    if picked.is_empty() {
        return None;
    }
    let n = picked.len() as f32;
    let (sx, sy) = picked.iter().fold((0.0, 0.0), |(x, y), p| (x + p[0], y + p[1]));
    Some(Pos2::new(sx / n * 100.0, sy / n * 100.0))
}
