//! Canvas <-> screen transform.
//!
//! `screen = canvas * scale + translate`. The viewport never touches node
//! positions; it only decides where the canvas appears on screen.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use egui::{Pos2, Rect, Vec2};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::ViewportConfig;
use crate::layout::LayoutMode;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnimationHandle(pub u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AnimationEvent {
    Completed(AnimationHandle),
    Superseded(AnimationHandle),
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CenterTarget {
    Point(Pos2),
    Bounds(Rect),
}

#[derive(Clone, Debug)]
struct Animation {
    handle: AnimationHandle,
    from_scale: f32,
    from_translate: Vec2,
    to_scale: f32,
    to_translate: Vec2,
    started: Instant,
    duration: Duration,
}

/// Persisted part of the viewport.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    pub scale: f32,
    pub translate: [f32; 2],
}

impl Default for ViewState {
    fn default() -> Self { Self { scale: 1.0, translate: [0.0, 0.0] } }
}

pub fn ease_in_out_cubic(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    if t < 0.5 { 4.0 * t * t * t } else { 1.0 - (-2.0 * t + 2.0).powi(3) / 2.0 }
}

#[derive(Clone, Debug)]
pub struct Viewport {
    scale: f32,
    translate: Vec2,
    mode: LayoutMode,
    cfg: ViewportConfig,
    animation: Option<Animation>,
    events: VecDeque<AnimationEvent>,
    next_handle: u64,
}

impl Viewport {
    pub fn new(cfg: ViewportConfig) -> Self {
        Self {
            scale: 1.0,
            translate: Vec2::ZERO,
            mode: LayoutMode::Tree,
            cfg,
            animation: None,
            events: VecDeque::new(),
            next_handle: 1,
        }
    }

    pub fn scale(&self) -> f32 { self.scale }
    pub fn translate(&self) -> Vec2 { self.translate }
    pub fn mode(&self) -> LayoutMode { self.mode }
    pub fn config(&self) -> &ViewportConfig { &self.cfg }
    pub fn is_animating(&self) -> bool { self.animation.is_some() }

    pub fn scale_bounds(&self) -> (f32, f32) {
        match self.mode {
            LayoutMode::Tree => (self.cfg.tree_min_scale, self.cfg.tree_max_scale),
            LayoutMode::Star | LayoutMode::Island => (self.cfg.topic_min_scale, self.cfg.topic_max_scale),
        }
    }

    fn clamp_scale(&self, s: f32) -> f32 {
        let (lo, hi) = self.scale_bounds();
        if s.is_finite() { s.clamp(lo, hi) } else { lo }
    }

    pub fn state(&self) -> ViewState {
        ViewState { scale: self.scale, translate: [self.translate.x, self.translate.y] }
    }

    pub fn restore(&mut self, state: ViewState) {
        self.scale = self.clamp_scale(state.scale);
        self.translate = Vec2::new(state.translate[0], state.translate[1]);
    }

    pub fn set_mode(&mut self, mode: LayoutMode) {
        self.mode = mode;
        self.scale = self.clamp_scale(self.scale);
    }

    pub fn screen_to_canvas(&self, p: Pos2) -> Pos2 {
        ((p.to_vec2() - self.translate) / self.scale).to_pos2()
    }

    pub fn canvas_to_screen(&self, p: Pos2) -> Pos2 {
        (p.to_vec2() * self.scale + self.translate).to_pos2()
    }

    pub fn canvas_rect_to_screen(&self, r: Rect) -> Rect {
        Rect::from_min_max(self.canvas_to_screen(r.min), self.canvas_to_screen(r.max))
    }

    /// Zoom by `factor` keeping the canvas point under `screen_point` fixed.
    /// User input takes over from any running animation.
    pub fn zoom_at(&mut self, screen_point: Pos2, factor: f32) {
        self.interrupt();
        let anchor = self.screen_to_canvas(screen_point);
        let new_scale = self.clamp_scale(self.scale * factor);
        self.translate -= anchor.to_vec2() * (new_scale - self.scale);
        self.scale = new_scale;
    }

    pub fn pan(&mut self, delta: Vec2) {
        self.interrupt();
        self.translate += delta * self.cfg.pan_sensitivity;
    }

    // Manual input cancels an animation silently
    fn interrupt(&mut self) {
        self.animation = None;
    }

    fn target_transform(&self, target: CenterTarget, target_scale: Option<f32>, viewport: Vec2) -> (f32, Vec2) {
        match target {
            CenterTarget::Point(p) => {
                let s = self.clamp_scale(target_scale.unwrap_or(self.scale));
                (s, viewport * 0.5 - p.to_vec2() * s)
            }
            CenterTarget::Bounds(r) => {
                let (s, t) = self.fit_transform(r, viewport, self.cfg.fit_padding);
                match target_scale {
                    Some(forced) => {
                        let s = self.clamp_scale(forced);
                        (s, viewport * 0.5 - r.center().to_vec2() * s)
                    }
                    None => (s, t),
                }
            }
        }
    }

    /// Start an animated move. A request while another animation runs
    /// supersedes it; the old handle is reported through `tick`.
    pub fn center_on(&mut self, target: CenterTarget, target_scale: Option<f32>, viewport: Vec2, now: Instant) -> AnimationHandle {
        if let Some(old) = self.animation.take() {
            self.events.push_back(AnimationEvent::Superseded(old.handle));
        }
        let handle = AnimationHandle(self.next_handle);
        self.next_handle += 1;
        let (to_scale, to_translate) = self.target_transform(target, target_scale, viewport);
        self.animation = Some(Animation {
            handle,
            from_scale: self.scale,
            from_translate: self.translate,
            to_scale,
            to_translate,
            started: now,
            duration: Duration::from_millis(self.cfg.animation_ms),
        });
        handle
    }

    /// Advance the running animation. Returns at most one event per call;
    /// a supersede notice is delivered before the newer animation's result.
    pub fn tick(&mut self, now: Instant) -> Option<AnimationEvent> {
        if let Some(ev) = self.events.pop_front() {
            self.step(now);
            return Some(ev);
        }
        self.step(now)
    }

    fn step(&mut self, now: Instant) -> Option<AnimationEvent> {
        let anim = self.animation.as_ref()?;
        let elapsed = now.saturating_duration_since(anim.started);
        let t = if anim.duration.is_zero() { 1.0 } else { elapsed.as_secs_f32() / anim.duration.as_secs_f32() };
        let e = ease_in_out_cubic(t);
        self.scale = anim.from_scale + (anim.to_scale - anim.from_scale) * e;
        self.translate = anim.from_translate + (anim.to_translate - anim.from_translate) * e;
        if t >= 1.0 {
            self.scale = anim.to_scale;
            self.translate = anim.to_translate;
            let handle = anim.handle;
            self.animation = None;
            return Some(AnimationEvent::Completed(handle));
        }
        None
    }

    /// Stop where we are. Cancellation is not an error and emits no event.
    pub fn cancel_animation(&mut self) -> Option<AnimationHandle> {
        let handle = self.animation.take().map(|a| a.handle);
        if let Some(h) = handle {
            debug!("animation {:?} cancelled", h);
        }
        handle
    }

    /// Scale and translate that fit `bounds` (plus padding) into the viewport
    /// without exceeding the mode's zoom bounds.
    pub fn fit_transform(&self, bounds: Rect, viewport: Vec2, padding: f32) -> (f32, Vec2) {
        let padded = bounds.expand(padding);
        let w = padded.width().max(1.0);
        let h = padded.height().max(1.0);
        let s = self.clamp_scale((viewport.x / w).min(viewport.y / h));
        (s, viewport * 0.5 - padded.center().to_vec2() * s)
    }

    pub fn fit_to_bounds(&mut self, bounds: Rect, viewport: Vec2, padding: f32) {
        self.interrupt();
        let (s, t) = self.fit_transform(bounds, viewport, padding);
        self.scale = s;
        self.translate = t;
    }

    pub fn set_transform(&mut self, scale: f32, translate: Vec2) {
        self.interrupt();
        self.scale = self.clamp_scale(scale);
        self.translate = translate;
    }

    pub fn visible_canvas_rect(&self, viewport: Vec2) -> Rect {
        Rect::from_min_max(self.screen_to_canvas(Pos2::ZERO), self.screen_to_canvas(viewport.to_pos2()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Pos2, b: Pos2) -> bool { (a - b).length() < 1e-3 }

    #[test]
    fn screen_and_canvas_are_inverses() {
        let mut v = Viewport::new(ViewportConfig::default());
        v.set_transform(1.7, Vec2::new(-120.0, 44.0));
        for p in [Pos2::new(0.0, 0.0), Pos2::new(512.0, -33.0), Pos2::new(-900.0, 1200.5)] {
            assert!(approx(v.canvas_to_screen(v.screen_to_canvas(p)), p));
            assert!(approx(v.screen_to_canvas(v.canvas_to_screen(p)), p));
        }
    }

    #[test]
    fn zoom_keeps_anchor_fixed_and_clamps() {
        let mut v = Viewport::new(ViewportConfig::default());
        v.set_transform(0.8, Vec2::new(30.0, -10.0));
        let anchor = Pos2::new(400.0, 300.0);
        let before = v.screen_to_canvas(anchor);
        v.zoom_at(anchor, 1.5);
        assert!(approx(v.screen_to_canvas(anchor), before));

        v.zoom_at(anchor, 1000.0);
        assert_eq!(v.scale(), 4.0);
        assert!(approx(v.screen_to_canvas(anchor), before));

        v.set_mode(LayoutMode::Star);
        assert_eq!(v.scale(), 2.5);
    }

    #[test]
    fn newer_center_supersedes_older() {
        let mut v = Viewport::new(ViewportConfig::default());
        let t0 = Instant::now();
        let size = Vec2::new(800.0, 600.0);
        let first = v.center_on(CenterTarget::Point(Pos2::new(1000.0, 0.0)), None, size, t0);
        let second = v.center_on(CenterTarget::Point(Pos2::new(0.0, 1000.0)), Some(1.0), size, t0);
        assert_eq!(v.tick(t0 + Duration::from_millis(10)), Some(AnimationEvent::Superseded(first)));
        assert_eq!(v.tick(t0 + Duration::from_millis(100)), None);
        assert_eq!(v.tick(t0 + Duration::from_millis(500)), Some(AnimationEvent::Completed(second)));
        assert!(approx(v.canvas_to_screen(Pos2::new(0.0, 1000.0)), Pos2::new(400.0, 300.0)));
    }

    #[test]
    fn cancel_is_silent() {
        let mut v = Viewport::new(ViewportConfig::default());
        let t0 = Instant::now();
        let h = v.center_on(CenterTarget::Point(Pos2::new(10.0, 10.0)), None, Vec2::splat(100.0), t0);
        assert_eq!(v.cancel_animation(), Some(h));
        assert_eq!(v.tick(t0 + Duration::from_secs(1)), None);
    }

    #[test]
    fn easing_endpoints() {
        assert_eq!(ease_in_out_cubic(0.0), 0.0);
        assert_eq!(ease_in_out_cubic(1.0), 1.0);
        assert!((ease_in_out_cubic(0.5) - 0.5).abs() < 1e-6);
    }
}
