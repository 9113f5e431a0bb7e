use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use eframe::egui::{self, Color32, Pos2, Rect, Sense, Stroke, Vec2};
use log::{info, warn};

use crate::api::{self, ApiRequest};
use crate::commands;
use crate::graph_utils::graph::{Node, NodeId, NodeKind, NodePatch, Role};
use crate::layout::LayoutMode;
use crate::layout::topics::SceneNodeKind;
use crate::navigation::Direction;
use crate::persistence::persist::{self, AppStateFile};
use crate::persistence::settings::AppSettings;
use crate::services::worker::{ServiceWorker, Services};
use crate::session::CanvasSession;

const AUTOSAVE_AFTER: Duration = Duration::from_secs(2);

// Style for toast notifications
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum NoticeStyle {
    Subtle,
    Prominent,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DragTarget {
    Card(NodeId),
    Scene(usize),
}

// What a click on the canvas asked for; applied once drawing is done
enum CanvasAction {
    Select(NodeId, Option<usize>),
    ToggleExpanded(NodeId),
    DragCard(NodeId, Vec2),
    DragScene(usize, Vec2),
    ReleaseScene(usize),
    OpenConversation(String),
}

pub struct CanvasApp {
    session: CanvasSession,
    app_settings: AppSettings,
    dragging: Option<DragTarget>,
    // persistence
    dirty: bool,
    last_change: Instant,
    save_error: Option<String>,
    last_info: Option<(String, Instant, NoticeStyle)>,
    show_load_versions: bool,
    // panels and windows
    sidebar_open: bool,
    show_chats_window: bool,
    show_branched_window: bool,
    show_prefs_window: bool,
    prefs_edit: AppSettings,
    prefs_status: Option<String>,
    // text buffers
    search_text: String,
    composer: String,
    title_edit: Option<(NodeId, String)>,
    // topic map requested before its data arrived
    pending_layout: Option<LayoutMode>,
    pending_import: Option<String>,
    // API server runtime
    api_rx: Option<Receiver<ApiRequest>>,
    api_running: bool,
    last_frame: Instant,
}

fn spawn_worker(settings: &AppSettings) -> anyhow::Result<ServiceWorker> {
    let services = Services::from_settings(settings)?;
    ServiceWorker::spawn(services)
}

impl CanvasApp {
    pub fn new(app_settings: AppSettings, state: Option<AppStateFile>) -> Self {
        let mut session = CanvasSession::from_settings(&app_settings, "New conversation");
        if let Some(state) = state {
            if let Err(e) = session.restore(state) {
                warn!("could not restore the last session: {}", e);
            }
        }
        match spawn_worker(&app_settings) {
            Ok(w) => session.attach_worker(w),
            Err(e) => warn!("backend services unavailable: {}", e),
        }
        let mut app = Self {
            session,
            prefs_edit: app_settings.clone(),
            app_settings,
            dragging: None,
            dirty: false,
            last_change: Instant::now(),
            save_error: None,
            last_info: None,
            show_load_versions: false,
            sidebar_open: true,
            show_chats_window: false,
            show_branched_window: false,
            show_prefs_window: false,
            prefs_status: None,
            search_text: String::new(),
            composer: String::new(),
            title_edit: None,
            pending_layout: None,
            pending_import: None,
            api_rx: Some(api::init_broker()),
            api_running: false,
            last_frame: Instant::now(),
        };
        if app.app_settings.api_enabled {
            app.start_api();
        }
        app
    }

    fn start_api(&mut self) {
        match api::server::start_server(&self.app_settings) {
            Ok(()) => {
                self.api_running = true;
                info!("control API enabled on {}", self.app_settings.api_endpoint());
            }
            Err(e) => self.save_error = Some(format!("API start failed: {}", e)),
        }
    }

    fn stop_api(&mut self) {
        api::server::stop_server();
        self.api_running = false;
    }

    fn notify(&mut self, msg: impl Into<String>, style: NoticeStyle) {
        self.last_info = Some((msg.into(), Instant::now(), style));
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.last_change = Instant::now();
    }

    fn save_now_with(&mut self, style: NoticeStyle) {
        match persist::save_active(&self.session.snapshot()) {
            Ok(path) => {
                self.dirty = false;
                self.save_error = None;
                self.notify(format!("Saved to {}", path.display()), style);
            }
            Err(e) => self.save_error = Some(format!("Save failed: {}", e)),
        }
    }

    fn save_versioned_now(&mut self) {
        match persist::save_versioned(&self.session.snapshot()) {
            Ok(path) => {
                self.save_error = None;
                self.notify(format!("Saved version {}", path.display()), NoticeStyle::Prominent);
            }
            Err(e) => self.save_error = Some(format!("Save version failed: {}", e)),
        }
    }

    fn restore_state(&mut self, state: AppStateFile, label: &str) {
        match self.session.restore(state) {
            Ok(()) => {
                self.dirty = false;
                self.dragging = None;
                self.title_edit = None;
                self.save_error = None;
                self.notify(format!("Loaded {}", label), NoticeStyle::Prominent);
            }
            Err(e) => self.save_error = Some(format!("Load failed: {}", e)),
        }
    }

    pub fn menu_load_latest(&mut self) {
        match persist::load_active() {
            Ok(Some(state)) => self.restore_state(state, "latest state"),
            Ok(None) => self.save_error = Some("No active state file found".into()),
            Err(e) => self.save_error = Some(format!("Load failed: {}", e)),
        }
    }

    pub fn menu_new_conversation(&mut self) {
        if self.session.graph().len() > 1 || self.session.graph().nodes().any(|n| !n.messages.is_empty()) {
            self.save_versioned_now();
        }
        let fresh = CanvasSession::from_settings(&self.app_settings, "New conversation");
        let old = std::mem::replace(&mut self.session, fresh);
        if let Some(w) = old.into_worker() {
            self.session.attach_worker(w);
        }
        self.dragging = None;
        self.title_edit = None;
        self.mark_dirty();
        self.notify("Started a new conversation", NoticeStyle::Prominent);
    }

    fn export_json(&mut self) {
        let stamp = time::OffsetDateTime::now_utc()
            .format(time::macros::format_description!("[year][month][day]_[hour][minute][second]"))
            .unwrap_or_else(|_| "now".into());
        let dir = self.app_settings.export_dir();
        let path = dir.join(format!("conversation_{}.json", stamp));
        let res = std::fs::create_dir_all(&dir)
            .map_err(anyhow::Error::from)
            .and_then(|_| Ok(serde_json::to_vec_pretty(&self.session.serialize_graph())?))
            .and_then(|bytes| Ok(std::fs::write(&path, bytes)?));
        match res {
            Ok(()) => self.notify(format!("Exported {}", path.display()), NoticeStyle::Prominent),
            Err(e) => self.save_error = Some(format!("Export failed: {}", e)),
        }
    }

    fn switch_layout(&mut self, mode: LayoutMode) {
        if mode.is_topic_map() && self.session.topic_data().is_none() {
            match self.session.fetch_topics() {
                Ok(_) => {
                    self.pending_layout = Some(mode);
                    self.notify("Loading topics…", NoticeStyle::Subtle);
                }
                Err(e) => self.session.show_error(&e, None),
            }
            return;
        }
        self.pending_layout = None;
        if let Err(e) = self.session.set_layout_mode(mode) {
            self.session.show_error(&e, None);
        }
    }

    fn open_conversation(&mut self, title: String) {
        if self.session.branched_chats().contains_key(&title) {
            if let Err(e) = self.session.import_branched_chat(&title) {
                self.session.show_error(&e, None);
            } else {
                self.mark_dirty();
            }
        } else {
            match self.session.fetch_branched_chats() {
                Ok(_) => self.pending_import = Some(title),
                Err(e) => self.session.show_error(&e, None),
            }
        }
    }

    // Results that arrived for requests made in earlier frames
    fn settle_pending(&mut self) {
        if let Some(mode) = self.pending_layout {
            if self.session.topic_data().is_some() {
                self.switch_layout(mode);
            } else if !self.session.has_pending_jobs() {
                self.pending_layout = None;
            }
        }
        if let Some(title) = self.pending_import.clone() {
            if self.session.branched_chats().contains_key(&title) {
                self.pending_import = None;
                self.open_conversation(title);
            } else if !self.session.has_pending_jobs() {
                self.pending_import = None;
                self.notify(format!("'{}' has no branches", title), NoticeStyle::Subtle);
            }
        }
    }

    // Commands from the control API run here, on the thread that owns the session
    fn process_api_requests(&mut self) {
        let Some(rx) = &self.api_rx else { return };
        let log_dir = self.app_settings.api_log_dir();
        let mut handled = 0;
        while handled < 5 {
            let Ok(req) = rx.try_recv() else { break };
            handled += 1;
            if let Some(required) = &self.app_settings.api_key {
                if req.api_key.as_deref() != Some(required.as_str()) {
                    let _ = req.respond_to.send(Err("unauthorized".into()));
                    continue;
                }
            }
            let t0 = Instant::now();
            let res = if req.log {
                commands::execute_and_log(&mut self.session, &req.command, &log_dir)
            } else {
                commands::execute_command(&mut self.session, &req.command)
            };
            log::debug!(
                "API RID={} done mutated={} dt_ms={}",
                req.request_id,
                res.as_ref().map(|o| o.mutated).unwrap_or(false),
                t0.elapsed().as_millis()
            );
            let _ = req.respond_to.send(res.map_err(|e| e.to_string()));
        }
    }

    fn handle_keys(&mut self, ctx: &egui::Context) {
        let cmd = |k| egui::KeyboardShortcut::new(egui::Modifiers::COMMAND, k);
        if ctx.input_mut(|i| i.consume_shortcut(&egui::KeyboardShortcut::new(egui::Modifiers::COMMAND | egui::Modifiers::SHIFT, egui::Key::S))) {
            self.save_versioned_now();
        }
        if ctx.input_mut(|i| i.consume_shortcut(&cmd(egui::Key::S))) {
            self.save_now_with(NoticeStyle::Prominent);
        }
        if ctx.input_mut(|i| i.consume_shortcut(&cmd(egui::Key::O))) {
            self.menu_load_latest();
        }
        if ctx.input_mut(|i| i.consume_shortcut(&cmd(egui::Key::N))) {
            self.menu_new_conversation();
        }

        // Arrow keys belong to text fields while one has focus
        if ctx.memory(|m| m.focused().is_some()) {
            return;
        }
        let dirs = [
            (egui::Key::ArrowUp, Direction::Up),
            (egui::Key::ArrowDown, Direction::Down),
            (egui::Key::ArrowLeft, Direction::Left),
            (egui::Key::ArrowRight, Direction::Right),
        ];
        for (key, dir) in dirs {
            if ctx.input(|i| i.key_pressed(key)) {
                if self.session.cursor().is_none() {
                    if let Some(main) = self.session.graph().main_id() {
                        let _ = self.session.select_node(main);
                    }
                } else {
                    self.session.navigate(dir);
                }
            }
        }
        if ctx.input(|i| i.key_pressed(egui::Key::Escape)) {
            if self.session.banner().is_some() {
                self.session.dismiss_banner();
            } else {
                self.session.clear_selection();
            }
        }
        if ctx.input(|i| i.key_pressed(egui::Key::Home)) {
            self.session.recenter();
        }
    }

    fn top_bar(&mut self, ctx: &egui::Context) {
        egui::TopBottomPanel::top("top_bar").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.label(egui::RichText::new("Tangent-Loom").strong());

                ui.menu_button("File", |ui| {
                    if ui.add(egui::Button::new("New conversation").shortcut_text(ctx.format_shortcut(&egui::KeyboardShortcut::new(egui::Modifiers::COMMAND, egui::Key::N)))).clicked() {
                        self.menu_new_conversation();
                        ui.close();
                    }
                    if ui.add(egui::Button::new("Save").shortcut_text(ctx.format_shortcut(&egui::KeyboardShortcut::new(egui::Modifiers::COMMAND, egui::Key::S)))).clicked() {
                        self.save_now_with(NoticeStyle::Prominent);
                        ui.close();
                    }
                    if ui.button("Save version").clicked() {
                        self.save_versioned_now();
                        ui.close();
                    }
                    if ui.button("Load latest").clicked() {
                        self.menu_load_latest();
                        ui.close();
                    }
                    if ui.button("Load version…").clicked() {
                        self.show_load_versions = true;
                        ui.close();
                    }
                    ui.separator();
                    if ui.button("Export JSON").clicked() {
                        self.export_json();
                        ui.close();
                    }
                    if ui.button("Preferences…").clicked() {
                        self.prefs_edit = self.app_settings.clone();
                        self.prefs_status = None;
                        self.show_prefs_window = true;
                        ui.close();
                    }
                });

                ui.menu_button("View", |ui| {
                    let current = self.session.layout_mode();
                    for mode in [LayoutMode::Tree, LayoutMode::Star, LayoutMode::Island] {
                        if ui.selectable_label(current == mode, mode.label()).clicked() {
                            self.switch_layout(mode);
                            ui.close();
                        }
                    }
                    ui.separator();
                    if ui.button("Re-run tree layout").clicked() {
                        self.session.relayout_tree();
                        ui.close();
                    }
                    if ui.button("Recenter").clicked() {
                        self.session.recenter();
                        ui.close();
                    }
                    if ui.button("Refresh topics").clicked() {
                        if let Err(e) = self.session.fetch_topics() {
                            self.session.show_error(&e, None);
                        }
                        ui.close();
                    }
                    ui.checkbox(&mut self.sidebar_open, "Details panel");
                });

                ui.menu_button("Chats", |ui| {
                    if ui.button("Save to backend").clicked() {
                        if let Err(e) = self.session.save_chat() {
                            self.session.show_error(&e, None);
                        }
                        ui.close();
                    }
                    if ui.button("Saved chats…").clicked() {
                        if let Err(e) = self.session.list_chats() {
                            self.session.show_error(&e, None);
                        }
                        self.show_chats_window = true;
                        ui.close();
                    }
                    if ui.button("Branched chats…").clicked() {
                        if let Err(e) = self.session.fetch_branched_chats() {
                            self.session.show_error(&e, None);
                        }
                        self.show_branched_window = true;
                        ui.close();
                    }
                });

                ui.separator();
                let resp = ui.add(egui::TextEdit::singleline(&mut self.search_text).hint_text("Search").desired_width(220.0));
                if resp.changed() {
                    self.session.set_search(&self.search_text, Instant::now());
                }
                if !self.session.search_query().is_empty() {
                    ui.small(format!("{} match(es)", self.session.search_hits().len()));
                }

                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    if self.api_running {
                        ui.small(format!("API {}", self.app_settings.api_endpoint()));
                    }
                    if self.session.has_pending_jobs() {
                        ui.spinner();
                    }
                    ui.small(format!("{:.0}%", self.session.viewport().scale() * 100.0));
                    ui.label(self.session.title());
                });
            });
        });
    }

    fn banner(&mut self, ctx: &egui::Context) {
        let Some(banner) = self.session.banner().cloned() else { return };
        let mut retry = false;
        let mut dismiss = false;
        egui::TopBottomPanel::top("error_banner").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.colored_label(Color32::from_rgb(255, 130, 120), &banner.message);
                if banner.retry.is_some() && ui.button("Retry").clicked() {
                    retry = true;
                }
                if ui.button("Dismiss").clicked() {
                    dismiss = true;
                }
            });
        });
        if retry {
            if let Err(e) = self.session.retry_banner() {
                self.session.show_error(&e, None);
            }
        } else if dismiss {
            self.session.dismiss_banner();
        }
        if let Some(err) = &self.save_error {
            let err = err.clone();
            egui::TopBottomPanel::top("save_error").show(ctx, |ui| {
                ui.colored_label(Color32::from_rgb(255, 180, 80), err);
            });
        }
    }

    fn details_panel(&mut self, ctx: &egui::Context) {
        if !self.sidebar_open || self.session.layout_mode() != LayoutMode::Tree {
            return;
        }
        let Some(cursor) = self.session.cursor() else { return };
        let Some(node) = self.session.graph().get(cursor.node).cloned() else { return };

        let mut branch_from: Option<usize> = None;
        let mut focus_message: Option<usize> = None;
        let mut send = false;
        let mut delete = false;
        let mut regenerate = false;
        let mut stop = false;
        let mut toggle = false;
        let mut rename: Option<String> = None;
        let generating = self.session.is_generating(node.id);

        if self.title_edit.as_ref().map(|(id, _)| *id) != Some(node.id) {
            self.title_edit = Some((node.id, node.title.clone()));
        }

        egui::SidePanel::right("details").resizable(true).default_width(340.0).show(ctx, |ui| {
            if let Some((_, edit)) = &mut self.title_edit {
                let resp = ui.add(egui::TextEdit::singleline(edit).font(egui::TextStyle::Heading));
                if resp.lost_focus() && *edit != node.title {
                    rename = Some(edit.clone());
                }
            }
            ui.horizontal(|ui| {
                ui.small(format!("#{} {:?}", node.id, node.kind));
                if let (Some(p), Some(i)) = (node.parent_id, node.parent_message_index) {
                    ui.small(format!("forked from #{} at message {}", p, i + 1));
                }
            });
            ui.horizontal(|ui| {
                let label = if self.session.is_expanded(node.id) { "Collapse" } else { "Expand" };
                toggle = ui.button(label).clicked();
                delete = ui.add_enabled(node.kind != NodeKind::Main, egui::Button::new("Delete")).clicked();
            });
            ui.separator();

            egui::ScrollArea::vertical().max_height((ui.available_height() - 150.0).max(80.0)).show(ui, |ui| {
                for (i, m) in node.messages.iter().enumerate() {
                    let is_cursor = cursor.message_index == i;
                    let (who, color) = match m.role {
                        Role::User => ("You", Color32::from_rgb(140, 190, 255)),
                        Role::Assistant => ("Assistant", Color32::from_rgb(170, 230, 170)),
                    };
                    let frame = egui::Frame::group(ui.style()).stroke(if is_cursor {
                        Stroke::new(1.5, Color32::from_rgb(255, 200, 80))
                    } else {
                        Stroke::new(0.5, Color32::DARK_GRAY)
                    });
                    frame.show(ui, |ui| {
                        ui.horizontal(|ui| {
                            ui.colored_label(color, who);
                            if ui.small_button("Branch").on_hover_text("Fork the conversation after this message").clicked() {
                                branch_from = Some(i);
                            }
                            if ui.small_button("Focus").clicked() {
                                focus_message = Some(i);
                            }
                        });
                        ui.label(&m.content);
                    });
                }
                if let Some(partial) = &node.streaming_content {
                    egui::Frame::group(ui.style()).show(ui, |ui| {
                        ui.horizontal(|ui| {
                            ui.spinner();
                            ui.colored_label(Color32::from_rgb(170, 230, 170), "Assistant");
                        });
                        ui.label(partial);
                    });
                }
            });

            ui.separator();
            if node.kind == NodeKind::Preview {
                ui.weak("Code preview, read only. Branch from it to continue the conversation.");
                return;
            }
            ui.add(egui::TextEdit::multiline(&mut self.composer).hint_text("Message (Ctrl+Enter to send)").desired_rows(3).desired_width(f32::INFINITY));
            let ctrl_enter = ui.input(|i| i.modifiers.command && i.key_pressed(egui::Key::Enter));
            ui.horizontal(|ui| {
                send = ui.add_enabled(!generating, egui::Button::new("Send")).clicked() || (ctrl_enter && !generating);
                if generating {
                    stop = ui.button("Stop").clicked();
                } else {
                    regenerate = ui
                        .add_enabled(node.messages.last().map(|m| m.role == Role::User).unwrap_or(false), egui::Button::new("Generate"))
                        .clicked();
                }
            });
        });

        if let Some(title) = rename {
            let patch = NodePatch { title: Some(title), ..Default::default() };
            if self.session.update_node(node.id, patch).is_ok() {
                self.mark_dirty();
            }
        }
        if toggle {
            self.session.toggle_expanded(node.id);
        }
        if let Some(i) = focus_message {
            let _ = self.session.select_message(node.id, i);
        }
        if let Some(i) = branch_from {
            if let Err(e) = self.session.create_branch(node.id, i, None) {
                self.session.show_error(&e, None);
            }
        }
        if send && !self.composer.trim().is_empty() {
            match self.session.send_message(node.id, &self.composer) {
                Ok(_) => self.composer.clear(),
                Err(e) => self.session.show_error(&e, None),
            }
        }
        if regenerate {
            if let Err(e) = self.session.regenerate(node.id) {
                self.session.show_error(&e, None);
            }
        }
        if stop {
            self.session.stop_generation(node.id);
        }
        if delete {
            if let Err(e) = self.session.delete_node(node.id) {
                self.session.show_error(&e, None);
            }
            self.title_edit = None;
        }
    }

    fn canvas(&mut self, ctx: &egui::Context) {
        let frame = egui::Frame::central_panel(&ctx.style()).fill(Color32::from_rgb(22, 23, 28));
        egui::CentralPanel::default().frame(frame).show(ctx, |ui| {
            let available = ui.available_rect_before_wrap();
            self.session.set_viewport_size(available.size());
            let bg = ui.allocate_rect(available, Sense::click_and_drag());

            if bg.hovered() {
                let scroll = ui.input(|i| i.raw_scroll_delta.y);
                if scroll != 0.0 {
                    if let Some(p) = ui.input(|i| i.pointer.hover_pos()) {
                        let factor = (1.0 + scroll * 0.001).clamp(0.9, 1.1);
                        self.session.viewport_mut().zoom_at((p - available.min).to_pos2(), factor);
                    }
                }
            }

            let painter = ui.painter_at(available);
            let actions = match self.session.layout_mode() {
                LayoutMode::Tree => self.draw_tree(ui, &painter, available),
                LayoutMode::Star | LayoutMode::Island => self.draw_topics(ui, &painter, available),
            };
            let acted = !actions.is_empty();
            self.apply_canvas_actions(actions);

            if self.dragging.is_none() {
                let delta = bg.drag_delta();
                if delta != Vec2::ZERO {
                    self.session.viewport_mut().pan(delta);
                }
            }
            if bg.clicked() && !acted {
                self.session.clear_selection();
            }
        });
    }

    fn draw_tree(&mut self, ui: &mut egui::Ui, painter: &egui::Painter, available: Rect) -> Vec<CanvasAction> {
        let mut actions = Vec::new();
        let vp = self.session.viewport();
        let (scale, translate, origin) = (vp.scale(), vp.translate(), available.min.to_vec2());
        let to_screen = move |p: Pos2| Pos2::new(p.x * scale + translate.x + origin.x, p.y * scale + translate.y + origin.y);
        let geometry = self.session.config().geometry.clone();
        let graph = self.session.graph();
        let cursor = self.session.cursor();
        let hits = self.session.search_hits();

        // Edges leave the parent at the fork message and enter the child's header
        let edge_stroke = Stroke::new((1.5 * scale).clamp(0.8, 2.5), Color32::from_rgb(110, 115, 130));
        for node in graph.nodes() {
            let Some(parent) = node.parent_id.and_then(|p| graph.get(p)) else { continue };
            let expanded = self.session.is_expanded(parent.id);
            let from = if expanded {
                let a = geometry.message_anchor(parent, node.parent_message_index.unwrap_or(0));
                Pos2::new(parent.x + geometry.width, a.y)
            } else {
                Pos2::new(parent.x + geometry.width, parent.y + geometry.header_height * 0.5)
            };
            let to = Pos2::new(node.x, node.y + geometry.header_height * 0.5);
            let (a, b) = (to_screen(from), to_screen(to));
            if !available.intersects(Rect::from_two_pos(a, b)) {
                continue;
            }
            let dx = (b.x - a.x).abs().max(20.0) * 0.5;
            let curve = egui::epaint::CubicBezierShape::from_points_stroke(
                [a, a + Vec2::new(dx, 0.0), b - Vec2::new(dx, 0.0), b],
                false,
                Color32::TRANSPARENT,
                edge_stroke,
            );
            painter.add(curve);
        }

        let show_text = scale >= 0.35;
        let font = egui::FontId::proportional((13.0 * scale).clamp(7.0, 22.0));
        let small = egui::FontId::proportional((11.5 * scale).clamp(6.0, 19.0));
        let mut ids: Vec<NodeId> = graph.ids();
        ids.sort_unstable();
        for id in ids {
            let Some(node) = graph.get(id) else { continue };
            let expanded = self.session.is_expanded(id);
            let rect = geometry.rect(node, expanded);
            let screen = Rect::from_min_max(to_screen(rect.min), to_screen(rect.max));
            if !available.intersects(screen) {
                continue;
            }
            let resp = ui.interact(screen, ui.id().with(("card", id)), Sense::click_and_drag());
            let selected = cursor.map(|c| c.node == id).unwrap_or(false);
            let fill = card_fill(node);
            let stroke = if selected {
                Stroke::new(2.0, Color32::from_rgb(255, 200, 80))
            } else if hits.contains(&id) {
                Stroke::new(2.0, Color32::from_rgb(120, 220, 255))
            } else if resp.hovered() {
                Stroke::new(1.5, Color32::GRAY)
            } else {
                Stroke::new(1.0, Color32::from_gray(70))
            };
            let radius = (6.0 * scale).clamp(2.0, 10.0);
            painter.rect_filled(screen, radius, fill);
            painter.rect_stroke(screen, radius, stroke, egui::StrokeKind::Inside);

            if show_text {
                let header_h = geometry.header_height * scale;
                let max_chars = ((geometry.width - 16.0) / 7.0).max(4.0) as usize;
                let mut title = clip(&node.title, max_chars);
                if node.is_streaming() {
                    title.push_str(" …");
                }
                painter.text(
                    screen.min + Vec2::new(8.0 * scale, header_h * 0.5),
                    egui::Align2::LEFT_CENTER,
                    title,
                    font.clone(),
                    Color32::from_gray(235),
                );
                let count = format!("{}", node.messages.len());
                painter.text(
                    Pos2::new(screen.max.x - 8.0 * scale, screen.min.y + header_h * 0.5),
                    egui::Align2::RIGHT_CENTER,
                    count,
                    small.clone(),
                    Color32::from_gray(150),
                );
                if expanded {
                    for (i, m) in node.messages.iter().enumerate() {
                        let row_min = to_screen(Pos2::new(node.x, node.y + geometry.header_height + i as f32 * geometry.message_height));
                        let row = Rect::from_min_size(row_min, Vec2::new(geometry.width, geometry.message_height) * scale);
                        if cursor == Some(crate::navigation::Cursor { node: id, message_index: i }) {
                            painter.rect_filled(row.shrink(2.0 * scale), radius * 0.5, Color32::from_rgba_unmultiplied(255, 200, 80, 40));
                        }
                        let color = match m.role {
                            Role::User => Color32::from_rgb(140, 190, 255),
                            Role::Assistant => Color32::from_rgb(170, 230, 170),
                        };
                        let first_line = m.content.lines().next().unwrap_or_default();
                        painter.text(
                            row.left_center() + Vec2::new(8.0 * scale, 0.0),
                            egui::Align2::LEFT_CENTER,
                            clip(first_line, max_chars),
                            small.clone(),
                            color,
                        );
                    }
                }
            }

            if resp.drag_started() {
                self.dragging = Some(DragTarget::Card(id));
            }
            if resp.dragged() && self.dragging == Some(DragTarget::Card(id)) {
                let d = resp.drag_delta() / scale;
                if d != Vec2::ZERO {
                    actions.push(CanvasAction::DragCard(id, d));
                }
            }
            if resp.drag_stopped() {
                self.dragging = None;
            }
            if resp.double_clicked() {
                actions.push(CanvasAction::ToggleExpanded(id));
            } else if resp.clicked() {
                let row = resp.interact_pointer_pos().and_then(|p| {
                    let canvas_y = (p.y - translate.y - origin.y) / scale;
                    let offset = canvas_y - node.y - geometry.header_height;
                    (expanded && offset >= 0.0).then(|| (offset / geometry.message_height) as usize)
                });
                actions.push(CanvasAction::Select(id, row));
            }
            resp.on_hover_text(format!("#{} · {} message(s)", id, node.messages.len()));
        }
        actions
    }

    fn draw_topics(&mut self, ui: &mut egui::Ui, painter: &egui::Painter, available: Rect) -> Vec<CanvasAction> {
        let mut actions = Vec::new();
        let vp = self.session.viewport();
        let (scale, translate, origin) = (vp.scale(), vp.translate(), available.min.to_vec2());
        let to_screen = move |p: Pos2| Pos2::new(p.x * scale + translate.x + origin.x, p.y * scale + translate.y + origin.y);
        let Some(scene) = self.session.layout().scene() else {
            painter.text(available.center(), egui::Align2::CENTER_CENTER, "no data available", egui::FontId::proportional(16.0), Color32::GRAY);
            return actions;
        };
        let titles = self.session.topic_data().map(|d| d.titles.as_slice()).unwrap_or_default();
        let matches = scene.matching(self.session.search_query(), titles);

        let link = Stroke::new(1.0, Color32::from_rgba_unmultiplied(150, 150, 170, 90));
        for (t, c) in &scene.links {
            if let (Some(a), Some(b)) = (scene.nodes.get(*t), scene.nodes.get(*c)) {
                painter.line_segment([to_screen(a.pos), to_screen(b.pos)], link);
            }
        }

        let font = egui::FontId::proportional((12.0 * scale).clamp(8.0, 20.0));
        for (i, n) in scene.nodes.iter().enumerate() {
            let screen = Rect::from_min_max(to_screen(n.rect().min), to_screen(n.rect().max));
            if !available.intersects(screen) {
                continue;
            }
            let resp = ui.interact(screen, ui.id().with(("scene", i)), Sense::click_and_drag());
            let hit = matches.contains(&i);
            match &n.kind {
                SceneNodeKind::Topic { cluster, .. } => {
                    let r = n.radius * scale;
                    painter.circle_filled(screen.center(), r, topic_color(*cluster));
                    let stroke = if hit { Stroke::new(2.5, Color32::from_rgb(120, 220, 255)) } else { Stroke::new(1.0, Color32::from_gray(30)) };
                    painter.circle_stroke(screen.center(), r, stroke);
                    painter.text(screen.center(), egui::Align2::CENTER_CENTER, &n.label, font.clone(), Color32::WHITE);
                }
                SceneNodeKind::Conversation { cluster, branched } => {
                    painter.rect_filled(screen, 4.0, topic_color(*cluster).gamma_multiply(0.55));
                    let stroke = if hit {
                        Stroke::new(2.0, Color32::from_rgb(120, 220, 255))
                    } else if *branched {
                        Stroke::new(1.5, Color32::from_rgb(255, 200, 80))
                    } else {
                        Stroke::new(0.5, Color32::from_gray(90))
                    };
                    painter.rect_stroke(screen, 4.0, stroke, egui::StrokeKind::Inside);
                    if scale >= 0.4 {
                        painter.text(screen.center(), egui::Align2::CENTER_CENTER, &n.label, font.clone(), Color32::from_gray(230));
                    }
                }
            }

            if resp.drag_started() {
                self.dragging = Some(DragTarget::Scene(i));
            }
            if resp.dragged() && self.dragging == Some(DragTarget::Scene(i)) {
                actions.push(CanvasAction::DragScene(i, resp.drag_delta() / scale));
            }
            if resp.drag_stopped() {
                self.dragging = None;
                actions.push(CanvasAction::ReleaseScene(i));
            }
            if resp.clicked() {
                if let SceneNodeKind::Conversation { branched: true, .. } = n.kind {
                    actions.push(CanvasAction::OpenConversation(n.label.clone()));
                }
            }
            resp.on_hover_text(&n.label);
        }
        actions
    }

    fn apply_canvas_actions(&mut self, actions: Vec<CanvasAction>) {
        for action in actions {
            match action {
                CanvasAction::Select(id, row) => {
                    let res = match row {
                        Some(i) => self.session.select_message(id, i),
                        None => self.session.select_node(id),
                    };
                    if let Err(e) = res {
                        warn!("select failed: {}", e);
                    }
                }
                CanvasAction::ToggleExpanded(id) => self.session.toggle_expanded(id),
                CanvasAction::DragCard(id, d) => {
                    if self.session.drag_node(id, d.x, d.y).is_ok() {
                        self.mark_dirty();
                    }
                }
                CanvasAction::DragScene(i, d) => self.session.drag_scene_node(i, d),
                CanvasAction::ReleaseScene(i) => self.session.release_scene_node(i),
                CanvasAction::OpenConversation(title) => self.open_conversation(title),
            }
        }
    }

    fn windows(&mut self, ctx: &egui::Context) {
        if self.show_load_versions {
            let mut open = true;
            let mut chosen: Option<std::path::PathBuf> = None;
            egui::Window::new("Load version").open(&mut open).resizable(true).show(ctx, |ui| match persist::list_versions() {
                Ok(list) if list.is_empty() => {
                    ui.label("No saved versions yet.");
                }
                Ok(list) => {
                    egui::ScrollArea::vertical().max_height(320.0).show(ui, |ui| {
                        for p in list {
                            let name = p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
                            if ui.button(name).clicked() {
                                chosen = Some(p);
                            }
                        }
                    });
                }
                Err(e) => {
                    ui.colored_label(Color32::LIGHT_RED, format!("Could not list versions: {}", e));
                }
            });
            if let Some(p) = chosen {
                match persist::load_from_path(&p) {
                    Ok(state) => {
                        self.restore_state(state, &p.display().to_string());
                        open = false;
                    }
                    Err(e) => self.save_error = Some(format!("Failed to load {}: {}", p.display(), e)),
                }
            }
            self.show_load_versions = open;
        }

        if self.show_chats_window {
            let mut open = true;
            let mut load: Option<String> = None;
            let mut delete: Option<String> = None;
            let mut refresh = false;
            egui::Window::new("Saved chats").open(&mut open).resizable(true).show(ctx, |ui| {
                refresh = ui.button("Refresh").clicked();
                ui.separator();
                if self.session.chat_list().is_empty() {
                    ui.label("No saved chats.");
                }
                egui::ScrollArea::vertical().max_height(360.0).show(ui, |ui| {
                    for chat in self.session.chat_list() {
                        ui.horizontal(|ui| {
                            let title = if chat.title.is_empty() { chat.id.as_str() } else { chat.title.as_str() };
                            ui.label(title);
                            if let Some(ts) = &chat.last_modified {
                                ui.small(ts);
                            }
                            if ui.small_button("Open").clicked() {
                                load = Some(chat.id.clone());
                            }
                            if ui.small_button("Delete").clicked() {
                                delete = Some(chat.id.clone());
                            }
                        });
                    }
                });
            });
            let res = match (load, delete, refresh) {
                (Some(id), _, _) => self.session.load_chat(&id).map(|_| ()),
                (_, Some(id), _) => self.session.delete_chat(&id).map(|_| ()),
                (_, _, true) => self.session.list_chats().map(|_| ()),
                _ => Ok(()),
            };
            if let Err(e) = res {
                self.session.show_error(&e, None);
            }
            self.show_chats_window = open;
        }

        if self.show_branched_window {
            let mut open = true;
            let mut import: Option<String> = None;
            egui::Window::new("Branched chats").open(&mut open).resizable(true).show(ctx, |ui| {
                if self.session.branched_chats().is_empty() {
                    ui.label("Nothing loaded yet.");
                }
                egui::ScrollArea::vertical().max_height(360.0).show(ui, |ui| {
                    for (title, chat) in self.session.branched_chats() {
                        ui.horizontal(|ui| {
                            ui.label(title);
                            ui.small(format!("{} branch(es)", chat.branches.len()));
                            if ui.small_button("Import").clicked() {
                                import = Some(title.clone());
                            }
                        });
                    }
                });
            });
            if let Some(title) = import {
                self.open_conversation(title);
                open = false;
            }
            self.show_branched_window = open;
        }

        if self.show_prefs_window {
            let mut open = true;
            let mut apply = false;
            egui::Window::new("Preferences").open(&mut open).resizable(true).collapsible(false).show(ctx, |ui| {
                egui::Grid::new("prefs_grid").num_columns(2).show(ui, |ui| {
                    ui.label("Backend URL");
                    ui.text_edit_singleline(&mut self.prefs_edit.backend_url);
                    ui.end_row();
                    ui.label("Model");
                    ui.text_edit_singleline(&mut self.prefs_edit.model_id);
                    ui.end_row();
                    ui.label("Temperature");
                    ui.add(egui::Slider::new(&mut self.prefs_edit.temperature, 0.0..=2.0));
                    ui.end_row();
                    ui.label("Chat type");
                    ui.text_edit_singleline(&mut self.prefs_edit.chat_type);
                    ui.end_row();
                    ui.label("Retries");
                    ui.add(egui::DragValue::new(&mut self.prefs_edit.max_retries).range(0..=10));
                    ui.end_row();
                    ui.label("Stream replies");
                    ui.checkbox(&mut self.prefs_edit.stream_responses, "");
                    ui.end_row();
                    ui.label("Store chats on backend");
                    ui.checkbox(&mut self.prefs_edit.remote_persistence, "");
                    ui.end_row();
                    ui.label("Control API");
                    ui.checkbox(&mut self.prefs_edit.api_enabled, "enabled");
                    ui.end_row();
                    ui.label("API port");
                    ui.add(egui::DragValue::new(&mut self.prefs_edit.api_port).range(1..=65535));
                    ui.end_row();
                });
                ui.separator();
                apply = ui.button("Save").clicked();
                if let Some(s) = &self.prefs_status {
                    ui.small(s);
                }
            });
            if apply {
                self.apply_prefs();
            }
            self.show_prefs_window = open;
        }
    }

    fn apply_prefs(&mut self) {
        let old = std::mem::replace(&mut self.app_settings, self.prefs_edit.clone());
        if let Err(e) = self.app_settings.save() {
            self.prefs_status = Some(format!("Save failed: {}", e));
            return;
        }
        persist::set_settings_override(self.app_settings.clone());
        self.session.set_generation_options(crate::session::GenerationOptions::from_settings(&self.app_settings));
        match spawn_worker(&self.app_settings) {
            Ok(w) => self.session.attach_worker(w),
            Err(e) => warn!("backend services unavailable: {}", e),
        }
        if self.app_settings.api_enabled != old.api_enabled || self.app_settings.api_endpoint() != old.api_endpoint() {
            self.stop_api();
            if self.app_settings.api_enabled {
                self.start_api();
            }
        }
        self.prefs_status = Some("Saved".into());
    }

    fn toast(&self, ctx: &egui::Context) {
        let Some((msg, when, style)) = &self.last_info else { return };
        if when.elapsed() > Duration::from_secs(3) {
            return;
        }
        egui::Area::new(egui::Id::new("bottom_right_toast"))
            .anchor(egui::Align2::RIGHT_BOTTOM, egui::vec2(-12.0, -12.0))
            .interactable(false)
            .show(ctx, |ui| {
                let (fill, text) = match style {
                    NoticeStyle::Subtle => (Color32::from_rgba_premultiplied(20, 20, 20, 170), Color32::from_gray(200)),
                    NoticeStyle::Prominent => (Color32::from_rgba_premultiplied(30, 30, 30, 230), Color32::LIGHT_GREEN),
                };
                egui::Frame::popup(ui.style())
                    .corner_radius(egui::CornerRadius::same(8))
                    .fill(fill)
                    .inner_margin(egui::Margin::symmetric(10, 6))
                    .show(ui, |ui| {
                        ui.colored_label(text, msg);
                    });
            });
    }
}

impl eframe::App for CanvasApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        let now = Instant::now();
        let dt = now.saturating_duration_since(self.last_frame).as_secs_f32().min(0.1);
        self.last_frame = now;

        self.process_api_requests();
        let busy = self.session.tick(now, dt);
        self.settle_pending();
        if self.session.take_dirty() {
            self.mark_dirty();
        }
        if self.dirty && self.last_change.elapsed() >= AUTOSAVE_AFTER {
            self.save_now_with(NoticeStyle::Subtle);
        }

        self.handle_keys(ctx);
        self.top_bar(ctx);
        self.banner(ctx);
        self.details_panel(ctx);
        self.canvas(ctx);
        self.windows(ctx);
        self.toast(ctx);

        if busy || self.dragging.is_some() {
            ctx.request_repaint();
        } else {
            // Worker events and API requests arrive without input
            ctx.request_repaint_after(Duration::from_millis(200));
        }
    }

    fn on_exit(&mut self, _gl: Option<&eframe::glow::Context>) {
        if self.dirty {
            self.save_now_with(NoticeStyle::Subtle);
        }
        self.stop_api();
    }
}

fn card_fill(node: &Node) -> Color32 {
    match node.kind {
        NodeKind::Main => Color32::from_rgb(38, 52, 82),
        NodeKind::Branch => Color32::from_rgb(44, 46, 54),
        NodeKind::Preview => Color32::from_rgb(34, 56, 44),
    }
}

const TOPIC_PALETTE: [Color32; 8] = [
    Color32::from_rgb(86, 140, 214),
    Color32::from_rgb(214, 120, 86),
    Color32::from_rgb(104, 178, 112),
    Color32::from_rgb(186, 110, 190),
    Color32::from_rgb(210, 180, 80),
    Color32::from_rgb(80, 180, 180),
    Color32::from_rgb(200, 96, 130),
    Color32::from_rgb(140, 140, 200),
];

// Stable color per topic cluster
fn topic_color(cluster: i64) -> Color32 {
    TOPIC_PALETTE[(cluster.unsigned_abs() % TOPIC_PALETTE.len() as u64) as usize]
}

fn clip(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}
