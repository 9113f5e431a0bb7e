//! The canvas facade used by the frontend, the command language and tests.
//!
//! `CanvasSession` is owned by a single thread. Every mutation is
//! synchronous; network work goes through an optional `ServiceWorker` whose
//! events are applied in `pump`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use egui::{Pos2, Vec2};
use log::{debug, info, warn};

use crate::config::CanvasConfig;
use crate::error::{CanvasError, CanvasResult};
use crate::graph_utils::branch::{self, BranchTemplate};
use crate::graph_utils::graph::{ConversationGraph, Message, Node, NodeId, NodePatch};
use crate::graph_utils::import::{BranchedChat, graph_from_branched_chat};
use crate::layout::force::{IslandSimulation, StarSimulation};
use crate::layout::topics::TopicScene;
use crate::layout::tree::{apply_tree_layout, fit_transform};
use crate::layout::{LayoutDriver, LayoutMode};
use crate::navigation::{Cursor, Direction, Navigator};
use crate::persistence::persist::AppStateFile;
use crate::persistence::settings::AppSettings;
use crate::services::analytics::VisualizationData;
use crate::services::generation::GenerateRequest;
use crate::services::persistence::{ChatRecord, ChatSummary};
use crate::services::worker::{JobId, ServiceEvent, ServiceJob, ServiceWorker};
use crate::stream::{GenerationTicket, IngestReport, StreamIngestor};
use crate::viewport::{AnimationEvent, AnimationHandle, CenterTarget, Viewport};

/// Holds the latest value and releases it once it has been stable for the delay.
#[derive(Clone, Debug)]
pub struct Debouncer {
    delay: Duration,
    pending: Option<(String, Instant)>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self { Self { delay, pending: None } }

    pub fn push(&mut self, value: impl Into<String>, now: Instant) {
        self.pending = Some((value.into(), now));
    }

    pub fn poll(&mut self, now: Instant) -> Option<String> {
        match &self.pending {
            Some((_, at)) if now.saturating_duration_since(*at) >= self.delay => self.pending.take().map(|(v, _)| v),
            _ => None,
        }
    }

    pub fn flush(&mut self) -> Option<String> { self.pending.take().map(|(v, _)| v) }

    pub fn is_pending(&self) -> bool { self.pending.is_some() }
}

#[derive(Clone, Debug)]
pub enum RetryAction {
    Job(ServiceJob),
    Regenerate(NodeId),
}

/// Dismissible error shown above the canvas.
#[derive(Clone, Debug)]
pub struct ErrorBanner {
    pub message: String,
    pub retry: Option<RetryAction>,
}

/// Generation settings applied to outgoing requests.
#[derive(Clone, Debug)]
pub struct GenerationOptions {
    pub model: String,
    pub temperature: f32,
    pub stream: bool,
    pub chat_type: String,
}

impl GenerationOptions {
    pub fn from_settings(s: &AppSettings) -> Self {
        Self { model: s.model_id.clone(), temperature: s.temperature, stream: s.stream_responses, chat_type: s.chat_type.clone() }
    }
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self { model: "qwen2.5-coder:7b".into(), temperature: 0.7, stream: true, chat_type: "claude".into() }
    }
}

pub struct CanvasSession {
    graph: ConversationGraph,
    cfg: CanvasConfig,
    viewport: Viewport,
    viewport_size: Vec2,
    navigator: Navigator,
    ingestor: StreamIngestor,
    layout: LayoutDriver,
    expanded: HashSet<NodeId>,
    search: Debouncer,
    search_query: String,
    search_hits: Vec<NodeId>,
    banner: Option<ErrorBanner>,
    chat_id: Option<String>,
    title: String,
    topic_data: Option<VisualizationData>,
    branched_chats: BTreeMap<String, BranchedChat>,
    chat_list: Vec<ChatSummary>,
    options: GenerationOptions,
    worker: Option<ServiceWorker>,
    jobs: HashMap<JobId, ServiceJob>,
    generation_jobs: HashMap<NodeId, JobId>,
    dirty: bool,
}

impl CanvasSession {
    pub fn new(cfg: CanvasConfig, title: &str) -> Self {
        Self::with_graph(cfg, ConversationGraph::with_main(title), title)
    }

    pub fn with_graph(cfg: CanvasConfig, graph: ConversationGraph, title: &str) -> Self {
        let mut viewport = Viewport::new(cfg.viewport.clone());
        viewport.set_mode(LayoutMode::Tree);
        Self {
            graph,
            viewport,
            viewport_size: Vec2::new(1280.0, 720.0),
            navigator: Navigator::new(),
            ingestor: StreamIngestor::new(cfg.branch.clone(), cfg.geometry.clone()),
            layout: LayoutDriver::new(),
            expanded: HashSet::new(),
            search: Debouncer::new(Duration::from_millis(300)),
            search_query: String::new(),
            search_hits: Vec::new(),
            banner: None,
            chat_id: None,
            title: title.to_string(),
            topic_data: None,
            branched_chats: BTreeMap::new(),
            chat_list: Vec::new(),
            options: GenerationOptions::default(),
            worker: None,
            jobs: HashMap::new(),
            generation_jobs: HashMap::new(),
            dirty: false,
            cfg,
        }
    }

    /// Session configured from user settings; no worker is attached yet.
    pub fn from_settings(settings: &AppSettings, title: &str) -> Self {
        let mut s = Self::new(settings.canvas.clone(), title);
        s.search = Debouncer::new(settings.search_debounce());
        s.options = GenerationOptions::from_settings(settings);
        s
    }

    pub fn set_search_delay(&mut self, delay: Duration) { self.search = Debouncer::new(delay); }
    pub fn set_generation_options(&mut self, options: GenerationOptions) { self.options = options; }
    pub fn attach_worker(&mut self, worker: ServiceWorker) { self.worker = Some(worker); }
    /// Hands the worker over, e.g. to a fresh session replacing this one.
    pub fn into_worker(self) -> Option<ServiceWorker> { self.worker }

    pub fn graph(&self) -> &ConversationGraph { &self.graph }
    pub fn config(&self) -> &CanvasConfig { &self.cfg }
    pub fn viewport(&self) -> &Viewport { &self.viewport }
    pub fn viewport_mut(&mut self) -> &mut Viewport { &mut self.viewport }
    pub fn viewport_size(&self) -> Vec2 { self.viewport_size }
    pub fn cursor(&self) -> Option<Cursor> { self.navigator.cursor() }
    pub fn layout_mode(&self) -> LayoutMode { self.layout.mode() }
    pub fn layout(&self) -> &LayoutDriver { &self.layout }
    pub fn is_expanded(&self, id: NodeId) -> bool { self.expanded.contains(&id) }
    pub fn expanded(&self) -> &HashSet<NodeId> { &self.expanded }
    pub fn banner(&self) -> Option<&ErrorBanner> { self.banner.as_ref() }
    pub fn title(&self) -> &str { &self.title }
    pub fn chat_id(&self) -> Option<&str> { self.chat_id.as_deref() }
    pub fn topic_data(&self) -> Option<&VisualizationData> { self.topic_data.as_ref() }
    pub fn branched_chats(&self) -> &BTreeMap<String, BranchedChat> { &self.branched_chats }
    pub fn chat_list(&self) -> &[ChatSummary] { &self.chat_list }
    pub fn search_query(&self) -> &str { &self.search_query }
    pub fn search_hits(&self) -> &[NodeId] { &self.search_hits }
    pub fn is_generating(&self, id: NodeId) -> bool { self.ingestor.is_active(id) }

    /// Whether anything changed since the last call.
    pub fn take_dirty(&mut self) -> bool { std::mem::take(&mut self.dirty) }

    pub fn set_viewport_size(&mut self, size: Vec2) {
        if size.x > 0.0 && size.y > 0.0 {
            self.viewport_size = size;
        }
    }

    pub fn set_title(&mut self, title: &str) {
        self.title = title.to_string();
        self.dirty = true;
    }

    pub fn toggle_expanded(&mut self, id: NodeId) {
        if !self.expanded.remove(&id) && self.graph.contains(id) {
            self.expanded.insert(id);
        }
    }

    // ---- graph mutations ----

    /// Fork `parent` at `message_index`, select the new branch and bring it
    /// into view.
    pub fn create_branch(&mut self, parent: NodeId, message_index: usize, title: Option<String>) -> CanvasResult<NodeId> {
        let template = BranchTemplate { id: self.graph.next_id(), title, system_prompt: None };
        let node = branch::create_branch(&self.graph, parent, message_index, template, &self.cfg.branch)?;
        let id = self.graph.add(node)?;
        info!("created branch {} from node {} at message {}", id, parent, message_index);
        self.dirty = true;
        self.expanded.insert(id);
        self.select_node(id)?;
        self.refresh_search();
        Ok(id)
    }

    /// Cascading delete. The cursor falls back to the deleted node's parent.
    pub fn delete_node(&mut self, id: NodeId) -> CanvasResult<Vec<NodeId>> {
        let parent = self.graph.node(id)?.parent_id;
        let removed = self.graph.remove(id).inspect_err(|e| warn!("delete of node {} refused: {}", id, e))?;
        let had_cursor = self.navigator.cursor().map(|c| removed.contains(&c.node)).unwrap_or(false);
        self.navigator.forget(&removed);
        self.ingestor.forget(&removed);
        for r in &removed {
            self.expanded.remove(r);
            if let Some(job) = self.generation_jobs.remove(r)
                && let Some(w) = self.worker.as_mut()
            {
                w.cancel(job);
            }
        }
        if had_cursor && let Some(p) = parent {
            self.navigator.select(&self.graph, p, false);
        }
        self.dirty = true;
        self.refresh_search();
        Ok(removed)
    }

    pub fn update_node(&mut self, id: NodeId, patch: NodePatch) -> CanvasResult<()> {
        self.graph.update(id, patch)?;
        self.dirty = true;
        Ok(())
    }

    /// Move a card by a canvas-space delta.
    pub fn drag_node(&mut self, id: NodeId, dx: f32, dy: f32) -> CanvasResult<()> {
        let node = self.graph.get_mut(id).ok_or(CanvasError::MissingNode(id))?;
        let p = node.pos() + Vec2::new(dx, dy);
        node.set_pos(p);
        self.dirty = true;
        Ok(())
    }

    /// Drag a topic-scene node; it stays pinned until released.
    pub fn drag_scene_node(&mut self, index: usize, canvas_delta: Vec2) { self.layout.drag(index, canvas_delta); }
    pub fn release_scene_node(&mut self, index: usize) { self.layout.unpin(index); }

    // ---- selection & navigation ----

    pub fn select_node(&mut self, id: NodeId) -> CanvasResult<Cursor> {
        let cursor = self.navigator.select(&self.graph, id, false).ok_or(CanvasError::MissingNode(id))?;
        self.focus(cursor);
        Ok(cursor)
    }

    pub fn select_message(&mut self, id: NodeId, message_index: usize) -> CanvasResult<Cursor> {
        let cursor = self
            .navigator
            .set_cursor(&self.graph, Cursor { node: id, message_index })
            .ok_or(CanvasError::MissingNode(id))?;
        self.focus(cursor);
        Ok(cursor)
    }

    pub fn clear_selection(&mut self) { self.navigator.clear(); }

    /// Move the cursor; `None` when there is nothing in that direction.
    pub fn navigate(&mut self, dir: Direction) -> Option<Cursor> {
        let cursor = self.navigator.navigate(&self.graph, dir)?;
        self.focus(cursor);
        Some(cursor)
    }

    fn focus(&mut self, cursor: Cursor) {
        self.expanded.insert(cursor.node);
        if let Some(node) = self.graph.get(cursor.node) {
            let anchor = self.cfg.geometry.message_anchor(node, cursor.message_index);
            self.viewport.center_on(CenterTarget::Point(anchor), None, self.viewport_size, Instant::now());
        }
    }

    pub fn center_on_node(&mut self, id: NodeId) -> CanvasResult<AnimationHandle> {
        let node = self.graph.node(id)?;
        let rect = self.cfg.geometry.rect(node, self.expanded.contains(&id));
        Ok(self
            .viewport
            .center_on(CenterTarget::Point(rect.center()), Some(self.cfg.viewport.focus_scale), self.viewport_size, Instant::now()))
    }

    // ---- layout ----

    pub fn set_layout_mode(&mut self, mode: LayoutMode) -> CanvasResult<()> {
        match mode {
            LayoutMode::Tree => {
                self.layout.set_tree();
                self.viewport.set_mode(LayoutMode::Tree);
                self.relayout_tree();
            }
            LayoutMode::Star | LayoutMode::Island => {
                let data = self.topic_data.as_ref().ok_or_else(|| CanvasError::invalid_payload("no data available"))?;
                let scene_center = Pos2::ZERO;
                let sim: Box<dyn crate::layout::force::Simulation> = if mode == LayoutMode::Star {
                    let scene = TopicScene::star(data, &self.cfg.star, &mut rand::thread_rng());
                    Box::new(StarSimulation::new(scene, self.cfg.star.clone()))
                } else {
                    let scene = TopicScene::islands(data, &self.cfg.island, scene_center);
                    Box::new(IslandSimulation::new(scene, self.cfg.island.clone(), scene_center))
                };
                self.layout.start(mode, sim);
                self.viewport.set_mode(mode);
                if let Some(b) = self.layout.bounds() {
                    self.viewport.fit_to_bounds(b, self.viewport_size, self.cfg.viewport.fit_padding);
                }
            }
        }
        info!("layout mode: {}", mode.label());
        Ok(())
    }

    /// Re-run the tree layout and fit it into the viewport.
    pub fn relayout_tree(&mut self) {
        if let Some(bounds) = apply_tree_layout(&mut self.graph, &self.cfg.layout, &self.cfg.geometry, &self.expanded) {
            let (scale, translate) = fit_transform(bounds, self.viewport_size, self.cfg.layout.fit_fraction);
            self.viewport.set_transform(scale, translate);
            self.dirty = true;
        }
    }

    /// Fit whatever is showing into the viewport.
    pub fn recenter(&mut self) {
        match self.layout.mode() {
            LayoutMode::Tree => {
                let bounds = self
                    .graph
                    .nodes()
                    .map(|n| self.cfg.geometry.rect(n, self.expanded.contains(&n.id)))
                    .reduce(|a, b| a.union(b));
                if let Some(b) = bounds {
                    let (scale, translate) = fit_transform(b, self.viewport_size, self.cfg.layout.fit_fraction);
                    self.viewport.set_transform(scale, translate);
                }
            }
            _ => {
                if let Some(b) = self.layout.recenter() {
                    self.viewport.fit_to_bounds(b, self.viewport_size, self.cfg.viewport.fit_padding);
                }
            }
        }
    }

    pub fn set_topic_data(&mut self, data: VisualizationData) -> CanvasResult<()> {
        data.validate()?;
        self.topic_data = Some(data);
        // A running topic map is rebuilt from the fresh data
        let mode = self.layout.mode();
        if mode.is_topic_map() {
            self.set_layout_mode(mode)?;
        }
        Ok(())
    }

    /// Per-frame housekeeping: animations, simulation, debounced search and
    /// service events. Returns true while something is still moving.
    pub fn tick(&mut self, now: Instant, dt: f32) -> bool {
        let anim = self.viewport.tick(now);
        if let Some(AnimationEvent::Superseded(h)) = anim {
            debug!("animation {:?} superseded", h);
        }
        let report = self.layout.tick(dt);
        if report.needs_fit
            && let Some(b) = self.layout.bounds()
        {
            self.viewport.fit_to_bounds(b, self.viewport_size, self.cfg.viewport.fit_padding);
        }
        self.poll_search(now);
        self.pump();
        self.viewport.is_animating() || report.moved || self.search.is_pending() || self.has_pending_jobs()
    }

    // ---- search ----

    pub fn set_search(&mut self, query: &str, now: Instant) {
        self.search.push(query, now);
    }

    pub fn poll_search(&mut self, now: Instant) -> bool {
        match self.search.poll(now) {
            Some(q) => {
                self.search_query = q;
                self.refresh_search();
                true
            }
            None => false,
        }
    }

    /// Skip the debounce; used by scripted callers.
    pub fn search_now(&mut self, query: &str) -> &[NodeId] {
        self.search.flush();
        self.search_query = query.to_string();
        self.refresh_search();
        &self.search_hits
    }

    fn refresh_search(&mut self) {
        self.search_hits = self.graph.search(&self.search_query);
    }

    // ---- ingestion ----

    pub fn ingest_message(&mut self, node: NodeId, message: Message) -> CanvasResult<IngestReport> {
        let report = self.ingestor.append_message(&mut self.graph, node, message)?;
        self.after_ingest(&report);
        Ok(report)
    }

    pub fn ingest_begin(&mut self, node: NodeId) -> CanvasResult<GenerationTicket> { self.ingestor.begin(&mut self.graph, node) }

    pub fn ingest_restart(&mut self, node: NodeId) -> CanvasResult<GenerationTicket> {
        if let Some(job) = self.generation_jobs.remove(&node)
            && let Some(w) = self.worker.as_mut()
        {
            w.cancel(job);
        }
        self.ingestor.restart(&mut self.graph, node)
    }

    pub fn ingest_delta(&mut self, ticket: GenerationTicket, text: &str) -> bool { self.ingestor.push_delta(&mut self.graph, ticket, text) }

    pub fn ingest_finish(&mut self, ticket: GenerationTicket) -> CanvasResult<IngestReport> {
        let report = self.ingestor.finish(&mut self.graph, ticket)?;
        self.after_ingest(&report);
        Ok(report)
    }

    pub fn ingest_abort(&mut self, ticket: GenerationTicket) { self.ingestor.abort(&mut self.graph, ticket); }

    pub fn ingest_fail(&mut self, ticket: GenerationTicket, error: CanvasError) {
        let error = self.ingestor.fail(&mut self.graph, ticket, error);
        self.show_error(&error, Some(RetryAction::Regenerate(ticket.node)));
    }

    fn after_ingest(&mut self, report: &IngestReport) {
        self.dirty = true;
        self.refresh_search();
        if self.navigator.cursor().map(|c| c.node) == Some(report.node) {
            let _ = self.navigator.set_cursor(&self.graph, Cursor { node: report.node, message_index: report.message_index });
        }
    }

    /// Append the user's text to `node` and queue a generation for it. If the
    /// generation cannot be queued the message is rolled back.
    pub fn send_message(&mut self, node: NodeId, text: &str) -> CanvasResult<GenerationTicket> {
        if self.ingestor.is_active(node) {
            return Err(CanvasError::GenerationInFlight(node));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(CanvasError::invalid_payload("empty message"));
        }
        let before = self.graph.node(node)?.clone();
        self.ingest_message(node, Message::user(text))?;
        let queued = match self.ingest_begin(node) {
            Ok(ticket) => self.queue_generation(ticket).map(|_| ticket),
            Err(e) => Err(e),
        };
        if queued.is_err() {
            // Roll back the user turn
            if let Some(n) = self.graph.get_mut(node) {
                *n = before;
            }
            self.refresh_search();
            if self.navigator.cursor().map(|c| c.node) == Some(node) {
                let _ = self.navigator.select(&self.graph, node, true);
            }
        }
        queued
    }

    /// Drop whatever is streaming into `node` and ask again.
    pub fn regenerate(&mut self, node: NodeId) -> CanvasResult<GenerationTicket> {
        let ticket = self.ingest_restart(node)?;
        self.queue_generation(ticket)?;
        Ok(ticket)
    }

    /// Cancel whatever is streaming into `node`; partial output is dropped.
    pub fn stop_generation(&mut self, node: NodeId) {
        if let Some(job) = self.generation_jobs.remove(&node)
            && let Some(w) = self.worker.as_mut()
        {
            w.cancel(job);
        }
        if let Some(ticket) = self.ingestor.current(node) {
            self.ingest_abort(ticket);
        }
    }

    pub fn generation_request(&self, node: NodeId) -> CanvasResult<GenerateRequest> {
        let context = self.graph.context_for(node)?;
        let system_prompt = self.graph.node(node)?.system_prompt.clone();
        Ok(GenerateRequest::from_context(&context, system_prompt, &self.options.model, self.options.temperature, self.options.stream))
    }

    fn queue_generation(&mut self, ticket: GenerationTicket) -> CanvasResult<()> {
        let request = match self.generation_request(ticket.node) {
            Ok(r) => r,
            Err(e) => {
                self.ingestor.abort(&mut self.graph, ticket);
                return Err(e);
            }
        };
        let job = ServiceJob::Generate { ticket, request, stream: self.options.stream };
        match self.request(job) {
            Ok(id) => {
                self.generation_jobs.insert(ticket.node, id);
                Ok(())
            }
            Err(e) => {
                self.ingestor.abort(&mut self.graph, ticket);
                Err(e)
            }
        }
    }

    // ---- persistence ----

    pub fn serialize_graph(&self) -> Vec<Node> { self.graph.to_nodes() }

    /// Replace the graph with a persisted node set. Invalid sets are rejected
    /// and leave the current graph untouched.
    pub fn load_graph(&mut self, nodes: Vec<Node>) -> CanvasResult<()> {
        let mut graph = ConversationGraph::from_nodes(nodes)?;
        let repaired = graph.repair_fork_indices();
        if !repaired.is_empty() {
            warn!("repaired fork indices on {} node(s)", repaired.len());
        }
        self.replace_graph(graph);
        Ok(())
    }

    fn replace_graph(&mut self, graph: ConversationGraph) {
        if let Some(w) = self.worker.as_mut() {
            for (_, job) in self.generation_jobs.drain() {
                w.cancel(job);
            }
        }
        self.generation_jobs.clear();
        self.graph = graph;
        self.navigator = Navigator::new();
        self.ingestor = StreamIngestor::new(self.cfg.branch.clone(), self.cfg.geometry.clone());
        self.expanded.clear();
        self.refresh_search();
        self.dirty = true;
    }

    pub fn import_branched_chat(&mut self, title: &str) -> CanvasResult<()> {
        let chat = self
            .branched_chats
            .get(title)
            .ok_or_else(|| CanvasError::invalid_payload(format!("no branched chat titled '{}'", title)))?;
        let graph = graph_from_branched_chat(title, chat, &self.cfg.branch)?;
        self.replace_graph(graph);
        self.chat_id = None;
        self.title = title.to_string();
        self.set_layout_mode(LayoutMode::Tree)?;
        Ok(())
    }

    pub fn chat_record(&self) -> ChatRecord {
        ChatRecord {
            chat_id: self.chat_id.clone().unwrap_or_default(),
            title: self.title.clone(),
            nodes: self.graph.to_nodes(),
            last_modified: None,
            metadata: serde_json::json!({ "layout": self.layout.mode().label() }),
        }
    }

    pub fn snapshot(&self) -> AppStateFile {
        AppStateFile::from_runtime(self.chat_id.as_deref(), &self.title, &self.graph, self.viewport.state(), self.layout.mode())
    }

    pub fn restore(&mut self, state: AppStateFile) -> CanvasResult<()> {
        let chat_id = state.chat_id.clone();
        let title = state.title.clone();
        let (graph, view, mode) = state.to_runtime()?;
        self.replace_graph(graph);
        self.chat_id = chat_id;
        self.title = title;
        self.viewport.restore(view);
        if mode.is_topic_map() && self.topic_data.is_none() {
            // Topic data is not part of the snapshot; fall back to the tree
            self.layout.set_tree();
            self.viewport.set_mode(LayoutMode::Tree);
        } else if mode.is_topic_map() {
            self.set_layout_mode(mode)?;
        }
        self.dirty = false;
        Ok(())
    }

    // ---- services ----

    pub fn has_worker(&self) -> bool { self.worker.is_some() }

    pub fn has_pending_jobs(&self) -> bool { !self.jobs.is_empty() }

    pub fn request(&mut self, job: ServiceJob) -> CanvasResult<JobId> {
        let worker = self
            .worker
            .as_mut()
            .ok_or_else(|| CanvasError::TransientNetwork { message: "no backend connection".into(), attempts: 0 })?;
        let id = worker.submit(job.clone())?;
        self.jobs.insert(id, job);
        Ok(id)
    }

    pub fn save_chat(&mut self) -> CanvasResult<JobId> { self.request(ServiceJob::SaveChat(self.chat_record())) }
    pub fn load_chat(&mut self, id: &str) -> CanvasResult<JobId> { self.request(ServiceJob::LoadChat(id.to_string())) }
    pub fn list_chats(&mut self) -> CanvasResult<JobId> { self.request(ServiceJob::ListChats) }
    pub fn delete_chat(&mut self, id: &str) -> CanvasResult<JobId> { self.request(ServiceJob::DeleteChat(id.to_string())) }

    pub fn fetch_topics(&mut self) -> CanvasResult<JobId> {
        let chat_type = self.options.chat_type.clone();
        self.request(ServiceJob::Visualization(chat_type))
    }

    pub fn fetch_branched_chats(&mut self) -> CanvasResult<JobId> {
        let chat_type = self.options.chat_type.clone();
        self.request(ServiceJob::BranchedChats(chat_type))
    }

    /// Drain worker events into the session.
    pub fn pump(&mut self) -> usize {
        let events = match self.worker.as_mut() {
            Some(w) => w.drain(),
            None => return 0,
        };
        let n = events.len();
        for ev in events {
            self.apply_event(ev);
        }
        n
    }

    pub fn apply_event(&mut self, ev: ServiceEvent) {
        match ev {
            ServiceEvent::Delta { ticket, text } => {
                self.ingest_delta(ticket, &text);
            }
            ServiceEvent::Generated { job, ticket, text } => {
                self.finish_job(job);
                if self.generation_jobs.get(&ticket.node) == Some(&job) {
                    self.generation_jobs.remove(&ticket.node);
                }
                if let Some(t) = text {
                    self.ingest_delta(ticket, &t);
                }
                match self.ingest_finish(ticket) {
                    Ok(r) => debug!("node {} received reply #{}", r.node, r.message_index),
                    Err(e) if e.is_user_abort() => {}
                    Err(e) => self.show_error(&e, None),
                }
            }
            ServiceEvent::GenerationFailed { job, ticket, error } => {
                self.finish_job(job);
                if self.generation_jobs.get(&ticket.node) == Some(&job) {
                    self.generation_jobs.remove(&ticket.node);
                }
                if error.is_user_abort() {
                    self.ingest_abort(ticket);
                } else if self.ingestor.current(ticket.node) == Some(ticket) {
                    self.ingest_fail(ticket, error);
                }
            }
            ServiceEvent::ChatSaved { job, id } => {
                self.finish_job(job);
                info!("chat saved as {}", id);
                self.chat_id = Some(id);
            }
            ServiceEvent::ChatLoaded { job, record } => {
                self.finish_job(job);
                let id = record.chat_id.clone();
                let title = record.title.clone();
                match self.load_graph(record.nodes) {
                    Ok(()) => {
                        self.chat_id = Some(id);
                        self.title = title;
                        self.relayout_tree();
                    }
                    Err(e) => self.show_error(&e, None),
                }
            }
            ServiceEvent::ChatList { job, chats } => {
                self.finish_job(job);
                self.chat_list = chats;
            }
            ServiceEvent::ChatDeleted { job, id } => {
                self.finish_job(job);
                self.chat_list.retain(|c| c.id != id);
                if self.chat_id.as_deref() == Some(id.as_str()) {
                    self.chat_id = None;
                }
            }
            ServiceEvent::Visualization { job, data } => {
                self.finish_job(job);
                if let Err(e) = self.set_topic_data(data) {
                    self.show_error(&e, None);
                }
            }
            ServiceEvent::BranchedChats { job, chats } => {
                self.finish_job(job);
                info!("{} branched chats available", chats.len());
                self.branched_chats = chats;
            }
            ServiceEvent::Failed { job, label, error } => {
                let retry = self.jobs.remove(&job).map(RetryAction::Job);
                if !error.is_user_abort() {
                    warn!("{} failed: {}", label, error);
                    self.show_error(&error, retry);
                }
            }
        }
    }

    fn finish_job(&mut self, job: JobId) { self.jobs.remove(&job); }

    // ---- errors ----

    pub fn show_error(&mut self, error: &CanvasError, retry: Option<RetryAction>) {
        if error.is_user_abort() {
            return;
        }
        let retry = if error.is_transient() { retry } else { None };
        self.banner = Some(ErrorBanner { message: error.to_string(), retry });
    }

    pub fn dismiss_banner(&mut self) { self.banner = None; }

    /// Re-issue the failed operation behind the banner, if it offered one.
    pub fn retry_banner(&mut self) -> CanvasResult<()> {
        let Some(banner) = self.banner.take() else { return Ok(()) };
        match banner.retry {
            Some(RetryAction::Job(job)) => self.request(job).map(|_| ()),
            Some(RetryAction::Regenerate(node)) => self.regenerate(node).map(|_| ()),
            None => Ok(()),
        }
    }
}
