//! Background service thread.
//!
//! The UI loop never awaits: it submits jobs and drains `ServiceEvent`s once
//! per frame. Every job gets its own cancellation token; cancelling a job
//! that already finished is harmless.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;

use log::{debug, error, warn};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_util::sync::CancellationToken;

use super::BackendConfig;
use super::analytics::{AnalyticsService, HttpAnalytics, VisualizationData};
use super::generation::{GenerateRequest, GenerationService, HttpGeneration};
use super::persistence::{ChatRecord, ChatStore, ChatSummary, HttpChatStore, LocalChatStore};
use crate::error::{CanvasError, CanvasResult};
use crate::graph_utils::import::BranchedChat;
use crate::persistence::settings::AppSettings;
use crate::stream::GenerationTicket;

pub type JobId = u64;

#[derive(Clone)]
pub struct Services {
    pub generation: Arc<dyn GenerationService>,
    pub store: Arc<dyn ChatStore>,
    pub analytics: Arc<dyn AnalyticsService>,
}

impl Services {
    pub fn from_settings(settings: &AppSettings) -> CanvasResult<Self> {
        let cfg = BackendConfig::from_settings(settings);
        let store: Arc<dyn ChatStore> = if settings.remote_persistence {
            Arc::new(HttpChatStore::new(cfg.clone())?)
        } else {
            Arc::new(LocalChatStore::new(settings.autosave_dir().join("chats")))
        };
        Ok(Self {
            generation: Arc::new(HttpGeneration::new(cfg.clone())?),
            store,
            analytics: Arc::new(HttpAnalytics::new(cfg)?),
        })
    }
}

#[derive(Clone, Debug)]
pub enum ServiceJob {
    Generate { ticket: GenerationTicket, request: GenerateRequest, stream: bool },
    SaveChat(ChatRecord),
    LoadChat(String),
    ListChats,
    DeleteChat(String),
    Visualization(String),
    BranchedChats(String),
}

impl ServiceJob {
    pub fn label(&self) -> &'static str {
        match self {
            ServiceJob::Generate { .. } => "generate",
            ServiceJob::SaveChat(_) => "save chat",
            ServiceJob::LoadChat(_) => "load chat",
            ServiceJob::ListChats => "list chats",
            ServiceJob::DeleteChat(_) => "delete chat",
            ServiceJob::Visualization(_) => "load topics",
            ServiceJob::BranchedChats(_) => "load branched chats",
        }
    }
}

#[derive(Debug)]
pub enum ServiceEvent {
    Delta { ticket: GenerationTicket, text: String },
    // `text` is the full reply for batch jobs, None when it was streamed
    Generated { job: JobId, ticket: GenerationTicket, text: Option<String> },
    GenerationFailed { job: JobId, ticket: GenerationTicket, error: CanvasError },
    ChatSaved { job: JobId, id: String },
    ChatLoaded { job: JobId, record: ChatRecord },
    ChatList { job: JobId, chats: Vec<ChatSummary> },
    ChatDeleted { job: JobId, id: String },
    Visualization { job: JobId, data: VisualizationData },
    BranchedChats { job: JobId, chats: BTreeMap<String, BranchedChat> },
    Failed { job: JobId, label: &'static str, error: CanvasError },
}

struct Envelope {
    id: JobId,
    job: ServiceJob,
    cancel: CancellationToken,
}

pub struct ServiceWorker {
    jobs: UnboundedSender<Envelope>,
    events: Receiver<ServiceEvent>,
    tokens: HashMap<JobId, CancellationToken>,
    next_job: JobId,
    shutdown: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl ServiceWorker {
    pub fn spawn(services: Services) -> anyhow::Result<Self> {
        let (job_tx, job_rx) = unbounded_channel::<Envelope>();
        let (event_tx, event_rx) = std::sync::mpsc::channel::<ServiceEvent>();
        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        let rt = tokio::runtime::Builder::new_multi_thread().worker_threads(2).enable_all().build()?;
        let thread = std::thread::Builder::new().name("tangent-services".into()).spawn(move || {
            rt.block_on(run_loop(services, job_rx, event_tx, stop));
        })?;
        Ok(Self { jobs: job_tx, events: event_rx, tokens: HashMap::new(), next_job: 1, shutdown, thread: Some(thread) })
    }

    pub fn submit(&mut self, job: ServiceJob) -> CanvasResult<JobId> {
        let id = self.next_job;
        self.next_job += 1;
        let cancel = self.shutdown.child_token();
        debug!("job {} queued: {}", id, job.label());
        self.jobs
            .send(Envelope { id, job, cancel: cancel.clone() })
            .map_err(|_| CanvasError::TransientNetwork { message: "service worker stopped".into(), attempts: 0 })?;
        self.tokens.insert(id, cancel);
        Ok(id)
    }

    pub fn cancel(&mut self, job: JobId) {
        if let Some(t) = self.tokens.remove(&job) {
            t.cancel();
        }
    }

    /// Everything that arrived since the last call, in arrival order.
    pub fn drain(&mut self) -> Vec<ServiceEvent> {
        let mut out = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(ev) => {
                    if let Some(job) = finished_job(&ev) {
                        self.tokens.remove(&job);
                    }
                    out.push(ev);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.thread.is_some() {
                        error!("service worker thread exited");
                        self.thread = None;
                    }
                    break;
                }
            }
        }
        out
    }

    pub fn pending(&self) -> usize { self.tokens.len() }

    pub fn shutdown(&mut self) {
        self.shutdown.cancel();
        self.tokens.clear();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for ServiceWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn finished_job(ev: &ServiceEvent) -> Option<JobId> {
    match ev {
        ServiceEvent::Delta { .. } => None,
        ServiceEvent::Generated { job, .. }
        | ServiceEvent::GenerationFailed { job, .. }
        | ServiceEvent::ChatSaved { job, .. }
        | ServiceEvent::ChatLoaded { job, .. }
        | ServiceEvent::ChatList { job, .. }
        | ServiceEvent::ChatDeleted { job, .. }
        | ServiceEvent::Visualization { job, .. }
        | ServiceEvent::BranchedChats { job, .. }
        | ServiceEvent::Failed { job, .. } => Some(*job),
    }
}

async fn run_loop(services: Services, mut jobs: UnboundedReceiver<Envelope>, events: Sender<ServiceEvent>, stop: CancellationToken) {
    loop {
        let env = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = jobs.recv() => match next {
                Some(env) => env,
                None => break,
            },
        };
        let services = services.clone();
        let events = events.clone();
        tokio::spawn(async move {
            let ev = run_job(&services, env.id, env.job, &env.cancel, &events).await;
            if events.send(ev).is_err() {
                warn!("job {} finished after the UI went away", env.id);
            }
        });
    }
    debug!("service loop stopped");
}

async fn run_job(services: &Services, id: JobId, job: ServiceJob, cancel: &CancellationToken, events: &Sender<ServiceEvent>) -> ServiceEvent {
    let label = job.label();
    let fail = |error: CanvasError| ServiceEvent::Failed { job: id, label, error };
    match job {
        ServiceJob::Generate { ticket, request, stream } => {
            let result = if stream {
                let tx = events.clone();
                let mut sink = move |text: String| {
                    let _ = tx.send(ServiceEvent::Delta { ticket, text });
                };
                services.generation.generate_stream(request, cancel, &mut sink).await.map(|_| None)
            } else {
                services.generation.generate(request, cancel).await.map(Some)
            };
            match result {
                Ok(text) => ServiceEvent::Generated { job: id, ticket, text },
                Err(error) => ServiceEvent::GenerationFailed { job: id, ticket, error },
            }
        }
        ServiceJob::SaveChat(record) => match services.store.save(&record, cancel).await {
            Ok(chat_id) => ServiceEvent::ChatSaved { job: id, id: chat_id },
            Err(e) => fail(e),
        },
        ServiceJob::LoadChat(chat_id) => match services.store.load(&chat_id, cancel).await {
            Ok(record) => ServiceEvent::ChatLoaded { job: id, record },
            Err(e) => fail(e),
        },
        ServiceJob::ListChats => match services.store.list(cancel).await {
            Ok(chats) => ServiceEvent::ChatList { job: id, chats },
            Err(e) => fail(e),
        },
        ServiceJob::DeleteChat(chat_id) => match services.store.delete(&chat_id, cancel).await {
            Ok(()) => ServiceEvent::ChatDeleted { job: id, id: chat_id },
            Err(e) => fail(e),
        },
        ServiceJob::Visualization(chat_type) => match services.analytics.visualization(&chat_type, cancel).await {
            Ok(data) => ServiceEvent::Visualization { job: id, data },
            Err(e) => fail(e),
        },
        ServiceJob::BranchedChats(chat_type) => match services.analytics.branched_chats(&chat_type, cancel).await {
            Ok(chats) => ServiceEvent::BranchedChats { job: id, chats },
            Err(e) => fail(e),
        },
    }
}
