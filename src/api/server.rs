//! Actix-web control API: `POST /api/command` and a line-per-command
//! WebSocket REPL at `/api/repl`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use actix_web::{App, HttpRequest, HttpResponse, HttpServer, Responder, web};
use actix_web_actors::ws;
use log::{error, info};
use serde::Deserialize;
use tokio::runtime::Runtime;

use super::{ApiRequest, get_request_sender};
use crate::commands::CommandOutcome;
use crate::persistence::settings::AppSettings;

pub const REPL_BANNER: &str = "Tangent-Loom REPL ready. Send commands as text.";

struct ServerState {
    handle: Option<actix_web::dev::ServerHandle>,
    runtime: Option<Runtime>,
}

static SERVER_STATE: once_cell::sync::Lazy<Arc<Mutex<ServerState>>> =
    once_cell::sync::Lazy::new(|| Arc::new(Mutex::new(ServerState { handle: None, runtime: None })));

static REQ_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
struct Cfg {
    api_key: Option<String>,
    log_dir: PathBuf,
}

fn log_line(dir: &Path, line: &str) {
    use std::io::Write;
    let now = time::OffsetDateTime::now_utc();
    let date = time::macros::format_description!("[year][month][day]");
    let ts = time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let fname = match now.format(&date) {
        Ok(s) => format!("api_{}.log", s),
        Err(_) => "api.log".to_string(),
    };
    let _ = std::fs::create_dir_all(dir);
    let msg = format!("{} | {}\n", now.format(&ts).unwrap_or_default(), line);
    if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(dir.join(fname)) {
        let _ = f.write_all(msg.as_bytes());
    }
}

fn next_request_id() -> String {
    let n = REQ_COUNTER.fetch_add(1, Ordering::Relaxed);
    let now = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    format!("{}-{}", now, n)
}

fn presented_key(req: &HttpRequest) -> Option<String> {
    req.headers().get("X-API-Key").and_then(|h| h.to_str().ok()).map(str::to_string)
}

fn check_api_key(req: &HttpRequest, cfg: &Cfg) -> bool {
    match &cfg.api_key {
        None => true,
        Some(required) => presented_key(req).as_deref() == Some(required.as_str()),
    }
}

#[derive(Deserialize)]
struct CommandBody {
    command: String,
    #[serde(default)]
    log: Option<bool>,
}

enum Dispatch {
    Done(CommandOutcome),
    Failed(String),
    Unavailable(&'static str),
    TimedOut,
}

// Hand one command to the UI thread and wait for its answer
fn dispatch(api_key: Option<String>, rid: &str, command: String, log: bool, wait: Duration) -> Dispatch {
    let Some(sender) = get_request_sender() else { return Dispatch::Unavailable("broker not ready") };
    let (tx, rx) = std::sync::mpsc::channel();
    let req = ApiRequest { api_key, request_id: rid.to_string(), command, log, respond_to: tx };
    if sender.send(req).is_err() {
        return Dispatch::Unavailable("failed to enqueue");
    }
    match rx.recv_timeout(wait) {
        Ok(Ok(out)) => Dispatch::Done(out),
        Ok(Err(e)) => Dispatch::Failed(e),
        Err(_) => Dispatch::TimedOut,
    }
}

async fn handle_command(cfg: web::Data<Cfg>, req: HttpRequest, body: web::Json<CommandBody>) -> impl Responder {
    if !check_api_key(&req, &cfg) {
        return HttpResponse::Unauthorized().body("unauthorized");
    }
    let rid = next_request_id();
    let peer = req.peer_addr().map(|a| a.to_string()).unwrap_or_else(|| "unknown".into());
    let CommandBody { command, log } = body.into_inner();
    log_line(&cfg.log_dir, &format!("RID={} HTTP /api/command from {} len={}", rid, peer, command.len()));
    let t0 = Instant::now();
    let key = presented_key(&req);
    let rid2 = rid.clone();
    // The UI thread answers over a blocking channel
    let result = web::block(move || dispatch(key, &rid2, command, log.unwrap_or(true), Duration::from_secs(30))).await;
    let dt = t0.elapsed().as_millis();
    match result {
        Ok(Dispatch::Done(out)) => {
            log_line(&cfg.log_dir, &format!("RID={} HTTP OK nodes={} mutated={} dt_ms={}", rid, out.affected_nodes, out.mutated, dt));
            HttpResponse::Ok().json(out)
        }
        Ok(Dispatch::Failed(e)) => {
            log_line(&cfg.log_dir, &format!("RID={} HTTP ERR {} dt_ms={}", rid, e, dt));
            HttpResponse::BadRequest().body(e)
        }
        Ok(Dispatch::Unavailable(why)) => {
            log_line(&cfg.log_dir, &format!("RID={} {}", rid, why));
            HttpResponse::ServiceUnavailable().body(why)
        }
        Ok(Dispatch::TimedOut) => {
            log_line(&cfg.log_dir, &format!("RID={} HTTP TIMEOUT dt_ms={}", rid, dt));
            HttpResponse::GatewayTimeout().body("command timeout")
        }
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

struct ReplWs {
    cfg: Cfg,
    api_key: Option<String>,
}

impl actix::Actor for ReplWs {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.text(REPL_BANNER);
        log_line(&self.cfg.log_dir, "WS connected");
    }
}

impl actix::StreamHandler<Result<ws::Message, ws::ProtocolError>> for ReplWs {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                let line = text.trim().to_string();
                if line.is_empty() {
                    return;
                }
                let rid = next_request_id();
                log_line(&self.cfg.log_dir, &format!("RID={} WS command len={}", rid, line.len()));
                let t0 = Instant::now();
                let reply = match dispatch(self.api_key.clone(), &rid, line, true, Duration::from_secs(60)) {
                    Dispatch::Done(out) => serde_json::to_string_pretty(&out).unwrap_or_else(|_| "{}".into()),
                    Dispatch::Failed(e) => format!("error: {}", e),
                    Dispatch::Unavailable(why) => why.to_string(),
                    Dispatch::TimedOut => "timeout".to_string(),
                };
                log_line(&self.cfg.log_dir, &format!("RID={} WS done dt_ms={}", rid, t0.elapsed().as_millis()));
                ctx.text(reply);
            }
            Ok(ws::Message::Ping(b)) => ctx.pong(&b),
            Ok(ws::Message::Close(_)) => {
                log_line(&self.cfg.log_dir, "WS closed");
                ctx.close(None)
            }
            _ => {}
        }
    }
}

async fn ws_handler(cfg: web::Data<Cfg>, req: HttpRequest, stream: web::Payload) -> actix_web::Result<HttpResponse> {
    if !check_api_key(&req, &cfg) {
        return Ok(HttpResponse::Unauthorized().body("unauthorized"));
    }
    ws::start(ReplWs { cfg: cfg.get_ref().clone(), api_key: presented_key(&req) }, &req, stream)
}

pub fn start_server(cfg: &AppSettings) -> anyhow::Result<()> {
    let bind = cfg.api_endpoint();
    let api_key = cfg.api_key.clone();
    let log_dir = cfg.api_log_dir();
    stop_server();

    std::thread::Builder::new().name("tangent-api".into()).spawn(move || {
        let rt = match tokio::runtime::Builder::new_multi_thread().worker_threads(2).enable_all().build() {
            Ok(r) => r,
            Err(e) => {
                error!("failed to create runtime for the API server: {}", e);
                return;
            }
        };
        rt.block_on(async move {
            let cfg_data = Cfg { api_key, log_dir };
            log_line(&cfg_data.log_dir, &format!("Server starting on {}", bind));
            let server = match HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(cfg_data.clone()))
                    .route("/api/command", web::post().to(handle_command))
                    .route("/api/repl", web::get().to(ws_handler))
            })
            .bind(&bind)
            {
                Ok(s) => s.run(),
                Err(e) => {
                    error!("API server bind failed on {}: {}", bind, e);
                    return;
                }
            };
            info!("API server listening on {}", bind);
            if let Ok(mut st) = SERVER_STATE.lock() {
                st.handle = Some(server.handle());
            }
            let _ = server.await;
        });
        if let Ok(mut st) = SERVER_STATE.lock() {
            st.runtime = Some(rt);
        }
    })?;
    Ok(())
}

pub fn stop_server() {
    let (handle, rt) = match SERVER_STATE.lock() {
        Ok(mut st) => (st.handle.take(), st.runtime.take()),
        Err(_) => return,
    };
    if let Some(h) = handle {
        // stop() returns a future; dropping it still signals the server
        let _ = h.stop(false);
    }
    if let Some(r) = rt {
        r.shutdown_timeout(Duration::from_millis(100));
    }
}

pub fn is_running() -> bool {
    SERVER_STATE.lock().map(|st| st.handle.is_some()).unwrap_or(false)
}
