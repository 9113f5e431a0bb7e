use once_cell::sync::OnceCell;
use std::sync::mpsc::{Receiver, Sender};

use crate::commands::CommandOutcome;

// Handlers hand commands to the UI thread, which owns the session
static API_REQ_TX: OnceCell<Sender<ApiRequest>> = OnceCell::new();

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub api_key: Option<String>,
    pub request_id: String,
    pub command: String,
    pub log: bool,
    pub respond_to: Sender<Result<CommandOutcome, String>>,
}

pub fn set_request_sender(tx: Sender<ApiRequest>) {
    let _ = API_REQ_TX.set(tx);
}

pub fn get_request_sender() -> Option<&'static Sender<ApiRequest>> {
    API_REQ_TX.get()
}

/// Called once by the frontend at startup; it drains the receiver each frame.
pub fn init_broker() -> Receiver<ApiRequest> {
    let (tx, rx) = std::sync::mpsc::channel();
    set_request_sender(tx);
    rx
}

#[cfg(feature = "api")]
pub mod server;

#[cfg(not(feature = "api"))]
pub mod server {
    use crate::persistence::settings::AppSettings;

    pub fn start_server(_cfg: &AppSettings) -> anyhow::Result<()> { Ok(()) }
    pub fn stop_server() {}
    pub fn is_running() -> bool { false }
}
