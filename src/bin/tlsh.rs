// tlsh: Tangent-Loom shell, a REPL client for the control API
// Build with: cargo build --features cli --bin tlsh

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Arg, ArgAction, Command};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tungstenite::{Error as WsError, WebSocket, client::IntoClientRequest, connect, protocol::Message};
use url::Url;

use tangent_loom::persistence::settings::AppSettings;

const BANNER_PREFIX: &str = "Tangent-Loom REPL ready.";

fn history_path() -> PathBuf {
    AppSettings::settings_dir().join("tlsh_history.txt")
}

fn is_banner_msg(s: &str) -> bool {
    s.trim_start().starts_with(BANNER_PREFIX)
}

fn is_interrupted(e: &WsError) -> bool {
    matches!(e, WsError::Io(ioe) if ioe.kind() == std::io::ErrorKind::Interrupted)
}

fn recv_with_retry<S: std::io::Read + std::io::Write>(sock: &mut WebSocket<S>, overall: Duration) -> Result<Message, WsError> {
    let start = Instant::now();
    loop {
        match sock.read() {
            Err(e) if is_interrupted(&e) && start.elapsed() <= overall => continue,
            other => return other,
        }
    }
}

fn send_with_retry<S: std::io::Read + std::io::Write>(sock: &mut WebSocket<S>, text: &str, overall: Duration) -> Result<(), WsError> {
    let start = Instant::now();
    loop {
        match sock.send(Message::Text(text.to_string())) {
            Err(e) if is_interrupted(&e) && start.elapsed() <= overall => continue,
            other => return other,
        }
    }
}

// Read frames until the first non-banner reply
fn read_reply<S: std::io::Read + std::io::Write>(sock: &mut WebSocket<S>) -> Result<String, WsError> {
    loop {
        match recv_with_retry(sock, Duration::from_secs(60))? {
            Message::Text(txt) if is_banner_msg(&txt) => continue,
            Message::Text(txt) => return Ok(txt),
            Message::Binary(b) => return Ok(String::from_utf8_lossy(&b).into_owned()),
            _ => {}
        }
    }
}

fn print_response(s: &str) {
    match serde_json::from_str::<serde_json::Value>(s).ok().and_then(|v| serde_json::to_string_pretty(&v).ok()) {
        Some(p) => println!("{}", p),
        None => println!("{}", s),
    }
}

const HELP: &str = "\
Commands:
  :help or ?    Show this help
  :quit         Exit tlsh
Canvas commands (separate several with ';'):
  BRANCH <parent> <message> [title]   DELETE <id>   DRAG <id> <dx> <dy>
  SELECT <id> [message]   NAV up|down|left|right   CENTER <id>
  LAYOUT tree|star|island   LIST   SHOW <id>   SEARCH <text>
  SAY <id> <text>   REPLY <id> <text>   ASK <id> <text>   EXPORT";

fn main() -> anyhow::Result<()> {
    let matches = Command::new("tlsh")
        .about("Tangent-Loom shell: drive a running canvas through its control API")
        .arg(Arg::new("host").long("host").default_value("127.0.0.1").help("Server host"))
        .arg(Arg::new("port").long("port").default_value("8787").help("Server port"))
        .arg(Arg::new("api_key").long("api-key").value_name("KEY").help("API key sent as X-API-Key"))
        .arg(Arg::new("eval").short('e').long("eval").value_name("COMMAND").help("Run one command and exit"))
        .arg(Arg::new("quiet").short('q').long("quiet").action(ArgAction::SetTrue).help("Suppress banner/help text"))
        .get_matches();

    let host = matches.get_one::<String>("host").cloned().unwrap_or_else(|| "127.0.0.1".into());
    let port = matches.get_one::<String>("port").cloned().unwrap_or_else(|| "8787".into());
    let api_key = matches.get_one::<String>("api_key").cloned();
    let eval = matches.get_one::<String>("eval").cloned();
    let quiet = matches.get_flag("quiet");

    let endpoint = format!("ws://{}:{}/api/repl", host, port);
    let mut req = Url::parse(&endpoint)?.into_client_request()?;
    if let Some(key) = api_key {
        req.headers_mut().insert("X-API-Key", http::HeaderValue::from_str(&key)?);
    }

    let (mut socket, _resp) = connect(req).map_err(|e| {
        anyhow::anyhow!("failed to connect: {}\nHint: is Tangent-Loom running with the API enabled (default 127.0.0.1:8787)?", e)
    })?;

    // Swallow the greeting so it is not mistaken for the first reply
    let _ = recv_with_retry(&mut socket, Duration::from_secs(2));

    if let Some(command) = eval {
        send_with_retry(&mut socket, &command, Duration::from_secs(5))?;
        print_response(&read_reply(&mut socket)?);
        return Ok(());
    }

    let mut rl = DefaultEditor::new()?;
    let hist = history_path();
    if let Some(parent) = hist.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = rl.load_history(&hist);

    if !quiet {
        eprintln!("Connected to {}.\nType :help for commands. History saved at {}.\n", endpoint, hist.display());
    }

    loop {
        match rl.readline("tlsh> ") {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                if input == ":quit" || input.eq_ignore_ascii_case("quit") || input.eq_ignore_ascii_case("exit") {
                    break;
                }
                if input == ":help" || input == "?" {
                    println!("{}", HELP);
                    continue;
                }
                let _ = rl.add_history_entry(input);
                if let Err(e) = send_with_retry(&mut socket, input, Duration::from_secs(5)) {
                    eprintln!("send error: {}", e);
                    break;
                }
                match read_reply(&mut socket) {
                    Ok(reply) => print_response(&reply),
                    Err(e) => {
                        eprintln!("read error: {}", e);
                        break;
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("readline error: {}", e);
                break;
            }
        }
    }

    let _ = rl.save_history(&hist);
    Ok(())
}
