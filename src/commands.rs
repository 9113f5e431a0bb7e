//! Line-oriented command language over `CanvasSession`.
//!
//! Statements are separated by `;` and run in order; the first failing
//! statement aborts the rest. Keywords are case-insensitive:
//!
//! ```text
//! BRANCH <parent> <message_index> [title]   LIST
//! DELETE <id>                               SHOW <id>
//! DRAG <id> <dx> <dy>                       SEARCH <text>
//! SELECT <id> [message_index]               SAY <id> <text>
//! NAV up|down|left|right                    REPLY <id> <text>
//! CENTER <id>                               ASK <id> <text>
//! LAYOUT tree|star|island                   EXPORT
//! ```

use std::fs::{OpenOptions, create_dir_all};
use std::io::Write;
use std::path::Path;

use anyhow::{Result, anyhow};
use serde::Serialize;
use time::{OffsetDateTime, macros::format_description};

use crate::graph_utils::graph::{Message, Node, NodeId, NodeKind};
use crate::layout::LayoutMode;
use crate::navigation::Direction;
use crate::session::CanvasSession;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CommandRow {
    Node {
        id: NodeId,
        title: String,
        #[serde(rename = "type")]
        node_kind: NodeKind,
        parent: Option<NodeId>,
        fork: Option<usize>,
        messages: usize,
        x: f32,
        y: f32,
    },
    Message { node: NodeId, index: usize, role: String, content: String },
    Cursor { node: NodeId, message_index: usize },
    Info { info: String },
}

impl CommandRow {
    fn node(n: &Node) -> Self {
        CommandRow::Node {
            id: n.id,
            title: n.title.clone(),
            node_kind: n.kind,
            parent: n.parent_id,
            fork: n.parent_message_index,
            messages: n.messages.len(),
            x: n.x,
            y: n.y,
        }
    }

    fn info(s: impl Into<String>) -> Self { CommandRow::Info { info: s.into() } }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CommandOutcome {
    pub rows: Vec<CommandRow>,
    pub affected_nodes: usize,
    pub mutated: bool,
}

struct Step {
    rows: Vec<CommandRow>,
    affected: usize,
    mutated: bool,
}

impl Step {
    fn read(rows: Vec<CommandRow>) -> Self { Self { rows, affected: 0, mutated: false } }
    fn write(rows: Vec<CommandRow>, affected: usize) -> Self { Self { rows, affected, mutated: true } }
}

fn log_path_for_now(dir: &Path) -> std::path::PathBuf {
    let fmt = format_description!("[year][month][day]");
    let date = OffsetDateTime::now_utc().format(&fmt).unwrap_or_else(|_| "unknown".into());
    dir.join(format!("commands_{}.log", date))
}

fn log_command(dir: &Path, command: &str, outcome: &Result<CommandOutcome>) {
    let _ = create_dir_all(dir);
    let ts_fmt = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let ts = OffsetDateTime::now_utc().format(&ts_fmt).unwrap_or_default();
    let status = match outcome {
        Ok(o) => format!("OK mutated={} nodes={} rows={}", o.mutated, o.affected_nodes, o.rows.len()),
        Err(e) => format!("ERR {}", e),
    };
    let line = format!("{} | {}\n{}\n\n", ts, status, command.trim());
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(log_path_for_now(dir)) {
        let _ = file.write_all(line.as_bytes());
    }
}

pub fn execute_command(session: &mut CanvasSession, input: &str) -> Result<CommandOutcome> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("empty command"));
    }
    let mut outcome = CommandOutcome::default();
    for stmt in trimmed.split(';') {
        let stmt = stmt.trim();
        if stmt.is_empty() {
            continue;
        }
        let (keyword, rest) = match stmt.split_once(char::is_whitespace) {
            Some((k, r)) => (k, r.trim()),
            None => (stmt, ""),
        };
        let step = match keyword.to_ascii_uppercase().as_str() {
            "BRANCH" => exec_branch(session, rest),
            "DELETE" => exec_delete(session, rest),
            "DRAG" => exec_drag(session, rest),
            "SELECT" => exec_select(session, rest),
            "NAV" => exec_nav(session, rest),
            "CENTER" => exec_center(session, rest),
            "LAYOUT" => exec_layout(session, rest),
            "LIST" => Ok(Step::read(session.graph().nodes().map(CommandRow::node).collect())),
            "SHOW" => exec_show(session, rest),
            "SEARCH" => exec_search(session, rest),
            "SAY" => exec_append(session, rest, false),
            "REPLY" => exec_append(session, rest, true),
            "ASK" => exec_ask(session, rest),
            "EXPORT" => exec_export(session),
            _ => return Err(anyhow!("unrecognized command: {}", stmt)),
        }?;
        outcome.rows.extend(step.rows);
        outcome.affected_nodes += step.affected;
        outcome.mutated |= step.mutated;
    }
    Ok(outcome)
}

/// Run and append the command plus its status to the daily log in `log_dir`.
pub fn execute_and_log(session: &mut CanvasSession, input: &str, log_dir: &Path) -> Result<CommandOutcome> {
    let res = execute_command(session, input);
    log_command(log_dir, input, &res);
    res
}

fn parse_id(s: Option<&str>) -> Result<NodeId> {
    let s = s.ok_or_else(|| anyhow!("missing node id"))?;
    s.trim().parse::<NodeId>().map_err(|e| anyhow!("invalid node id '{}': {}", s, e))
}

fn parse_f32(s: Option<&str>, what: &str) -> Result<f32> {
    let s = s.ok_or_else(|| anyhow!("missing {}", what))?;
    s.parse::<f32>().map_err(|e| anyhow!("invalid {} '{}': {}", what, s, e))
}

// `<id> <rest of line>`
fn split_id(rest: &str) -> Result<(NodeId, &str)> {
    let (id, tail) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    Ok((parse_id(Some(id))?, tail.trim()))
}

fn exec_branch(session: &mut CanvasSession, rest: &str) -> Result<Step> {
    let mut parts = rest.splitn(3, char::is_whitespace);
    let parent = parse_id(parts.next())?;
    let idx = parts.next().ok_or_else(|| anyhow!("missing message index"))?;
    let idx: usize = idx.parse().map_err(|e| anyhow!("invalid message index '{}': {}", idx, e))?;
    let title = parts.next().map(|t| t.trim().trim_matches('"').to_string()).filter(|t| !t.is_empty());
    let id = session.create_branch(parent, idx, title)?;
    Ok(Step::write(vec![CommandRow::node(session.graph().node(id)?)], 1))
}

fn exec_delete(session: &mut CanvasSession, rest: &str) -> Result<Step> {
    let removed = session.delete_node(parse_id(Some(rest))?)?;
    let n = removed.len();
    Ok(Step::write(vec![CommandRow::info(format!("removed {:?}", removed))], n))
}

fn exec_drag(session: &mut CanvasSession, rest: &str) -> Result<Step> {
    let mut parts = rest.split_whitespace();
    let id = parse_id(parts.next())?;
    let dx = parse_f32(parts.next(), "dx")?;
    let dy = parse_f32(parts.next(), "dy")?;
    session.drag_node(id, dx, dy)?;
    Ok(Step::write(vec![CommandRow::node(session.graph().node(id)?)], 1))
}

fn exec_select(session: &mut CanvasSession, rest: &str) -> Result<Step> {
    let mut parts = rest.split_whitespace();
    let id = parse_id(parts.next())?;
    let cursor = match parts.next() {
        Some(i) => session.select_message(id, i.parse().map_err(|e| anyhow!("invalid message index '{}': {}", i, e))?)?,
        None => session.select_node(id)?,
    };
    Ok(Step::read(vec![CommandRow::Cursor { node: cursor.node, message_index: cursor.message_index }]))
}

fn exec_nav(session: &mut CanvasSession, rest: &str) -> Result<Step> {
    let dir: Direction = rest.parse().map_err(|e| anyhow!("{}", e))?;
    let row = match session.navigate(dir) {
        Some(c) => CommandRow::Cursor { node: c.node, message_index: c.message_index },
        None => CommandRow::info("no move"),
    };
    Ok(Step::read(vec![row]))
}

fn exec_center(session: &mut CanvasSession, rest: &str) -> Result<Step> {
    let id = parse_id(Some(rest))?;
    session.center_on_node(id)?;
    Ok(Step::read(vec![CommandRow::info(format!("centering on {}", id))]))
}

fn exec_layout(session: &mut CanvasSession, rest: &str) -> Result<Step> {
    let mode: LayoutMode = rest.parse().map_err(|e| anyhow!("{}", e))?;
    session.set_layout_mode(mode)?;
    Ok(Step::write(vec![CommandRow::info(format!("layout {}", mode.label()))], 0))
}

fn exec_show(session: &mut CanvasSession, rest: &str) -> Result<Step> {
    let node = session.graph().node(parse_id(Some(rest))?)?;
    let mut rows = vec![CommandRow::node(node)];
    rows.extend(node.messages.iter().enumerate().map(|(i, m)| message_row(node.id, i, m)));
    Ok(Step::read(rows))
}

fn message_row(node: NodeId, index: usize, m: &Message) -> CommandRow {
    let role = serde_json::to_value(m.role).ok().and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default();
    CommandRow::Message { node, index, role, content: m.content.clone() }
}

fn exec_search(session: &mut CanvasSession, rest: &str) -> Result<Step> {
    let query = rest.trim_matches('"');
    let hits = session.search_now(query).to_vec();
    let graph = session.graph();
    Ok(Step::read(hits.into_iter().filter_map(|id| graph.get(id)).map(CommandRow::node).collect()))
}

fn exec_append(session: &mut CanvasSession, rest: &str, assistant: bool) -> Result<Step> {
    let (id, text) = split_id(rest)?;
    if text.is_empty() {
        return Err(anyhow!("missing message text"));
    }
    let message = if assistant { Message::assistant(text) } else { Message::user(text) };
    let report = session.ingest_message(id, message)?;
    let mut rows = vec![CommandRow::node(session.graph().node(id)?)];
    for p in &report.previews {
        rows.push(CommandRow::node(session.graph().node(*p)?));
    }
    Ok(Step::write(rows, 1 + report.previews.len()))
}

fn exec_ask(session: &mut CanvasSession, rest: &str) -> Result<Step> {
    let (id, text) = split_id(rest)?;
    let ticket = session.send_message(id, text)?;
    Ok(Step::write(vec![CommandRow::info(format!("generation {} queued on node {}", ticket.seq, ticket.node))], 1))
}

fn exec_export(session: &mut CanvasSession) -> Result<Step> {
    let json = serde_json::to_string(&session.serialize_graph())?;
    Ok(Step::read(vec![CommandRow::info(json)]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CanvasConfig;

    fn session() -> CanvasSession {
        let mut s = CanvasSession::new(CanvasConfig::default(), "Main");
        execute_command(&mut s, "SAY 1 hello; REPLY 1 hi there; SAY 1 and then").unwrap();
        s
    }

    #[test]
    fn statements_run_in_order() {
        let mut s = session();
        let out = execute_command(&mut s, "branch 1 1 side quest; list").unwrap();
        assert!(out.mutated);
        assert_eq!(out.affected_nodes, 1);
        // the created node row plus two LIST rows
        assert_eq!(out.rows.len(), 3);
        assert!(matches!(&out.rows[0], CommandRow::Node { title, fork: Some(1), .. } if title == "side quest"));
    }

    #[test]
    fn first_failure_aborts() {
        let mut s = session();
        assert!(execute_command(&mut s, "DELETE 1").is_err());
        assert!(execute_command(&mut s, "FROB 2").is_err());
        assert!(execute_command(&mut s, "   ").is_err());
        assert_eq!(s.graph().len(), 1);
    }

    #[test]
    fn nav_and_search() {
        let mut s = session();
        execute_command(&mut s, "SELECT 1 2").unwrap();
        let out = execute_command(&mut s, "NAV up").unwrap();
        assert_eq!(out.rows, vec![CommandRow::Cursor { node: 1, message_index: 1 }]);
        let out = execute_command(&mut s, "SEARCH hi there").unwrap();
        assert_eq!(out.rows.len(), 1);
    }
}
