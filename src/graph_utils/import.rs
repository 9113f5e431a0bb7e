//! Builds a conversation graph from the analytics backend's branched-chat
//! export (`main_branch` plus `branches` keyed by branch id).

use std::collections::BTreeMap;

use log::warn;
use serde::Deserialize;

use super::branch::{self, BranchTemplate};
use super::graph::{ConversationGraph, Message, NodeId, Role};
use crate::config::BranchConfig;
use crate::error::CanvasResult;

#[derive(Debug, Clone, Deserialize)]
pub struct ExportedMessage {
    pub message_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub sender: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportedBranch {
    pub parent_message: ExportedMessage,
    #[serde(default)]
    pub branch_messages: Vec<ExportedMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BranchedChat {
    #[serde(default)]
    pub main_branch: Vec<ExportedMessage>,
    #[serde(default)]
    pub branches: BTreeMap<String, ExportedBranch>,
}

impl From<&ExportedMessage> for Message {
    fn from(m: &ExportedMessage) -> Self {
        let role = match m.sender.as_str() {
            "human" | "user" => Role::User,
            _ => Role::Assistant,
        };
        Message {
            role,
            content: m.text.clone(),
            timestamp: m.timestamp.clone(),
            message_id: m.message_id.clone(),
        }
    }
}

// Locate the node and index holding a message id
fn find_message(graph: &ConversationGraph, message_id: &str) -> Option<(NodeId, usize)> {
    graph.nodes().find_map(|n| {
        n.messages
            .iter()
            .position(|m| m.message_id == message_id)
            .map(|i| (n.id, i))
    })
}

/// Branches whose parent message cannot be found (yet) are retried after
/// the others so nested branches resolve regardless of map order; ones that
/// never resolve are skipped with a warning.
pub fn graph_from_branched_chat(title: &str, chat: &BranchedChat, cfg: &BranchConfig) -> CanvasResult<ConversationGraph> {
    let mut graph = ConversationGraph::with_main(title);
    let main_id = graph.main_id().unwrap_or(super::graph::MAIN_NODE_ID);
    if let Some(main) = graph.get_mut(main_id) {
        main.messages = chat.main_branch.iter().map(Message::from).collect();
        main.context_messages = main.messages.clone();
    }

    let mut pending: Vec<(&String, &ExportedBranch)> = chat.branches.iter().collect();
    loop {
        let before = pending.len();
        let mut still_pending = Vec::new();
        for (branch_id, b) in pending {
            let Some((parent, index)) = find_message(&graph, &b.parent_message.message_id) else {
                still_pending.push((branch_id, b));
                continue;
            };
            let node = branch::create_branch(&graph, parent, index, BranchTemplate::with_id(graph.next_id()), cfg)?;
            let id = graph.add(node)?;
            if let Some(n) = graph.get_mut(id) {
                for m in &b.branch_messages {
                    let msg = Message::from(m);
                    n.messages.push(msg.clone());
                    n.context_messages.push(msg);
                }
            }
        }
        pending = still_pending;
        if pending.is_empty() || pending.len() == before {
            break;
        }
    }
    for (branch_id, _) in pending {
        warn!("branch {} references an unknown parent message; skipped", branch_id);
    }
    Ok(graph)
}
