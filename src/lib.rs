//! Tangent-Loom: a canvas for branching AI conversations.
//!
//! The engine (`graph_utils`, `layout`, `viewport`, `navigation`, `stream`)
//! is plain synchronous code owned by `session::CanvasSession`. Network
//! backends live in `services` and run on their own thread.

pub mod api;
pub mod commands;
pub mod config;
pub mod error;
pub mod graph_utils;
pub mod gui;
pub mod layout;
pub mod navigation;
pub mod persistence;
pub mod services;
pub mod session;
pub mod stream;
pub mod viewport;
