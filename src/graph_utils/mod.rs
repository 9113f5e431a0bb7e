pub mod branch;
pub mod graph;
pub mod import;
