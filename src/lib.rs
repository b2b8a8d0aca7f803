//! AgentFlow: multi-stage email routing core.

pub mod api;
pub mod company;
pub mod config;
pub mod error;
pub mod knowledge;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod store;
