//! Stack orchestration
//!
//! Turns a declarative stack request into a dependency-ordered
//! provisioning plan, drives the per-kind controllers, records outputs,
//! and rolls back partial failures.

mod graph;
mod orchestrator;
mod request;

pub use graph::{substitute_placeholders, topo_order, GraphError};
pub use orchestrator::{
    OrchestratorError, StackInfo, StackOrchestrator, StackResourceInfo,
};
pub use request::{CreateStackRequest, StackResourceRequest};
