//! converge controller: the reconciliation engine. Collaborators (sources,
//! overlay rendering, credentials, status writes) are traits so the engine runs
//! against a live cluster or entirely in memory.

#![forbid(unsafe_code)]

pub mod collaborators;
pub mod config;
pub mod gate;
pub mod mock;
pub mod reconciler;
pub mod render;
pub mod scheduler;

pub use collaborators::{Artifact, CredentialResolver, OverlayRenderer, RenderRequest, SourceProvider, StatusWriter};
pub use config::ControllerConfig;
pub use gate::{check_dependencies, DependencyGraph, GateError, GraphCache};
pub use reconciler::{Outcome, ReconcileError, ReconcileResult, Reconciler};
pub use render::KustomizeCommand;
pub use scheduler::Scheduler;
