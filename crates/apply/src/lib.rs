//! converge apply: manifest parsing, declared-vs-live diffing, ordered server-side
//! apply and inventory-driven pruning.

#![forbid(unsafe_code)]

pub mod diff;
pub mod engine;
pub mod manifest;
pub mod order;

pub use diff::{applied_checksum, diff_summary, strip_noisy, DiffSummary};
pub use engine::{ApplyEngine, ApplyError, ApplyOptions, ApplyReport, Change};
pub use manifest::{parse_manifests, ManifestError, ManifestLimits};
